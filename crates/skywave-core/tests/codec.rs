use skywave_core::codec::flac_stream::{FlacMode, FlacStreamEncoder};
use skywave_core::codec::zstd_stream::WaterfallStreamEncoder;
use skywave_core::codec::{AudioCodec, StreamEncoder};
use zstd_safe::{DCtx, InBuffer, OutBuffer};

#[test]
fn flac_header_starts_with_magic() {
    let enc = FlacStreamEncoder::new(12_000, 1, 16, 512).unwrap();
    let header = enc.header_bytes().unwrap();
    assert!(header.starts_with(b"fLaC"));
}

#[test]
fn flac_stereo_header_also_carries_magic() {
    let enc = FlacStreamEncoder::new(12_000, 2, 16, 394).unwrap();
    let header = enc.header_bytes().unwrap();
    assert!(header.starts_with(b"fLaC"));
}

fn zstd_decompress(pkt: &[u8]) -> Vec<u8> {
    let mut dctx = DCtx::create();
    let mut dst = vec![0u8; 8192];
    let pos = {
        let mut out_buf = OutBuffer::around(&mut dst[..]);
        let mut in_buf = InBuffer::around(pkt);
        while in_buf.pos < in_buf.src.len() && out_buf.pos() < out_buf.capacity() {
            let _ = dctx.decompress_stream(&mut out_buf, &mut in_buf).unwrap();
        }
        out_buf.pos()
    };
    dst.truncate(pos);
    dst
}

#[test]
fn waterfall_rows_roundtrip_with_level_scaled_bins() {
    let mut enc = WaterfallStreamEncoder::new().unwrap();
    let row: Vec<i8> = (0..64).map(|v| (v as i8).wrapping_mul(3)).collect();
    let pkt = enc.encode_row(42, 2, 8, 72, &row).unwrap();
    assert!(!pkt.is_empty());

    let cbor = zstd_decompress(&pkt);
    let value: serde_cbor::Value = serde_cbor::from_slice(&cbor).unwrap();
    let serde_cbor::Value::Map(map) = value else {
        panic!("waterfall packet is not a map");
    };
    // Bin indices are published in level-0 coordinates.
    let key = serde_cbor::Value::Text("l".into());
    assert_eq!(map.get(&key), Some(&serde_cbor::Value::Integer(8 << 2)));
    let key = serde_cbor::Value::Text("r".into());
    assert_eq!(map.get(&key), Some(&serde_cbor::Value::Integer(72 << 2)));
    let key = serde_cbor::Value::Text("data".into());
    let Some(serde_cbor::Value::Bytes(data)) = map.get(&key) else {
        panic!("waterfall packet has no data bytes");
    };
    assert_eq!(data.len(), row.len());
    assert_eq!(data[1] as i8, 3);
}

#[test]
fn waterfall_stream_context_persists_across_rows() {
    // Later rows of the same stream compress against the shared window;
    // a repeated row must come out smaller than the first one.
    let mut enc = WaterfallStreamEncoder::new().unwrap();
    let row: Vec<i8> = (0..1024).map(|v| ((v * 7) % 251) as i8).collect();
    let first = enc.encode_row(0, 0, 0, 1024, &row).unwrap();
    let second = enc.encode_row(1, 0, 0, 1024, &row).unwrap();
    assert!(
        second.len() < first.len(),
        "expected the stream window to help: {} vs {}",
        second.len(),
        first.len()
    );
}

fn packet_channels(pkt: &[u8]) -> i128 {
    let value: serde_cbor::Value = serde_cbor::from_slice(pkt).unwrap();
    let serde_cbor::Value::Map(map) = value else {
        panic!("packet is not a map");
    };
    let key = serde_cbor::Value::Text("channels".into());
    let Some(serde_cbor::Value::Integer(ch)) = map.get(&key) else {
        panic!("packet has no channels field");
    };
    *ch
}

#[test]
fn channel_reconfiguration_round_trips_exactly() {
    let frame = 256usize;
    let mut enc =
        StreamEncoder::new(AudioCodec::Flac, 12_000, 1, frame, FlacMode::UltraLowLatency).unwrap();

    let mono_pkts = enc.process_samples(&vec![0i32; frame]).unwrap();
    assert_eq!(mono_pkts.len(), 1);
    assert_eq!(packet_channels(&mono_pkts[0]), 1);

    // Mono -> stereo -> mono; every packet's channel metadata matches the
    // configuration in force when it was produced.
    enc.reconfigure_channels(2).unwrap();
    let stereo_pkts = enc.process_samples(&vec![0i32; frame * 2]).unwrap();
    assert_eq!(stereo_pkts.len(), 1);
    assert_eq!(packet_channels(&stereo_pkts[0]), 2);

    enc.reconfigure_channels(1).unwrap();
    let mono_again = enc.process_samples(&vec![0i32; frame]).unwrap();
    assert_eq!(mono_again.len(), 1);
    assert_eq!(packet_channels(&mono_again[0]), 1);
}

#[test]
fn reconfigure_drops_buffered_partial_blocks() {
    let frame = 256usize;
    let mut enc =
        StreamEncoder::new(AudioCodec::Flac, 12_000, 1, frame, FlacMode::LowBandwidth).unwrap();
    // LowBandwidth batches several frames; feed a partial block then flip
    // channels. The partial block must not leak into the stereo stream.
    assert!(enc.process_samples(&vec![0i32; frame]).unwrap().is_empty());
    enc.reconfigure_channels(2).unwrap();
    let pkts = enc.process_samples(&vec![0i32; frame * 2]).unwrap();
    for p in &pkts {
        assert_eq!(packet_channels(p), 2);
    }
}

#[test]
fn opus_stream_emits_packets_with_metadata() {
    let mut enc =
        StreamEncoder::new(AudioCodec::Opus, 12_000, 1, 240, FlacMode::Balanced).unwrap();
    assert!(enc.header_packet().unwrap().is_none(), "opus has no header");
    let pkts = enc.process_samples(&vec![0i32; 240]).unwrap();
    assert_eq!(pkts.len(), 1);
    assert_eq!(packet_channels(&pkts[0]), 1);
}
