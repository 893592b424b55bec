pub mod flac_stream;
pub mod opus_stream;
pub mod zstd_stream;

use crate::protocol::AudioPacket;
use flac_stream::{FlacMode, FlacStreamEncoder};
use opus_stream::OpusStreamEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Flac,
    Opus,
}

/// Metadata stamped onto every outgoing audio packet. Updated once per
/// spectrum frame; packets emitted from accumulated PCM carry the metadata
/// of the frame that completed them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMeta {
    pub frame_num: u64,
    pub l: i32,
    pub m: f64,
    pub r: i32,
    pub pwr: f64,
}

enum EncoderKind {
    Flac {
        enc: FlacStreamEncoder,
        accum: Vec<i32>,
        offset: usize,
    },
    Opus(OpusStreamEncoder),
}

/// Streaming audio encoder: FLAC or Opus behind one narrow surface
/// (`set_metadata` / `process_samples` / `finish`). Output packets are
/// CBOR-framed `AudioPacket`s ready for the binary channel.
pub struct StreamEncoder {
    meta: PacketMeta,
    kind: EncoderKind,
    codec: AudioCodec,
    sample_rate: usize,
    frame_samples: usize,
    flac_mode: FlacMode,
}

impl StreamEncoder {
    pub fn new(
        codec: AudioCodec,
        sample_rate: usize,
        channels: usize,
        frame_samples: usize,
        flac_mode: FlacMode,
    ) -> anyhow::Result<Self> {
        let kind = Self::build_kind(codec, sample_rate, channels, frame_samples, flac_mode)?;
        Ok(Self {
            meta: PacketMeta::default(),
            kind,
            codec,
            sample_rate,
            frame_samples,
            flac_mode,
        })
    }

    fn build_kind(
        codec: AudioCodec,
        sample_rate: usize,
        channels: usize,
        frame_samples: usize,
        flac_mode: FlacMode,
    ) -> anyhow::Result<EncoderKind> {
        Ok(match codec {
            AudioCodec::Flac => {
                let block_size = flac_mode.block_size(frame_samples, sample_rate);
                let enc = FlacStreamEncoder::new(sample_rate, channels, 16, block_size)?;
                EncoderKind::Flac {
                    enc,
                    accum: Vec::with_capacity(block_size * channels * 4),
                    offset: 0,
                }
            }
            AudioCodec::Opus => EncoderKind::Opus(OpusStreamEncoder::new(sample_rate, channels)?),
        })
    }

    pub fn channels(&self) -> u32 {
        match &self.kind {
            EncoderKind::Flac { enc, .. } => enc.channels() as u32,
            EncoderKind::Opus(enc) => enc.channels() as u32,
        }
    }

    pub fn set_metadata(&mut self, meta: PacketMeta) {
        self.meta = meta;
    }

    /// Stream header packet, for codecs that have one (FLAC). Sent on
    /// connect and after every channel-count reconfiguration.
    pub fn header_packet(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.kind {
            EncoderKind::Flac { enc, .. } => {
                let header = enc.header_bytes()?;
                let pkt = self.wrap(PacketMeta::default(), &header)?;
                Ok(Some(pkt))
            }
            EncoderKind::Opus(_) => Ok(None),
        }
    }

    /// Consumes one frame of interleaved PCM and returns zero or more wire
    /// packets, depending on how much the codec has accumulated.
    pub fn process_samples(&mut self, interleaved: &[i32]) -> anyhow::Result<Vec<Vec<u8>>> {
        let meta = self.meta;
        let mut packets = Vec::new();
        match &mut self.kind {
            EncoderKind::Flac { enc, accum, offset } => {
                accum.extend_from_slice(interleaved);
                let block_units = enc.block_size() * enc.channels();
                loop {
                    let available = accum.len().saturating_sub(*offset);
                    if available < block_units {
                        break;
                    }
                    let end = *offset + block_units;
                    let bytes = enc.encode_block(&accum[*offset..end])?;
                    *offset = end;
                    if *offset >= block_units * 4 {
                        accum.drain(0..*offset);
                        *offset = 0;
                    }
                    packets.push(bytes);
                }
            }
            EncoderKind::Opus(enc) => {
                packets = enc.encode_interleaved(interleaved)?;
            }
        }
        packets
            .iter()
            .map(|data| self.wrap(meta, data))
            .collect::<anyhow::Result<Vec<_>>>()
    }

    /// Flushes the current stream state. Called before the encoder is
    /// replaced on a channel-count change; buffered partial blocks are
    /// dropped rather than padded.
    pub fn finish(&mut self) {
        match &mut self.kind {
            EncoderKind::Flac { accum, offset, .. } => {
                accum.clear();
                *offset = 0;
            }
            EncoderKind::Opus(enc) => enc.finish(),
        }
    }

    /// Finishes the running stream and rebuilds it with a new channel
    /// count. Returns the new stream header packet, if the codec has one.
    pub fn reconfigure_channels(&mut self, channels: usize) -> anyhow::Result<Option<Vec<u8>>> {
        self.finish();
        self.kind = Self::build_kind(
            self.codec,
            self.sample_rate,
            channels,
            self.frame_samples,
            self.flac_mode,
        )?;
        self.header_packet()
    }

    fn wrap(&self, meta: PacketMeta, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let pkt = AudioPacket {
            frame_num: meta.frame_num,
            l: meta.l,
            m: meta.m,
            r: meta.r,
            pwr: meta.pwr,
            channels: self.channels(),
            data,
        };
        Ok(serde_cbor::to_vec(&pkt)?)
    }
}
