use flacenc::component::{BitRepr, Stream};
use flacenc::config;
use flacenc::error::{Verified, Verify};
use flacenc::source::{Fill, FrameBuf};

/// Latency/bandwidth profile for the FLAC stream. Selects how many
/// overlap-add frames are batched into one encoded block; the block size is
/// always an exact multiple of the frame so the encoder never buffers a
/// partial frame (a mismatch there is audible as tremor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlacMode {
    /// One frame per block; smallest latency, most packets.
    UltraLowLatency,
    /// ~20 ms blocks.
    Balanced,
    /// ~80 ms blocks; fewer, better-compressed packets.
    LowBandwidth,
}

impl FlacMode {
    /// `FLAC_MODE` environment override: `UltraLowLatency`, `lowbw`, or
    /// unset/anything else for `Balanced`.
    pub fn from_env() -> Self {
        match std::env::var("FLAC_MODE").as_deref() {
            Ok("UltraLowLatency") => Self::UltraLowLatency,
            Ok("lowbw") => Self::LowBandwidth,
            _ => Self::Balanced,
        }
    }

    fn target_block_secs(self) -> f64 {
        match self {
            Self::UltraLowLatency => 0.0,
            Self::Balanced => 0.020,
            Self::LowBandwidth => 0.080,
        }
    }

    /// Block size in samples per channel: the smallest whole multiple of
    /// `frame_samples` reaching the target duration.
    pub fn block_size(self, frame_samples: usize, sample_rate: usize) -> usize {
        let frame_samples = frame_samples.max(1);
        let target = (self.target_block_secs() * sample_rate as f64).ceil() as usize;
        let frames = target.div_ceil(frame_samples).max(1);
        frame_samples * frames
    }
}

pub struct FlacStreamEncoder {
    cfg: Verified<config::Encoder>,
    stream: Stream,
    frame_number: u64,
    block_size: usize,
    channels: usize,
    frame_buf: FrameBuf,
}

impl FlacStreamEncoder {
    pub fn new(
        sample_rate: usize,
        channels: usize,
        bits_per_sample: usize,
        block_size: usize,
    ) -> anyhow::Result<Self> {
        let cfg = config::Encoder::default()
            .into_verified()
            .map_err(|e| anyhow::anyhow!("flac config verify: {e:?}"))?;

        let mut stream = Stream::new(sample_rate, channels, bits_per_sample)
            .map_err(|e| anyhow::anyhow!("flac streaminfo: {e:?}"))?;
        stream
            .stream_info_mut()
            .set_block_sizes(block_size, block_size)
            .map_err(|e| anyhow::anyhow!("flac set block sizes: {e:?}"))?;

        let frame_buf = FrameBuf::with_size(channels, block_size)
            .map_err(|e| anyhow::anyhow!("flac framebuf: {e:?}"))?;

        Ok(Self {
            cfg,
            stream,
            frame_number: 0,
            block_size,
            channels,
            frame_buf,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// `fLaC` marker plus STREAMINFO; sent to the client before any frames,
    /// and again whenever the encoder is rebuilt with a new channel count.
    pub fn header_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut sink = flacenc::bitsink::MemSink::<u8>::new();
        self.stream
            .write(&mut sink)
            .map_err(|e| anyhow::anyhow!("flac header write: {e:?}"))?;
        Ok(sink.into_inner())
    }

    /// Encodes exactly one block of interleaved PCM
    /// (`block_size * channels` samples).
    pub fn encode_block(&mut self, pcm_i32: &[i32]) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(
            pcm_i32.len() == self.block_size * self.channels,
            "flac block size mismatch (expected {}, got {})",
            self.block_size * self.channels,
            pcm_i32.len()
        );

        self.frame_buf
            .fill_interleaved(pcm_i32)
            .map_err(|e| anyhow::anyhow!("flac fill interleaved: {e:?}"))?;

        let frame = flacenc::encode_fixed_size_frame(
            &self.cfg,
            &self.frame_buf,
            self.frame_number as usize,
            self.stream.stream_info(),
        )
        .map_err(|e| anyhow::anyhow!("flac encode frame: {e:?}"))?;
        self.frame_number += 1;

        let mut sink = flacenc::bitsink::MemSink::<u8>::new();
        frame
            .write(&mut sink)
            .map_err(|e| anyhow::anyhow!("flac frame write: {e:?}"))?;
        Ok(sink.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_always_a_frame_multiple() {
        for mode in [
            FlacMode::UltraLowLatency,
            FlacMode::Balanced,
            FlacMode::LowBandwidth,
        ] {
            // 394 is the classic awkward frame size (audio_fft_size/2).
            let block = mode.block_size(394, 12000);
            assert_eq!(block % 394, 0, "{mode:?}");
            assert!(block >= 394);
        }
        assert_eq!(FlacMode::UltraLowLatency.block_size(394, 12000), 394);
        // Balanced at 12 kHz wants >= 240 samples; one 394 frame suffices.
        assert_eq!(FlacMode::Balanced.block_size(394, 12000), 394);
        // LowBandwidth wants >= 960 samples; three frames.
        assert_eq!(FlacMode::LowBandwidth.block_size(394, 12000), 394 * 3);
    }

    #[test]
    fn encodes_non_subset_block_sizes() {
        // Arbitrary (non power-of-two) block sizes must be honored exactly;
        // a silent fallback to 1024 is what caused audible tremor upstream.
        let mut enc = FlacStreamEncoder::new(12000, 1, 16, 394).unwrap();
        let pcm = vec![0i32; 394];
        let frame = enc.encode_block(&pcm).unwrap();
        assert!(!frame.is_empty());
        assert!(enc.encode_block(&pcm[..100]).is_err());
    }
}
