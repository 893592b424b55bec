use audiopus::coder::Encoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};

const MAX_PACKET: usize = 4096;

/// Smallest supported Opus rate at or above the requested one; libopus only
/// accepts 8/12/16/24/48 kHz, with the request clamped into that range.
fn clamp_sample_rate(requested: usize) -> SampleRate {
    match requested {
        0..=8000 => SampleRate::Hz8000,
        8001..=12000 => SampleRate::Hz12000,
        12001..=16000 => SampleRate::Hz16000,
        16001..=24000 => SampleRate::Hz24000,
        _ => SampleRate::Hz48000,
    }
}

pub struct OpusStreamEncoder {
    encoder: Encoder,
    channels: usize,
    /// Samples per channel in one 20 ms frame.
    frame_size: usize,
    partial: Vec<i16>,
    packet: [u8; MAX_PACKET],
}

impl OpusStreamEncoder {
    pub fn new(sample_rate: usize, channels: usize) -> anyhow::Result<Self> {
        let channels = if channels == 2 { 2 } else { 1 };
        let rate = clamp_sample_rate(sample_rate);
        let rate_hz = rate as i32 as usize;
        let opus_channels = if channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };
        let mut encoder = Encoder::new(rate, opus_channels, Application::Audio)
            .map_err(|e| anyhow::anyhow!("opus encoder create: {e:?}"))?;

        let bitrate = if channels == 2 { 128_000 } else { 80_000 };
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|e| anyhow::anyhow!("opus set bitrate: {e:?}"))?;

        // 20 ms frames.
        let frame_size = rate_hz / 50;

        Ok(Self {
            encoder,
            channels,
            frame_size,
            partial: Vec::new(),
            packet: [0u8; MAX_PACKET],
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Buffers interleaved PCM (int32 clipped to int16 range) and encodes
    /// every complete 20 ms frame. Returns one packet per encoded frame.
    pub fn encode_interleaved(&mut self, pcm_i32: &[i32]) -> anyhow::Result<Vec<Vec<u8>>> {
        for s in pcm_i32 {
            self.partial.push((*s).clamp(-32768, 32767) as i16);
        }

        let samples_per_frame = self.frame_size * self.channels;
        let mut out = Vec::new();
        while self.partial.len() >= samples_per_frame {
            let frame: Vec<i16> = self.partial.drain(..samples_per_frame).collect();
            let written = self
                .encoder
                .encode(&frame, &mut self.packet)
                .map_err(|e| anyhow::anyhow!("opus encode: {e:?}"))?;
            if written > 1 {
                out.push(self.packet[..written].to_vec());
            }
        }
        Ok(out)
    }

    /// Drops any buffered partial frame.
    pub fn finish(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_clamp_picks_supported_rates() {
        assert_eq!(clamp_sample_rate(4000), SampleRate::Hz8000);
        assert_eq!(clamp_sample_rate(12000), SampleRate::Hz12000);
        assert_eq!(clamp_sample_rate(22050), SampleRate::Hz24000);
        assert_eq!(clamp_sample_rate(44100), SampleRate::Hz48000);
        assert_eq!(clamp_sample_rate(96000), SampleRate::Hz48000);
    }

    #[test]
    fn partial_frames_are_buffered_until_complete() {
        let mut enc = OpusStreamEncoder::new(12000, 1).unwrap();
        // 20 ms at 12 kHz = 240 samples.
        let packets = enc.encode_interleaved(&vec![0i32; 100]).unwrap();
        assert!(packets.is_empty());
        let packets = enc.encode_interleaved(&vec![0i32; 140]).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn int32_input_is_clipped_not_wrapped() {
        let mut enc = OpusStreamEncoder::new(12000, 1).unwrap();
        let loud = vec![1_000_000i32; 240];
        let packets = enc.encode_interleaved(&loud).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn stereo_frames_consume_interleaved_pairs() {
        let mut enc = OpusStreamEncoder::new(12000, 2).unwrap();
        let packets = enc.encode_interleaved(&vec![0i32; 240 * 2]).unwrap();
        assert_eq!(packets.len(), 1);
    }
}
