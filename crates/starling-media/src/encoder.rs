use anyhow::Result;
use audiopus::coder::Encoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};

use crate::mixer::FRAME_SAMPLES;

/// Largest Opus packet we expect the encoder to produce for one frame.
pub const MAX_PACKET_LEN: usize = 4096;

/// Stereo 48kHz Opus encoder for the mixed channel signal.
pub struct VoiceEncoder {
    encoder: Encoder,
}

impl VoiceEncoder {
    pub fn new(bitrate_kbps: u32) -> Result<Self> {
        let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
            .map_err(|e| anyhow::anyhow!("failed to create Opus encoder: {e:?}"))?;
        let bits = bitrate_kbps.max(1) as i32 * 1000;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bits))
            .map_err(|e| anyhow::anyhow!("failed to set Opus bitrate: {e:?}"))?;
        Ok(Self { encoder })
    }

    /// Encode one 20ms stereo frame into `out`, returning the packet length.
    pub fn encode(&mut self, frame: &[i16], out: &mut [u8]) -> Result<usize> {
        debug_assert_eq!(frame.len(), FRAME_SAMPLES);
        self.encoder
            .encode(frame, out)
            .map_err(|e| anyhow::anyhow!("Opus encode error: {e:?}"))
    }
}

// The raw encoder state is only ever driven from behind the recording mutex.
unsafe impl Send for VoiceEncoder {}
