use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::warn;
use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

use super::{Encoder, SAMPLE_RATE};

/// MPEG-2 Layer III granule at 16 kHz. LAME buffers internally, but feeding
/// whole granules keeps the pending/flush accounting exact.
pub const GRANULE_SIZE: usize = 576;

pub struct Mp3Encoder {
    enc: mp3lame_encoder::Encoder,
    bitrate: u32,
    buf: Vec<u8>,
    pending: Vec<i16>,
    total_frames: u64,
    encode_time: Duration,
}

impl Mp3Encoder {
    pub fn new(bitrate: u32) -> Result<Self> {
        let mut builder = Builder::new().ok_or_else(|| anyhow!("initializing lame encoder"))?;
        builder
            .set_num_channels(1)
            .map_err(|e| anyhow!("lame channels: {}", e))?;
        builder
            .set_sample_rate(SAMPLE_RATE)
            .map_err(|e| anyhow!("lame sample rate: {}", e))?;
        let brate = match bitrate {
            16 => Bitrate::Kbps16,
            64 => Bitrate::Kbps64,
            other => return Err(anyhow!("unsupported mp3 bitrate {}", other)),
        };
        builder
            .set_brate(brate)
            .map_err(|e| anyhow!("lame bitrate: {}", e))?;
        builder
            .set_quality(Quality::Best)
            .map_err(|e| anyhow!("lame quality: {}", e))?;
        let enc = builder.build().map_err(|e| anyhow!("lame build: {}", e))?;
        Ok(Self {
            enc,
            bitrate,
            buf: Vec::new(),
            pending: Vec::new(),
            total_frames: 0,
            encode_time: Duration::ZERO,
        })
    }

    fn write_granules(&mut self, samples: &[i16]) {
        self.buf
            .reserve(mp3lame_encoder::max_required_buffer_size(samples.len()));
        match self.enc.encode(MonoPcm(samples), self.buf.spare_capacity_mut()) {
            Ok(n) => unsafe { self.buf.set_len(self.buf.len() + n) },
            Err(e) => warn!("mp3 encode failed, skipping {} samples: {}", samples.len(), e),
        }
    }
}

impl Encoder for Mp3Encoder {
    fn encode_block(&mut self, block: &[i16]) {
        let start = Instant::now();
        self.total_frames += block.len() as u64;
        self.pending.extend_from_slice(block);

        // Encode complete granules only; the remainder waits for more input.
        let complete = (self.pending.len() / GRANULE_SIZE) * GRANULE_SIZE;
        if complete > 0 {
            let granules: Vec<i16> = self.pending.drain(..complete).collect();
            self.write_granules(&granules);
        }
        self.encode_time += start.elapsed();
    }

    fn close(&mut self) -> Result<()> {
        let start = Instant::now();
        if !self.pending.is_empty() {
            // Zero-pad the tail to one full granule.
            self.pending.resize(GRANULE_SIZE, 0);
            let tail: Vec<i16> = self.pending.drain(..).collect();
            self.write_granules(&tail);
        }
        self.buf
            .reserve(mp3lame_encoder::max_required_buffer_size(GRANULE_SIZE));
        let n = self
            .enc
            .flush::<FlushNoGap>(self.buf.spare_capacity_mut())
            .map_err(|e| anyhow!("lame flush: {}", e))?;
        unsafe { self.buf.set_len(self.buf.len() + n) };
        self.encode_time += start.elapsed();
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn encode_time(&self) -> Duration {
        self.encode_time
    }

    fn api_format(&self) -> &'static str {
        "mp3"
    }

    fn label(&self) -> String {
        format!("mp3@{}", self.bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sine_samples;
    use super::*;

    #[test]
    fn output_starts_with_mpeg_frame_header() {
        let samples = sine_samples(440.0, 16_000.0, 8_000);
        let mut enc = Mp3Encoder::new(16).expect("mp3 encoder");
        for block in samples.chunks(4096) {
            enc.encode_block(block);
        }
        enc.close().expect("close");

        let bytes = enc.bytes();
        assert!(bytes.len() > 4, "no mp3 output produced");
        assert_eq!(bytes[0], 0xFF, "missing frame sync byte");
        assert_eq!(bytes[1] & 0xE0, 0xE0, "missing frame sync bits");

        // 0.5s at 16kbps plus headers stays well under 20 kB/s of audio.
        let duration_s = samples.len() as f64 / SAMPLE_RATE as f64;
        assert!((bytes.len() as f64) < duration_s * 20_000.0);
        assert_eq!(enc.total_frames(), 8_000);
    }

    #[test]
    fn trailing_partial_granule_is_flushed() {
        // 700 samples = one full granule plus a 124-sample tail that must be
        // zero-padded at close rather than dropped.
        let samples = sine_samples(440.0, 8_000.0, 700);
        let mut enc = Mp3Encoder::new(64).expect("mp3 encoder");
        enc.encode_block(&samples);
        let before_close = enc.bytes().len();
        enc.close().expect("close");
        assert!(enc.bytes().len() > before_close);
        assert_eq!(enc.total_frames(), 700);
    }
}
