use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::error::Verify;
use flacenc::source::MemSource;

use super::{Encoder, BITS_PER_SAMPLE, BLOCK_SIZE, CHANNELS, SAMPLE_RATE};

/// Lossless FLAC output with a fixed 4096-sample block ceiling.
///
/// flacenc's verified-stream API encodes a complete source, so blocks are
/// staged in memory and the stream is assembled at `close`; the contract is
/// unchanged: `encode_block` is infallible, `total_frames` exact, `bytes`
/// final after close.
pub struct FlacEncoder {
    samples: Vec<i32>,
    buf: Vec<u8>,
    total_frames: u64,
    encode_time: Duration,
}

impl FlacEncoder {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            buf: Vec::new(),
            total_frames: 0,
            encode_time: Duration::ZERO,
        }
    }
}

impl Default for FlacEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for FlacEncoder {
    fn encode_block(&mut self, block: &[i16]) {
        let start = Instant::now();
        self.total_frames += block.len() as u64;
        self.samples.extend(block.iter().map(|&s| i32::from(s)));
        self.encode_time += start.elapsed();
    }

    fn close(&mut self) -> Result<()> {
        let start = Instant::now();
        let config = flacenc::config::Encoder::default()
            .into_verified()
            .map_err(|(_, e)| anyhow!("flac config: {:?}", e))?;
        let source = MemSource::from_samples(
            &self.samples,
            CHANNELS as usize,
            BITS_PER_SAMPLE as usize,
            SAMPLE_RATE as usize,
        );
        let stream = flacenc::encode_with_fixed_block_size(&config, source, BLOCK_SIZE)
            .map_err(|e| anyhow!("flac encode: {:?}", e))?;
        let mut sink = ByteSink::new();
        stream
            .write(&mut sink)
            .map_err(|e| anyhow!("flac serialize: {:?}", e))?;
        self.buf = sink.as_slice().to_vec();
        self.samples = Vec::new();
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
        "flac"
    }

    fn label(&self) -> String {
        "flac".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::sine_samples;
    use super::*;

    #[test]
    fn output_carries_flac_magic_and_tracks_frames() {
        // One second of a 440 Hz tone fed in 4096-sample blocks.
        let samples = sine_samples(440.0, 16_000.0, 16_000);
        let mut enc = FlacEncoder::new();
        for block in samples.chunks(BLOCK_SIZE) {
            enc.encode_block(block);
        }
        enc.close().expect("close");

        let bytes = enc.bytes();
        assert!(bytes.starts_with(b"fLaC"), "missing fLaC magic");
        assert_eq!(enc.total_frames(), 16_000);

        let raw_size = samples.len() * 2;
        assert!(bytes.len() < raw_size * 8, "flac output implausibly large");
    }

    #[test]
    fn bytes_empty_before_close() {
        let mut enc = FlacEncoder::new();
        enc.encode_block(&sine_samples(440.0, 8_000.0, 4096));
        assert!(enc.bytes().is_empty());
        enc.close().expect("close");
        assert!(!enc.bytes().is_empty());
    }
}
