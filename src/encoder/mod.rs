//! Incremental PCM16 encoders feeding the batch upload path.
//!
//! Every encoder accumulates a contiguous byte buffer across
//! [`Encoder::encode_block`] calls; [`Encoder::close`] flushes trailing
//! partial frames, after which [`Encoder::bytes`] is final. Codec internals
//! belong to the codec crates; this module owns only framing and padding.

use std::fmt;
use std::time::Duration;

use anyhow::Result;

mod adaptive;
mod flac;
mod mp3;

pub use adaptive::{AdaptiveEncoder, AdaptiveThresholds};
pub use flac::FlacEncoder;
pub use mp3::Mp3Encoder;

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u32 = 1;
pub const BITS_PER_SAMPLE: u32 = 16;

/// Samples per block handed to the encode worker.
pub const BLOCK_SIZE: usize = 4096;

/// Upload format selected on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Mp3At16,
    Mp3At64,
    Flac,
    Adaptive,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "mp3@16" => Some(Format::Mp3At16),
            "mp3@64" => Some(Format::Mp3At64),
            "flac" => Some(Format::Flac),
            "adaptive" => Some(Format::Adaptive),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Mp3At16 => "mp3@16",
            Format::Mp3At64 => "mp3@64",
            Format::Flac => "flac",
            Format::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

pub trait Encoder: Send {
    /// Submit a block of mono PCM16 samples. Infallible at the contract
    /// level: internal codec errors are logged and the frame is skipped.
    fn encode_block(&mut self, block: &[i16]);

    /// Flush trailing samples and finalize the byte stream.
    fn close(&mut self) -> Result<()>;

    /// Encoded output. Final only after `close`.
    fn bytes(&self) -> &[u8];

    /// Cumulative count of samples submitted, independent of output size.
    fn total_frames(&self) -> u64;

    /// Cumulative CPU time spent inside the encoder.
    fn encode_time(&self) -> Duration;

    /// Wire format for the provider request ("mp3" or "flac").
    fn api_format(&self) -> &'static str;

    /// Human-readable label for metric lines ("mp3@16", "flac", ...).
    fn label(&self) -> String;

    /// Pick the output variant under `threshold` bytes. Only meaningful for
    /// the adaptive encoder; a no-op elsewhere.
    fn select(&mut self, _threshold: usize) {}
}

pub fn new_encoder(format: Format) -> Result<Box<dyn Encoder>> {
    match format {
        Format::Mp3At16 => Ok(Box::new(Mp3Encoder::new(16)?)),
        Format::Mp3At64 => Ok(Box::new(Mp3Encoder::new(64)?)),
        Format::Flac => Ok(Box::new(FlacEncoder::new())),
        Format::Adaptive => Ok(Box::new(AdaptiveEncoder::new()?)),
    }
}

#[cfg(test)]
pub(crate) fn sine_samples(freq: f64, amplitude: f64, count: usize) -> Vec<i16> {
    (0..count)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE as f64;
            ((t * freq * 2.0 * std::f64::consts::PI).sin() * amplitude) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_known_names() {
        assert_eq!(Format::parse("mp3@16"), Some(Format::Mp3At16));
        assert_eq!(Format::parse("mp3@64"), Some(Format::Mp3At64));
        assert_eq!(Format::parse("flac"), Some(Format::Flac));
        assert_eq!(Format::parse("adaptive"), Some(Format::Adaptive));
        assert_eq!(Format::parse("wav"), None);
    }

    #[test]
    fn total_frames_tracks_input_across_chunkings() {
        // The frame count must equal the samples fed, regardless of how the
        // input is split and independent of output size.
        let samples = sine_samples(440.0, 16_000.0, 10_000);
        for chunk in [1usize, 7, 320, 576, 4096, 10_000] {
            let mut enc = Mp3Encoder::new(16).expect("mp3 encoder");
            for block in samples.chunks(chunk) {
                enc.encode_block(block);
            }
            enc.close().expect("close");
            assert_eq!(enc.total_frames(), samples.len() as u64, "chunk={chunk}");
        }
    }
}
