use std::time::Duration;

use anyhow::{anyhow, Result};

use super::{Encoder, FlacEncoder, Mp3Encoder};

/// Size buckets picked from the warmup TLS handshake latency: a fast link
/// can afford the lossless upload, a slow one gets the smallest stream.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveThresholds {
    pub fast_tls: Duration,
    pub medium_tls: Duration,
    pub fast_bytes: usize,
    pub medium_bytes: usize,
    pub slow_bytes: usize,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            fast_tls: Duration::from_millis(100),
            medium_tls: Duration::from_millis(300),
            fast_bytes: 100 * 1024,
            medium_bytes: 60 * 1024,
            slow_bytes: 30 * 1024,
        }
    }
}

impl AdaptiveThresholds {
    pub fn threshold_for_tls(&self, tls: Option<Duration>) -> usize {
        match tls {
            Some(d) if d < self.fast_tls => self.fast_bytes,
            Some(d) if d < self.medium_tls => self.medium_bytes,
            Some(_) => self.slow_bytes,
            None => self.slow_bytes,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Chosen {
    Flac,
    Mp3At64,
    Mp3At16,
}

/// Fans each block out to three sub-encoders and picks the highest-quality
/// output that fits the size threshold after close.
pub struct AdaptiveEncoder {
    mp3_16: Mp3Encoder,
    mp3_64: Mp3Encoder,
    flac: FlacEncoder,
    chosen: Chosen,
    total_frames: u64,
}

impl AdaptiveEncoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            mp3_16: Mp3Encoder::new(16)?,
            mp3_64: Mp3Encoder::new(64)?,
            flac: FlacEncoder::new(),
            chosen: Chosen::Flac,
            total_frames: 0,
        })
    }

    pub fn all_sizes(&self) -> (usize, usize, usize) {
        (
            self.flac.bytes().len(),
            self.mp3_64.bytes().len(),
            self.mp3_16.bytes().len(),
        )
    }
}

impl Encoder for AdaptiveEncoder {
    fn encode_block(&mut self, block: &[i16]) {
        self.total_frames += block.len() as u64;
        let (mp3_16, mp3_64, flac) = (&mut self.mp3_16, &mut self.mp3_64, &mut self.flac);
        std::thread::scope(|s| {
            s.spawn(|| mp3_16.encode_block(block));
            s.spawn(|| mp3_64.encode_block(block));
            flac.encode_block(block);
        });
    }

    fn close(&mut self) -> Result<()> {
        let (mp3_16, mp3_64, flac) = (&mut self.mp3_16, &mut self.mp3_64, &mut self.flac);
        let (r16, r64, rflac) = std::thread::scope(|s| {
            let h16 = s.spawn(|| mp3_16.close());
            let h64 = s.spawn(|| mp3_64.close());
            let rflac = flac.close();
            (
                h16.join()
                    .unwrap_or_else(|_| Err(anyhow!("mp3@16 close panicked"))),
                h64.join()
                    .unwrap_or_else(|_| Err(anyhow!("mp3@64 close panicked"))),
                rflac,
            )
        });
        r16?;
        r64?;
        rflac?;
        Ok(())
    }

    fn select(&mut self, threshold: usize) {
        let (flac, mp3_64, _) = self.all_sizes();
        self.chosen = if flac <= threshold {
            Chosen::Flac
        } else if mp3_64 <= threshold {
            Chosen::Mp3At64
        } else {
            Chosen::Mp3At16
        };
    }

    fn bytes(&self) -> &[u8] {
        match self.chosen {
            Chosen::Flac => self.flac.bytes(),
            Chosen::Mp3At64 => self.mp3_64.bytes(),
            Chosen::Mp3At16 => self.mp3_16.bytes(),
        }
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn encode_time(&self) -> Duration {
        // Sub-encoders run concurrently; the slowest one bounds the cost.
        self.mp3_16
            .encode_time()
            .max(self.mp3_64.encode_time())
            .max(self.flac.encode_time())
    }

    fn api_format(&self) -> &'static str {
        match self.chosen {
            Chosen::Flac => "flac",
            _ => "mp3",
        }
    }

    fn label(&self) -> String {
        match self.chosen {
            Chosen::Flac => "flac".to_string(),
            Chosen::Mp3At64 => "mp3@64".to_string(),
            Chosen::Mp3At16 => "mp3@16".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::sine_samples;
    use super::*;

    #[test]
    fn threshold_buckets_follow_tls_latency() {
        let t = AdaptiveThresholds::default();
        assert_eq!(
            t.threshold_for_tls(Some(Duration::from_millis(50))),
            100 * 1024
        );
        assert_eq!(
            t.threshold_for_tls(Some(Duration::from_millis(200))),
            60 * 1024
        );
        assert_eq!(
            t.threshold_for_tls(Some(Duration::from_millis(900))),
            30 * 1024
        );
        assert_eq!(t.threshold_for_tls(None), 30 * 1024);
    }

    #[test]
    fn select_prefers_highest_quality_under_threshold() {
        let samples = sine_samples(440.0, 16_000.0, 16_000);
        let mut enc = AdaptiveEncoder::new().expect("adaptive encoder");
        for block in samples.chunks(4096) {
            enc.encode_block(block);
        }
        enc.close().expect("close");
        assert_eq!(enc.total_frames(), 16_000);

        let (flac, mp3_64, mp3_16) = enc.all_sizes();
        assert!(flac > 0 && mp3_64 > 0 && mp3_16 > 0);

        // A huge threshold keeps FLAC, a tiny one falls through to mp3@16.
        enc.select(usize::MAX);
        assert_eq!(enc.api_format(), "flac");
        enc.select(0);
        assert_eq!(enc.api_format(), "mp3");
        assert_eq!(enc.label(), "mp3@16");
        assert_eq!(enc.bytes().len(), mp3_16);
    }
}
