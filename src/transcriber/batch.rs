//! Batch session: buffer, encode concurrently, one POST at close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::encoder::{self, AdaptiveThresholds, Encoder, Format, BLOCK_SIZE, SAMPLE_RATE};

use super::session::{BatchStats, SessionConfig, SessionResult};
use super::{ProviderResult, TranscribeError, TranscribeFn};

/// Feed side: rechunks PCM bytes into fixed-size sample blocks for the
/// encode worker. Cloned into the capture callback.
#[derive(Clone)]
pub struct BatchFeeder {
    block_tx: mpsc::Sender<Vec<i16>>,
    sample_buf: Arc<Mutex<Vec<i16>>>,
}

impl BatchFeeder {
    pub fn feed(&self, pcm: &[u8]) {
        let mut blocks = Vec::new();
        {
            let mut buf = self.sample_buf.lock().unwrap();
            for pair in pcm.chunks_exact(2) {
                buf.push(i16::from_le_bytes([pair[0], pair[1]]));
            }
            while buf.len() >= BLOCK_SIZE {
                blocks.push(buf.drain(..BLOCK_SIZE).collect::<Vec<i16>>());
            }
        }
        for block in blocks {
            // Capacity 64 gives the worker over 16s of slack; past that the
            // audio thread drops rather than stalls.
            if self.block_tx.try_send(block).is_err() {
                warn!("encode worker backlogged, dropping block");
            }
        }
    }
}

pub struct BatchSession {
    format: Format,
    transcribe: TranscribeFn,
    feeder: BatchFeeder,
    worker: JoinHandle<Box<dyn Encoder>>,
    updates_tx: watch::Sender<String>,
    updates_rx: watch::Receiver<String>,
    tls_latency: Arc<Mutex<Option<Duration>>>,
}

impl BatchSession {
    pub fn new(
        cfg: &SessionConfig,
        transcribe: TranscribeFn,
        tls_latency: Arc<Mutex<Option<Duration>>>,
    ) -> Result<Self, TranscribeError> {
        let mut enc =
            encoder::new_encoder(cfg.format).map_err(|e| TranscribeError::Encode(e.to_string()))?;
        let (block_tx, mut block_rx) = mpsc::channel::<Vec<i16>>(64);

        // An empty block is the close sentinel; the callback's feeder clone
        // keeps the channel open, so sender-drop cannot signal completion.
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(block) = block_rx.blocking_recv() {
                if block.is_empty() {
                    break;
                }
                enc.encode_block(&block);
            }
            enc
        });

        let (updates_tx, updates_rx) = watch::channel(String::new());
        Ok(Self {
            format: cfg.format,
            transcribe,
            feeder: BatchFeeder {
                block_tx,
                sample_buf: Arc::new(Mutex::new(Vec::new())),
            },
            worker,
            updates_tx,
            updates_rx,
            tls_latency,
        })
    }

    pub fn feeder(&self) -> BatchFeeder {
        self.feeder.clone()
    }

    pub fn feed(&self, pcm: &[u8]) {
        self.feeder.feed(pcm);
    }

    pub fn updates(&self) -> watch::Receiver<String> {
        self.updates_rx.clone()
    }

    /// Discard the session without transcribing anything.
    pub async fn abort(self) {
        let _ = self.feeder.block_tx.send(Vec::new()).await;
        let _ = self.worker.await;
    }

    pub async fn close(self) -> Result<SessionResult, TranscribeError> {
        // Flush the residual partial block, then wake the worker to finish.
        let partial: Vec<i16> = {
            let mut buf = self.feeder.sample_buf.lock().unwrap();
            std::mem::take(&mut *buf)
        };
        if !partial.is_empty() {
            let _ = self.feeder.block_tx.send(partial).await;
        }
        let _ = self.feeder.block_tx.send(Vec::new()).await;

        let mut enc = self
            .worker
            .await
            .map_err(|e| TranscribeError::Encode(format!("encode worker: {e}")))?;
        enc.close()
            .map_err(|e| TranscribeError::Encode(e.to_string()))?;

        if self.format == Format::Adaptive {
            let tls = *self.tls_latency.lock().unwrap();
            enc.select(AdaptiveThresholds::default().threshold_for_tls(tls));
        }

        let audio = enc.bytes().to_vec();
        let api_format = enc.api_format();
        drop(self.updates_tx);

        let result = (self.transcribe)(audio, api_format).await?;

        let text = result.text.trim().to_string();
        let no_speech = text.is_empty();

        let raw_size = enc.total_frames() * 2;
        let encoded_size = enc.bytes().len() as u64;
        let compression_pct = if raw_size > 0 {
            (1.0 - encoded_size as f64 / raw_size as f64) * 100.0
        } else {
            0.0
        };
        let audio_duration = enc.total_frames() as f64 / SAMPLE_RATE as f64;
        let net = &result.metrics;

        let mut session_result = SessionResult {
            text,
            has_text: !no_speech,
            no_speech,
            rate_limit: result.rate_limit.clone(),
            batch: Some(BatchStats {
                audio_length_s: audio_duration,
                raw_size_kb: raw_size as f64 / 1024.0,
                compressed_size_kb: encoded_size as f64 / 1024.0,
                compression_pct,
                encode_time_ms: enc.encode_time().as_millis() as f64,
                dns_time_ms: net.dns.as_millis() as f64,
                tls_time_ms: net.tls.as_millis() as f64,
                ttfb_ms: net.ttfb.as_millis() as f64,
                total_time_ms: net.sum().as_millis() as f64,
                conn_reused: net.conn_reused,
                tls_protocol: net.tls_protocol.clone(),
                confidence: result.confidence,
            }),
            metrics: format_metrics(
                enc.as_ref(),
                raw_size,
                encoded_size,
                compression_pct,
                audio_duration,
                &result,
            ),
            ..SessionResult::default()
        };
        session_result.capture_mem_stats();
        Ok(session_result)
    }
}

fn format_metrics(
    enc: &dyn Encoder,
    raw_size: u64,
    encoded_size: u64,
    compression_pct: f64,
    audio_duration: f64,
    result: &ProviderResult,
) -> Vec<String> {
    let m = &result.metrics;
    let reused = if m.conn_reused { " (reused)" } else { "" };

    let mut lines = vec![
        format!(
            "audio:      {:.1}s | {:.1} KB -> {:.1} KB ({:.0}% smaller)",
            audio_duration,
            raw_size as f64 / 1024.0,
            encoded_size as f64 / 1024.0,
            compression_pct
        ),
        format!("format:     {}", enc.label()),
        format!("encode:     {}ms (concurrent)", enc.encode_time().as_millis()),
        format!("conn_wait:  {}ms{}", m.conn_wait.as_millis(), reused),
        format!("dns:        {}ms", m.dns.as_millis()),
        format!("tcp:        {}ms", m.tcp.as_millis()),
        format!("tls:        {}ms", m.tls.as_millis()),
        format!("req_head:   {}ms", m.req_headers.as_millis()),
        format!("req_body:   {}ms", m.req_body.as_millis()),
        format!("ttfb:       {}ms", m.ttfb.as_millis()),
        format!("download:   {}ms", m.download.as_millis()),
        format!("total:      {}ms", m.sum().as_millis()),
    ];
    if result.duration > 0.0 {
        lines.push(format!("api_dur:    {:.2}s", result.duration));
    }
    if result.confidence > 0.0 {
        lines.push(format!("confidence: {:.4}", result.confidence));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcriber::net::NetMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_transcribe(
        calls: Arc<AtomicUsize>,
        reply: &'static str,
    ) -> (TranscribeFn, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let f: TranscribeFn = Arc::new(move |audio, _format| {
            calls.fetch_add(1, Ordering::SeqCst);
            *seen_clone.lock().unwrap() = audio;
            Box::pin(async move {
                Ok(ProviderResult {
                    text: reply.to_string(),
                    metrics: NetMetrics::default(),
                    ..ProviderResult::default()
                })
            })
        });
        (f, seen)
    }

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn feed_order_survives_arbitrary_chunking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (transcribe, _) = fake_transcribe(calls.clone(), "hello world");
        let cfg = SessionConfig {
            stream: false,
            format: Format::Flac,
            language: String::new(),
        };
        let session =
            BatchSession::new(&cfg, transcribe, Arc::new(Mutex::new(None))).expect("session");

        // 12000 samples split unevenly across feeds.
        let samples: Vec<i16> = (0..12_000).map(|i| (i % 313) as i16).collect();
        let bytes = pcm_bytes(&samples);
        let feeder = session.feeder();
        for chunk in bytes.chunks(977) {
            feeder.feed(chunk);
        }

        let result = session.close().await.expect("close");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.has_text);
        assert_eq!(result.text, "hello world");
        let stats = result.batch.expect("batch stats");
        // All 12000 samples must reach the encoder in order: total_frames
        // drives both raw size and duration.
        assert!((stats.audio_length_s - 12_000.0 / 16_000.0).abs() < 1e-9);
        assert!((stats.raw_size_kb - 24_000.0 / 1024.0).abs() < 1e-9);
        assert!(result.stream.is_none());
    }

    #[tokio::test]
    async fn empty_text_reports_no_speech() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (transcribe, _) = fake_transcribe(calls.clone(), "  ");
        let cfg = SessionConfig {
            stream: false,
            format: Format::Mp3At16,
            language: String::new(),
        };
        let session =
            BatchSession::new(&cfg, transcribe, Arc::new(Mutex::new(None))).expect("session");
        session.feed(&pcm_bytes(&vec![100i16; 8000]));

        let result = session.close().await.expect("close");
        assert!(result.no_speech);
        assert!(!result.has_text);
        assert!(result.text.is_empty());
    }

    #[tokio::test]
    async fn transcribe_error_propagates_from_close() {
        let transcribe: TranscribeFn = Arc::new(|_, _| {
            Box::pin(async {
                Err(TranscribeError::Provider {
                    provider: "groq",
                    status: 500,
                    body: "boom".into(),
                })
            })
        });
        let cfg = SessionConfig {
            stream: false,
            format: Format::Mp3At16,
            language: String::new(),
        };
        let session =
            BatchSession::new(&cfg, transcribe, Arc::new(Mutex::new(None))).expect("session");
        session.feed(&pcm_bytes(&vec![5i16; 4096]));
        let err = session.close().await.expect_err("close should fail");
        assert!(matches!(err, TranscribeError::Provider { status: 500, .. }));
    }

    #[tokio::test]
    async fn updates_channel_closes_without_emitting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (transcribe, _) = fake_transcribe(calls, "x");
        let cfg = SessionConfig {
            stream: false,
            format: Format::Mp3At16,
            language: String::new(),
        };
        let session =
            BatchSession::new(&cfg, transcribe, Arc::new(Mutex::new(None))).expect("session");
        let mut updates = session.updates();

        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while updates.changed().await.is_ok() {
                seen.push(updates.borrow_and_update().clone());
            }
            seen
        });

        session.feed(&pcm_bytes(&vec![1i16; 4096]));
        session.close().await.expect("close");
        let seen = consumer.await.expect("consumer");
        assert!(seen.is_empty(), "batch sessions never emit updates: {seen:?}");
    }
}
