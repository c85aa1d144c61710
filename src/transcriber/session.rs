//! Session surface shared by the batch and streaming paths.

use tokio::sync::watch;

use crate::encoder::Format;

use super::batch::BatchSession;
use super::stream::StreamSession;
use super::TranscribeError;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub stream: bool,
    /// Batch upload format; ignored for streaming (PCM16 is the wire format).
    pub format: Format,
    pub language: String,
}

#[derive(Clone, Debug, Default)]
pub struct BatchStats {
    pub audio_length_s: f64,
    pub raw_size_kb: f64,
    pub compressed_size_kb: f64,
    pub compression_pct: f64,
    pub encode_time_ms: f64,
    pub dns_time_ms: f64,
    pub tls_time_ms: f64,
    pub ttfb_ms: f64,
    pub total_time_ms: f64,
    pub conn_reused: bool,
    pub tls_protocol: String,
    pub confidence: f64,
}

#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub connect_ms: f64,
    pub sent_chunks: usize,
    pub sent_kb: f64,
    pub recv_messages: usize,
    pub recv_final: usize,
    pub recv_interim: usize,
    pub commit_events: usize,
    pub finalize_ms: f64,
    pub total_ms: f64,
    pub audio_s: f64,
}

#[derive(Clone, Debug, Default)]
pub struct SessionResult {
    pub text: String,
    pub has_text: bool,
    pub no_speech: bool,
    /// "remaining/limit" when the provider reported rate-limit headers.
    pub rate_limit: String,
    pub memory_alloc_mb: f64,
    pub memory_peak_mb: f64,
    pub batch: Option<BatchStats>,
    pub stream: Option<StreamStats>,
    /// Pre-formatted display lines.
    pub metrics: Vec<String>,
}

impl SessionResult {
    pub(crate) fn capture_mem_stats(&mut self) {
        let (alloc, peak) = read_proc_memory();
        self.memory_alloc_mb = alloc;
        self.memory_peak_mb = peak;
    }
}

/// VmRSS / VmHWM in MB from /proc/self/status; zeros off Linux.
#[cfg(target_os = "linux")]
fn read_proc_memory() -> (f64, f64) {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return (0.0, 0.0);
    };
    let mut rss = 0.0;
    let mut peak = 0.0;
    for line in status.lines() {
        let kb = |l: &str| {
            l.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        if line.starts_with("VmRSS:") {
            rss = kb(line) / 1024.0;
        } else if line.starts_with("VmHWM:") {
            peak = kb(line) / 1024.0;
        }
    }
    (rss, peak)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_memory() -> (f64, f64) {
    (0.0, 0.0)
}

/// Clonable feed handle the capture callback holds; the session proper stays
/// owned by the recording task so `close` can consume it.
#[derive(Clone)]
pub enum SessionFeeder {
    Batch(super::batch::BatchFeeder),
    Stream(super::stream::StreamFeeder),
}

impl SessionFeeder {
    /// Never blocks: the audio callback runs on a realtime thread.
    pub fn feed(&self, pcm: &[u8]) {
        match self {
            SessionFeeder::Batch(f) => f.feed(pcm),
            SessionFeeder::Stream(f) => f.feed(pcm),
        }
    }
}

/// One recording's transcription context, batch or streaming.
pub enum Session {
    Batch(BatchSession),
    Stream(StreamSession),
}

impl Session {
    pub fn feeder(&self) -> SessionFeeder {
        match self {
            Session::Batch(s) => SessionFeeder::Batch(s.feeder()),
            Session::Stream(s) => SessionFeeder::Stream(s.feeder()),
        }
    }

    pub fn feed(&self, pcm: &[u8]) {
        self.feeder().feed(pcm);
    }

    /// Committed-so-far transcript slot. Batch sessions close it without
    /// ever publishing; stream sessions publish the full committed text on
    /// every commit, last-writer-wins.
    pub fn updates(&self) -> watch::Receiver<String> {
        match self {
            Session::Batch(s) => s.updates(),
            Session::Stream(s) => s.updates(),
        }
    }

    pub async fn close(self) -> Result<SessionResult, TranscribeError> {
        match self {
            Session::Batch(s) => s.close().await,
            Session::Stream(s) => s.close().await,
        }
    }

    /// Tear the session down without attempting transcription; used for
    /// recordings too short to be worth a provider round trip.
    pub async fn abort(self) {
        match self {
            Session::Batch(s) => s.abort().await,
            Session::Stream(s) => {
                let _ = s.close().await;
            }
        }
    }
}
