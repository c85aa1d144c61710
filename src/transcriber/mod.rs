//! Cloud transcription providers and the session machinery above them.
//!
//! A [`Transcriber`] shapes provider-specific requests (auth, multipart,
//! WebSocket URLs); a [`Session`](session::Session) owns one recording's
//! worth of audio and returns the final transcript with timing stats.

mod batch;
mod deepgram;
mod groq;
pub mod net;
mod openai;
mod session;
mod stream;

pub use batch::BatchSession;
pub use deepgram::Deepgram;
pub use groq::Groq;
pub use openai::OpenAI;
pub use session::{
    BatchStats, Session, SessionConfig, SessionFeeder, SessionResult, StreamStats,
};
pub use stream::{DialFuture, ParseUpdate, StreamSession, StreamUpdate};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::HeaderMap;

use net::NetMetrics;

#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("connect: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("tls: {0}")]
    Tls(String),
    #[error("{provider} API error {status}: {body}")]
    Provider {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("response parse: {0}")]
    Parse(String),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("{0} does not support streaming transcription")]
    StreamUnsupported(&'static str),
}

/// One batch response segment as reported by whisper-style providers.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub text: String,
    pub no_speech_prob: f64,
    pub avg_log_prob: f64,
    pub compression_ratio: f64,
    pub temperature: f64,
    pub start: f64,
    pub end: f64,
}

/// Parsed provider response plus the network trace behind it.
#[derive(Debug, Default)]
pub struct ProviderResult {
    pub text: String,
    pub metrics: NetMetrics,
    pub rate_limit: String,
    pub confidence: f64,
    pub no_speech_prob: f64,
    pub avg_log_prob: f64,
    pub duration: f64,
    pub segments: Vec<Segment>,
}

pub type TranscribeFuture =
    Pin<Box<dyn Future<Output = Result<ProviderResult, TranscribeError>> + Send>>;

/// Batch upload entry point a session calls at close: encoded audio plus the
/// wire format name ("mp3" or "flac").
pub type TranscribeFn = Arc<dyn Fn(Vec<u8>, &'static str) -> TranscribeFuture + Send + Sync>;

pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;
    fn set_language(&self, lang: &str);
    fn language(&self) -> String;
    fn supports_streaming(&self) -> bool {
        false
    }
    fn new_session(&self, cfg: SessionConfig) -> Result<Session, TranscribeError>;
}

/// Default provider from the environment: Deepgram wins over Groq; OpenAI is
/// only ever picked explicitly.
pub fn from_env() -> Result<Arc<dyn Transcriber>, TranscribeError> {
    let dg_key = std::env::var("DEEPGRAM_API_KEY").unwrap_or_default();
    let groq_key = std::env::var("GROQ_API_KEY").unwrap_or_default();

    if !dg_key.is_empty() {
        return Ok(Arc::new(Deepgram::new(dg_key)));
    }
    if !groq_key.is_empty() {
        return Ok(Arc::new(Groq::new(groq_key)));
    }
    Err(TranscribeError::Config(
        "set DEEPGRAM_API_KEY or GROQ_API_KEY in the environment".into(),
    ))
}

/// Explicit provider selection; the matching API key must still be present.
pub fn by_name(name: &str) -> Result<Arc<dyn Transcriber>, TranscribeError> {
    let key_var = match name {
        "deepgram" => "DEEPGRAM_API_KEY",
        "groq" => "GROQ_API_KEY",
        "openai" => "OPENAI_API_KEY",
        other => {
            return Err(TranscribeError::Config(format!(
                "unknown provider {:?} (use groq, openai, or deepgram)",
                other
            )))
        }
    };
    let key = std::env::var(key_var).unwrap_or_default();
    if key.is_empty() {
        return Err(TranscribeError::Config(format!("{} is not set", key_var)));
    }
    Ok(match name {
        "deepgram" => Arc::new(Deepgram::new(key)),
        "groq" => Arc::new(Groq::new(key)),
        _ => Arc::new(OpenAI::new(key)),
    })
}

/// First non-empty header value from a priority-ordered key list.
pub(crate) fn first_header(headers: &HeaderMap, keys: &[&str]) -> String {
    for key in keys {
        if let Some(v) = headers.get(*key) {
            if let Ok(s) = v.to_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    "?".to_string()
}

/// Hand-assembled multipart/form-data body: the traced client speaks raw
/// hyper, so there is no form builder to lean on.
pub(crate) fn multipart_form(
    file_field: &str,
    file_name: &str,
    file_bytes: &[u8],
    fields: &[(&str, &str)],
) -> (String, Vec<u8>) {
    let boundary = format!("sotto-{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::with_capacity(file_bytes.len() + 512);

    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{file_field}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(file_bytes);
    body.extend_from_slice(b"\r\n");

    for (name, value) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let content_type = format!("multipart/form-data; boundary={boundary}");
    (content_type, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn header_priority_list_picks_first_present() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("41"));
        headers.insert("ratelimit-remaining", HeaderValue::from_static("99"));

        let got = first_header(
            &headers,
            &[
                "x-dg-ratelimit-remaining",
                "x-ratelimit-remaining",
                "ratelimit-remaining",
            ],
        );
        assert_eq!(got, "41");

        let missing = first_header(&headers, &["x-nope"]);
        assert_eq!(missing, "?");
    }

    #[test]
    fn multipart_body_is_well_formed() {
        let (content_type, body) = multipart_form(
            "file",
            "audio.mp3",
            b"\xff\xf3data",
            &[("model", "whisper-large-v3-turbo"), ("language", "en")],
        );
        let boundary = content_type
            .rsplit("boundary=")
            .next()
            .expect("boundary in content type");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("name=\"file\"; filename=\"audio.mp3\""));
        assert!(text.contains("name=\"model\"\r\n\r\nwhisper-large-v3-turbo\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }
}
