//! Groq provider: whisper-large-v3-turbo over the OpenAI-compatible API.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use serde::Deserialize;

use super::net::TracedClient;
use super::session::{Session, SessionConfig};
use super::{
    first_header, multipart_form, BatchSession, ProviderResult, Segment, TranscribeError,
    Transcriber,
};

const API_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const MODEL: &str = "whisper-large-v3-turbo";

pub struct Groq {
    client: Arc<TracedClient>,
    api_key: String,
    lang: Mutex<String>,
}

impl Groq {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Arc::new(TracedClient::new(API_URL)),
            api_key,
            lang: Mutex::new(String::new()),
        }
    }
}

impl Transcriber for Groq {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn set_language(&self, lang: &str) {
        *self.lang.lock().unwrap() = lang.to_string();
    }

    fn language(&self) -> String {
        self.lang.lock().unwrap().clone()
    }

    fn new_session(&self, cfg: SessionConfig) -> Result<Session, TranscribeError> {
        if cfg.stream {
            return Err(TranscribeError::StreamUnsupported("groq"));
        }
        if !cfg.language.is_empty() {
            self.set_language(&cfg.language);
        }

        let warm = self.client.clone();
        tokio::spawn(async move { warm.warm().await });

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let lang = self.language();
        let transcribe: super::TranscribeFn = Arc::new(move |audio, format| {
            let client = client.clone();
            let api_key = api_key.clone();
            let lang = lang.clone();
            Box::pin(async move { transcribe_batch(&client, &api_key, &lang, audio, format).await })
        });
        Ok(Session::Batch(BatchSession::new(
            &cfg,
            transcribe,
            self.client.last_tls_handle(),
        )?))
    }
}

#[derive(Deserialize, Default)]
struct GroqSegment {
    #[serde(default)]
    text: String,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    no_speech_prob: f64,
    #[serde(default)]
    avg_logprob: f64,
    #[serde(default)]
    compression_ratio: f64,
    #[serde(default)]
    temperature: f64,
}

#[derive(Deserialize, Default)]
struct GroqResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    segments: Vec<GroqSegment>,
}

async fn transcribe_batch(
    client: &TracedClient,
    api_key: &str,
    lang: &str,
    audio: Vec<u8>,
    format: &'static str,
) -> Result<ProviderResult, TranscribeError> {
    let file_name = format!("audio.{format}");
    let mut fields = vec![("model", MODEL), ("response_format", "verbose_json")];
    if !lang.is_empty() {
        fields.push(("language", lang));
    }
    let (content_type, body) = multipart_form("file", &file_name, &audio, &fields);

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| TranscribeError::Config(format!("api key: {e}")))?,
    );
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .map_err(|e| TranscribeError::Config(format!("content type: {e}")))?,
    );

    let resp = client
        .send(Method::POST, API_URL, headers, Bytes::from(body))
        .await?;

    if resp.status.as_u16() != 200 {
        return Err(TranscribeError::Provider {
            provider: "groq",
            status: resp.status.as_u16(),
            body: String::from_utf8_lossy(&resp.body).into_owned(),
        });
    }

    let parsed: GroqResponse = serde_json::from_slice(&resp.body)
        .map_err(|e| TranscribeError::Parse(format!("groq response: {e}")))?;

    let mut no_speech_prob = 0.0f64;
    let mut avg_log_prob = 0.0f64;
    let mut segments = Vec::with_capacity(parsed.segments.len());
    if !parsed.segments.is_empty() {
        let mut log_prob_sum = 0.0;
        for seg in &parsed.segments {
            no_speech_prob = no_speech_prob.max(seg.no_speech_prob);
            log_prob_sum += seg.avg_logprob;
            segments.push(Segment {
                text: seg.text.clone(),
                no_speech_prob: seg.no_speech_prob,
                avg_log_prob: seg.avg_logprob,
                compression_ratio: seg.compression_ratio,
                temperature: seg.temperature,
                start: seg.start,
                end: seg.end,
            });
        }
        avg_log_prob = log_prob_sum / parsed.segments.len() as f64;
    }

    let remaining = first_header(&resp.headers, &["x-ratelimit-remaining-requests"]);
    let limit = first_header(&resp.headers, &["x-ratelimit-limit-requests"]);

    Ok(ProviderResult {
        text: parsed.text,
        metrics: resp.metrics,
        rate_limit: format!("{remaining}/{limit}"),
        no_speech_prob,
        avg_log_prob,
        duration: parsed.duration,
        segments,
        ..ProviderResult::default()
    })
}
