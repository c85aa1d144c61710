//! OpenAI provider: gpt-4o-transcribe, batch only, explicit selection.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use serde::Deserialize;

use super::net::TracedClient;
use super::session::{Session, SessionConfig};
use super::{
    first_header, multipart_form, BatchSession, ProviderResult, TranscribeError, Transcriber,
};

const API_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const MODEL: &str = "gpt-4o-transcribe";

pub struct OpenAI {
    client: Arc<TracedClient>,
    api_key: String,
    lang: Mutex<String>,
}

impl OpenAI {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Arc::new(TracedClient::new(API_URL)),
            api_key,
            lang: Mutex::new(String::new()),
        }
    }
}

impl Transcriber for OpenAI {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn set_language(&self, lang: &str) {
        *self.lang.lock().unwrap() = lang.to_string();
    }

    fn language(&self) -> String {
        self.lang.lock().unwrap().clone()
    }

    fn new_session(&self, cfg: SessionConfig) -> Result<Session, TranscribeError> {
        if cfg.stream {
            return Err(TranscribeError::StreamUnsupported("openai"));
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
struct OpenAIResponse {
    #[serde(default)]
    text: String,
}

async fn transcribe_batch(
    client: &TracedClient,
    api_key: &str,
    lang: &str,
    audio: Vec<u8>,
    format: &'static str,
) -> Result<ProviderResult, TranscribeError> {
    let file_name = format!("audio.{format}");
    let mut fields = vec![("model", MODEL), ("response_format", "json")];
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
            provider: "openai",
            status: resp.status.as_u16(),
            body: String::from_utf8_lossy(&resp.body).into_owned(),
        });
    }

    let parsed: OpenAIResponse = serde_json::from_slice(&resp.body)
        .map_err(|e| TranscribeError::Parse(format!("openai response: {e}")))?;

    let remaining = first_header(&resp.headers, &["x-ratelimit-remaining-requests"]);
    let limit = first_header(&resp.headers, &["x-ratelimit-limit-requests"]);

    Ok(ProviderResult {
        text: parsed.text,
        metrics: resp.metrics,
        rate_limit: format!("{remaining}/{limit}"),
        ..ProviderResult::default()
    })
}
