//! Deepgram provider: nova-3 batch over HTTPS, linear16 streaming over WSS.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use log::debug;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::encoder::{CHANNELS, SAMPLE_RATE};

use super::net::TracedClient;
use super::session::{Session, SessionConfig};
use super::stream::{DialFuture, StreamSession, StreamUpdate};
use super::{first_header, BatchSession, ProviderResult, TranscribeError, Transcriber};

const BATCH_URL: &str = "https://api.deepgram.com/v1/listen?model=nova-3";
const STREAM_URL: &str = "wss://api.deepgram.com/v1/listen";
const MODEL: &str = "nova-3";

pub struct Deepgram {
    client: Arc<TracedClient>,
    api_key: String,
    lang: Mutex<String>,
}

impl Deepgram {
    pub fn new(api_key: String) -> Self {
        let client = Arc::new(TracedClient::new(BATCH_URL));
        let warm = client.clone();
        tokio::spawn(async move { warm.warm().await });
        Self {
            client,
            api_key,
            lang: Mutex::new(String::new()),
        }
    }

    fn dial_stream(&self) -> DialFuture {
        let lang = self.language();
        let api_key = self.api_key.clone();
        let mut url = format!(
            "{STREAM_URL}?model={MODEL}&encoding=linear16&sample_rate={SAMPLE_RATE}&channels={CHANNELS}"
        );
        if !lang.is_empty() {
            url.push_str(&format!("&language={lang}"));
        }
        Box::pin(async move {
            let mut request = url
                .into_client_request()
                .map_err(|e| TranscribeError::WebSocket(format!("stream url: {e}")))?;
            let auth = HeaderValue::from_str(&format!("Token {api_key}"))
                .map_err(|e| TranscribeError::WebSocket(format!("auth header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, auth);

            let (ws, response) = connect_async(request)
                .await
                .map_err(|e| TranscribeError::WebSocket(format!("dial: {e}")))?;
            debug!("deepgram stream connected: {}", response.status());
            Ok(ws)
        })
    }
}

impl Transcriber for Deepgram {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn set_language(&self, lang: &str) {
        *self.lang.lock().unwrap() = lang.to_string();
    }

    fn language(&self) -> String {
        self.lang.lock().unwrap().clone()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn new_session(&self, cfg: SessionConfig) -> Result<Session, TranscribeError> {
        if !cfg.language.is_empty() {
            self.set_language(&cfg.language);
        }
        if cfg.stream {
            return Ok(Session::Stream(StreamSession::new(
                self.dial_stream(),
                parse_stream_update,
            )));
        }

        let warm = self.client.clone();
        tokio::spawn(async move { warm.warm().await });

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let transcribe: super::TranscribeFn = Arc::new(move |audio, format| {
            let client = client.clone();
            let api_key = api_key.clone();
            Box::pin(async move { transcribe_batch(&client, &api_key, audio, format).await })
        });
        Ok(Session::Batch(BatchSession::new(
            &cfg,
            transcribe,
            self.client.last_tls_handle(),
        )?))
    }
}

#[derive(Deserialize)]
struct DeepgramResponse {
    #[serde(default)]
    metadata: DeepgramMetadata,
    #[serde(default)]
    results: DeepgramResults,
}

#[derive(Deserialize, Default)]
struct DeepgramMetadata {
    #[serde(default)]
    duration: f64,
}

#[derive(Deserialize, Default)]
struct DeepgramResults {
    #[serde(default)]
    channels: Vec<DeepgramChannel>,
}

#[derive(Deserialize, Default)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize, Default)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f64,
}

async fn transcribe_batch(
    client: &TracedClient,
    api_key: &str,
    audio: Vec<u8>,
    format: &'static str,
) -> Result<ProviderResult, TranscribeError> {
    let content_type = if format == "mp3" {
        "audio/mpeg"
    } else {
        "audio/flac"
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Token {api_key}"))
            .map_err(|e| TranscribeError::Config(format!("api key: {e}")))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    let resp = client
        .send(Method::POST, BATCH_URL, headers, Bytes::from(audio))
        .await?;

    if resp.status.as_u16() != 200 {
        return Err(TranscribeError::Provider {
            provider: "deepgram",
            status: resp.status.as_u16(),
            body: String::from_utf8_lossy(&resp.body).into_owned(),
        });
    }

    let parsed: DeepgramResponse = serde_json::from_slice(&resp.body)
        .map_err(|e| TranscribeError::Parse(format!("deepgram response: {e}")))?;

    let (text, confidence) = parsed
        .results
        .channels
        .first()
        .and_then(|c| c.alternatives.first())
        .map(|alt| (alt.transcript.clone(), alt.confidence))
        .unwrap_or_default();

    let remaining = first_header(
        &resp.headers,
        &[
            "x-dg-ratelimit-remaining",
            "x-ratelimit-remaining",
            "ratelimit-remaining",
        ],
    );
    let limit = first_header(
        &resp.headers,
        &[
            "x-dg-ratelimit-limit",
            "x-ratelimit-limit",
            "ratelimit-limit",
        ],
    );

    Ok(ProviderResult {
        text,
        metrics: resp.metrics,
        rate_limit: format!("{remaining}/{limit}"),
        confidence,
        duration: parsed.metadata.duration,
        ..ProviderResult::default()
    })
}

#[derive(Deserialize, Default)]
struct DeepgramStreamResponse {
    #[serde(default, rename = "type")]
    _kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    #[serde(default)]
    from_finalize: bool,
    #[serde(default)]
    channel: DeepgramChannel,
}

pub(crate) fn parse_stream_update(text: &str) -> Option<StreamUpdate> {
    let parsed: DeepgramStreamResponse = serde_json::from_str(text).ok()?;
    let transcript = parsed
        .channel
        .alternatives
        .first()
        .map(|alt| alt.transcript.trim().to_string())
        .unwrap_or_default();
    Some(StreamUpdate {
        transcript,
        is_final: parsed.is_final,
        speech_final: parsed.speech_final,
        from_finalize: parsed.from_finalize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_messages_parse_transcript_and_flags() {
        let msg = r#"{
            "type": "Results",
            "is_final": true,
            "speech_final": false,
            "from_finalize": false,
            "channel": {"alternatives": [{"transcript": " hello there "}]}
        }"#;
        let update = parse_stream_update(msg).expect("parse");
        assert_eq!(update.transcript, "hello there");
        assert!(update.is_final);
        assert!(!update.speech_final);
        assert!(!update.from_finalize);
    }

    #[test]
    fn finalize_ack_is_detected() {
        let msg = r#"{"type":"Results","from_finalize":true,"channel":{"alternatives":[]}}"#;
        let update = parse_stream_update(msg).expect("parse");
        assert!(update.from_finalize);
        assert!(update.transcript.is_empty());
    }

    #[test]
    fn garbage_messages_are_ignored() {
        assert!(parse_stream_update("not json").is_none());
    }
}
