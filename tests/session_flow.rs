//! Session behavior end to end, batch against a scripted provider and
//! streaming against a local WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use sotto::encoder::Format;
use sotto::transcriber::net::NetMetrics;
use sotto::transcriber::{
    BatchSession, DialFuture, ProviderResult, Session, SessionConfig, StreamSession, StreamUpdate,
    TranscribeError, TranscribeFn,
};

fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn scripted_provider(calls: Arc<AtomicUsize>, reply: &'static str) -> TranscribeFn {
    Arc::new(move |_audio, _format| {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(ProviderResult {
                text: reply.to_string(),
                metrics: NetMetrics::default(),
                ..ProviderResult::default()
            })
        })
    })
}

fn batch_config() -> SessionConfig {
    SessionConfig {
        stream: false,
        format: Format::Mp3At16,
        language: String::new(),
    }
}

#[tokio::test]
async fn batch_round_trip_through_session_enum() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = Session::Batch(
        BatchSession::new(
            &batch_config(),
            scripted_provider(calls.clone(), "the quick brown fox"),
            Arc::new(Mutex::new(None)),
        )
        .expect("session"),
    );

    // Half a second of audio through the polymorphic surface.
    session.feed(&pcm_bytes(&vec![2000i16; 8000]));
    let result = session.close().await.expect("close");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.text, "the quick brown fox");
    assert!(result.has_text);
    assert!(result.batch.is_some());
    assert!(result.stream.is_none());
    assert!(!result.metrics.is_empty());
}

#[tokio::test]
async fn short_recording_abort_never_calls_the_provider() {
    let calls = Arc::new(AtomicUsize::new(0));
    let session = Session::Batch(
        BatchSession::new(
            &batch_config(),
            scripted_provider(calls.clone(), "should not appear"),
            Arc::new(Mutex::new(None)),
        )
        .expect("session"),
    );

    // 500 samples is under the 100 ms floor; the recorder aborts instead of
    // closing, and no request may be made.
    session.feed(&pcm_bytes(&vec![1000i16; 500]));
    session.abort().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// Minimal server-side view of the streaming wire protocol.
#[derive(Deserialize, Default)]
struct WireMessage {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    #[serde(default)]
    from_finalize: bool,
    #[serde(default)]
    channel: WireChannel,
}

#[derive(Deserialize, Default)]
struct WireChannel {
    #[serde(default)]
    alternatives: Vec<WireAlternative>,
}

#[derive(Deserialize, Default)]
struct WireAlternative {
    #[serde(default)]
    transcript: String,
}

fn parse_wire(text: &str) -> Option<StreamUpdate> {
    let parsed: WireMessage = serde_json::from_str(text).ok()?;
    Some(StreamUpdate {
        transcript: parsed
            .channel
            .alternatives
            .first()
            .map(|a| a.transcript.clone())
            .unwrap_or_default(),
        is_final: parsed.is_final,
        speech_final: parsed.speech_final,
        from_finalize: parsed.from_finalize,
    })
}

fn final_message(word: &str) -> String {
    format!(
        r#"{{"type":"Results","is_final":true,"channel":{{"alternatives":[{{"transcript":"{word}"}}]}}}}"#
    )
}

/// Accept one connection and act like a streaming ASR server: every binary
/// chunk yields one final word, interleaved with interim noise; Finalize is
/// acknowledged with a from_finalize tail.
async fn spawn_fake_asr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        let mut chunk_count = 0usize;
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Binary(_) => {
                    chunk_count += 1;
                    // Interim first, then the committed final.
                    let interim = r#"{"type":"Results","is_final":false,"channel":{"alternatives":[{"transcript":"..."}]}}"#;
                    let _ = ws.send(Message::Text(interim.to_string())).await;
                    let _ = ws
                        .send(Message::Text(final_message(&format!("word{chunk_count}"))))
                        .await;
                }
                Message::Text(text) if text.contains("Finalize") => {
                    let ack = r#"{"type":"Results","is_final":true,"from_finalize":true,"channel":{"alternatives":[{"transcript":"tail"}]}}"#;
                    let _ = ws.send(Message::Text(ack.to_string())).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });
    format!("ws://{addr}")
}

fn dial(url: String) -> DialFuture {
    Box::pin(async move {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TranscribeError::WebSocket(e.to_string()))?;
        Ok(ws)
    })
}

#[tokio::test]
async fn stream_commits_are_monotonic_and_survive_close() {
    let url = spawn_fake_asr().await;
    let session = Session::Stream(StreamSession::new(dial(url), parse_wire));

    let mut updates = session.updates();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let consumer = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let text = updates.borrow_and_update().clone();
                if !text.is_empty() {
                    seen.lock().unwrap().push(text);
                }
            }
        })
    };

    // Three 200 ms chunks (6400 bytes each at 16 kHz PCM16).
    let chunk = pcm_bytes(&vec![500i16; 3200]);
    for _ in 0..3 {
        session.feed(&chunk);
    }
    // Give the server time to commit the per-chunk finals before close.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let result = session.close().await.expect("close");
    consumer.await.expect("consumer");

    assert!(result.has_text);
    assert!(result.text.contains("word1"));
    assert!(result.text.ends_with("tail"));

    let stats = result.stream.expect("stream stats");
    assert_eq!(stats.sent_chunks, 3);
    assert_eq!(stats.sent_kb, 3.0 * 6400.0 / 1024.0);
    assert!(stats.recv_final >= 4);
    assert!(stats.recv_interim >= 3);
    assert!(stats.commit_events >= 4);
    assert!((stats.audio_s - 0.6).abs() < 1e-9);

    // Monotonicity: every committed string extends the previous one, and
    // the final result is the last committed value.
    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(
            pair[1].starts_with(pair[0].as_str()),
            "{:?} does not extend {:?}",
            pair[1],
            pair[0]
        );
    }
    assert_eq!(seen.last().expect("last commit"), &result.text);
}

#[tokio::test]
async fn slow_consumer_still_sees_final_text_after_close() {
    let url = spawn_fake_asr().await;
    let session = Session::Stream(StreamSession::new(dial(url), parse_wire));

    // Nobody reads updates during the session; the slot drops intermediate
    // values, but the final committed text must still be readable.
    let mut updates = session.updates();

    let chunk = pcm_bytes(&vec![500i16; 3200]);
    for _ in 0..2 {
        session.feed(&chunk);
    }
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let result = session.close().await.expect("close");

    let mut last = String::new();
    while updates.changed().await.is_ok() {
        last = updates.borrow_and_update().clone();
    }
    assert_eq!(last, result.text);
}

#[tokio::test]
async fn dial_failure_is_returned_from_close() {
    // Nothing listens on this port.
    let session = Session::Stream(StreamSession::new(
        dial("ws://127.0.0.1:9".to_string()),
        parse_wire,
    ));
    session.feed(&pcm_bytes(&vec![1i16; 3200]));

    let err = session.close().await.expect_err("close must fail");
    assert!(matches!(err, TranscribeError::WebSocket(_)));
}
