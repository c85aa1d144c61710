//! Streaming session: live WebSocket, incremental committed transcripts.
//!
//! The dial happens lazily on a background task so `feed` can start
//! buffering immediately. PCM is rechunked into fixed 200 ms chunks and sent
//! as binary frames; JSON messages come back, only finals commit, and every
//! commit publishes the full committed text (not a delta) to the updates
//! slot. Close walks an explicit finalize ladder:
//! Open -> FinalizeSent -> AckReceived -> Draining -> Closed, each rung with
//! its own timeout.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::encoder::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};

use super::session::{SessionResult, StreamStats};
use super::TranscribeError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type DialFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<WsStream, TranscribeError>> + Send>>;

/// One parsed server message, provider-agnostic.
#[derive(Debug, Clone, Default)]
pub struct StreamUpdate {
    pub transcript: String,
    pub is_final: bool,
    pub speech_final: bool,
    pub from_finalize: bool,
}

pub type ParseUpdate = fn(&str) -> Option<StreamUpdate>;

const STREAM_CHUNK_MS: usize = 200;
const STREAM_CHUNK_BYTES: usize =
    SAMPLE_RATE as usize * CHANNELS as usize * (BITS_PER_SAMPLE as usize / 8) * STREAM_CHUNK_MS
        / 1000;
const FINALIZE_MESSAGE: &str = r#"{"type":"Finalize"}"#;
const FINALIZE_ACK_MAX: Duration = Duration::from_millis(1000);
const FINALIZE_IDLE: Duration = Duration::from_millis(200);
const RECEIVER_DRAIN_MAX: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Shared {
    committed: String,
    err: Option<TranscribeError>,
    closing: bool,
    connect_dur: Duration,
    sent_chunks: usize,
    sent_bytes: u64,
    recv_messages: usize,
    recv_final: usize,
    recv_interim: usize,
    commit_events: usize,
}

/// Feed side, cloned into the capture callback. Chunks are cut here so the
/// sender task only ever sees wire-sized pieces.
#[derive(Clone)]
pub struct StreamFeeder {
    audio_tx: mpsc::Sender<Vec<u8>>,
    feed_buf: Arc<Mutex<Vec<u8>>>,
    shared: Arc<Mutex<Shared>>,
}

impl StreamFeeder {
    pub fn feed(&self, pcm: &[u8]) {
        if self.shared.lock().unwrap().err.is_some() {
            return;
        }
        let mut chunks = Vec::new();
        {
            let mut buf = self.feed_buf.lock().unwrap();
            buf.extend_from_slice(pcm);
            while buf.len() >= STREAM_CHUNK_BYTES {
                chunks.push(buf.drain(..STREAM_CHUNK_BYTES).collect::<Vec<u8>>());
            }
        }
        for chunk in chunks {
            if self.audio_tx.try_send(chunk).is_err() {
                warn!("stream send queue full, dropping chunk");
            }
        }
    }
}

pub struct StreamSession {
    feeder: StreamFeeder,
    updates_tx: Arc<watch::Sender<String>>,
    updates_rx: watch::Receiver<String>,
    connected_rx: watch::Receiver<bool>,
    finalized_rx: watch::Receiver<bool>,
    sender_task: JoinHandle<Option<SplitSink<WsStream, Message>>>,
    receiver_task: JoinHandle<()>,
    started_at: Instant,
}

impl StreamSession {
    pub fn new(dial: DialFuture, parse: ParseUpdate) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(128);
        let (updates_tx, updates_rx) = watch::channel(String::new());
        let updates_tx = Arc::new(updates_tx);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (finalized_tx, finalized_rx) = watch::channel(false);
        let (sink_tx, sink_rx) = oneshot::channel::<SplitSink<WsStream, Message>>();
        let (stream_tx, stream_rx) = oneshot::channel::<SplitStream<WsStream>>();

        // Dial task: connect, then hand the halves to the sender/receiver.
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                let connect_start = Instant::now();
                let dialed = dial.await;
                shared.lock().unwrap().connect_dur = connect_start.elapsed();
                match dialed {
                    Ok(ws) => {
                        let (sink, stream) = ws.split();
                        let _ = sink_tx.send(sink);
                        let _ = stream_tx.send(stream);
                    }
                    Err(e) => {
                        debug!("stream dial failed: {}", e);
                        shared.lock().unwrap().err = Some(e);
                        // Dropping the halves unblocks both worker tasks.
                    }
                }
                let _ = connected_tx.send(true);
            });
        }

        let sender_task = tokio::spawn(run_sender(sink_rx, audio_rx, shared.clone()));
        let receiver_task = tokio::spawn(run_receiver(
            stream_rx,
            shared.clone(),
            updates_tx.clone(),
            finalized_tx,
            parse,
        ));

        Self {
            feeder: StreamFeeder {
                audio_tx,
                feed_buf: Arc::new(Mutex::new(Vec::new())),
                shared,
            },
            updates_tx,
            updates_rx,
            connected_rx,
            finalized_rx,
            sender_task,
            receiver_task,
            started_at: Instant::now(),
        }
    }

    pub fn feeder(&self) -> StreamFeeder {
        self.feeder.clone()
    }

    pub fn updates(&self) -> watch::Receiver<String> {
        self.updates_rx.clone()
    }

    /// Meaningful even if the dial has not completed yet: waits for the
    /// connection attempt, drains buffered PCM, then runs the finalize
    /// ladder.
    pub async fn close(mut self) -> Result<SessionResult, TranscribeError> {
        let shared = self.feeder.shared.clone();

        // Wait until the dial attempt resolved one way or the other.
        let _ = self.connected_rx.wait_for(|connected| *connected).await;

        let dial_err = {
            let mut s = shared.lock().unwrap();
            if s.err.is_some() {
                self.feeder.feed_buf.lock().unwrap().clear();
                s.err.take()
            } else {
                None
            }
        };
        if let Some(err) = dial_err {
            drop(self.feeder.audio_tx);
            let _ = self.sender_task.await;
            self.receiver_task.abort();
            let _ = self.receiver_task.await;
            return Err(err);
        }

        // Flush the buffered tail, then the empty sentinel asks the sender
        // to finalize.
        let tail: Vec<u8> = std::mem::take(&mut *self.feeder.feed_buf.lock().unwrap());
        let finalize_start = Instant::now();
        if !tail.is_empty() {
            let _ = self.feeder.audio_tx.send(tail).await;
        }
        let _ = self.feeder.audio_tx.send(Vec::new()).await;
        drop(self.feeder.audio_tx);

        // FinalizeSent: the sender returns the sink once the control frame
        // is on the wire.
        let sink = self.sender_task.await.ok().flatten();

        // AckReceived: bounded wait for the server's from_finalize message,
        // then a short quiet period for stragglers.
        let ack_timed_out = tokio::time::timeout(
            FINALIZE_ACK_MAX,
            self.finalized_rx.wait_for(|done| *done),
        )
        .await
        .is_err();
        if ack_timed_out {
            debug!("finalize ack timed out");
        } else {
            tokio::time::sleep(FINALIZE_IDLE).await;
        }

        // Draining: close the socket, give the receiver a bounded window.
        shared.lock().unwrap().closing = true;
        if let Some(mut sink) = sink {
            let _ = sink.close().await;
        }
        let drained = tokio::time::timeout(RECEIVER_DRAIN_MAX, &mut self.receiver_task).await;
        if drained.is_err() {
            warn!("stream receiver drain timeout");
            self.receiver_task.abort();
            let _ = (&mut self.receiver_task).await;
        }

        // Closed: even if the consumer missed the last non-blocking update,
        // the final committed text lands once more before the slot closes.
        let final_text = shared.lock().unwrap().committed.clone();
        if !final_text.is_empty() {
            let _ = self.updates_tx.send(final_text);
        }
        drop(self.updates_tx);

        let (stats, session_err) = {
            let mut s = shared.lock().unwrap();
            let audio_s = s.sent_bytes as f64
                / (SAMPLE_RATE as f64 * CHANNELS as f64 * (BITS_PER_SAMPLE as f64 / 8.0));
            let stats = StreamStats {
                connect_ms: s.connect_dur.as_millis() as f64,
                sent_chunks: s.sent_chunks,
                sent_kb: s.sent_bytes as f64 / 1024.0,
                recv_messages: s.recv_messages,
                recv_final: s.recv_final,
                recv_interim: s.recv_interim,
                commit_events: s.commit_events,
                finalize_ms: finalize_start.elapsed().as_millis() as f64,
                total_ms: self.started_at.elapsed().as_millis() as f64,
                audio_s,
            };
            (stats, s.err.take())
        };

        if let Some(err) = session_err {
            // Latched mid-session failure: text already surfaced live via
            // the updates slot, the close itself reports the error.
            return Err(err);
        }

        let text = shared.lock().unwrap().committed.trim().to_string();
        let no_speech = text.is_empty();
        let mut result = SessionResult {
            metrics: format_metrics(&stats),
            text,
            has_text: !no_speech,
            no_speech,
            stream: Some(stats),
            ..SessionResult::default()
        };
        result.capture_mem_stats();
        Ok(result)
    }
}

async fn run_sender(
    sink_rx: oneshot::Receiver<SplitSink<WsStream, Message>>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Mutex<Shared>>,
) -> Option<SplitSink<WsStream, Message>> {
    let Ok(mut sink) = sink_rx.await else {
        // Dial failed; drain so feeders never see a full queue forever.
        while audio_rx.recv().await.is_some() {}
        return None;
    };

    while let Some(chunk) = audio_rx.recv().await {
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        match sink.send(Message::Binary(chunk)).await {
            Ok(()) => {
                let mut s = shared.lock().unwrap();
                s.sent_chunks += 1;
                s.sent_bytes += len as u64;
            }
            Err(e) => {
                latch_err(&shared, TranscribeError::WebSocket(format!("send: {e}")));
                return Some(sink);
            }
        }
    }

    if let Err(e) = sink.send(Message::Text(FINALIZE_MESSAGE.to_string())).await {
        latch_err(&shared, TranscribeError::WebSocket(format!("finalize: {e}")));
    }
    Some(sink)
}

async fn run_receiver(
    stream_rx: oneshot::Receiver<SplitStream<WsStream>>,
    shared: Arc<Mutex<Shared>>,
    updates_tx: Arc<watch::Sender<String>>,
    finalized_tx: watch::Sender<bool>,
    parse: ParseUpdate,
) {
    let Ok(mut stream) = stream_rx.await else {
        return;
    };

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                if shared.lock().unwrap().closing {
                    break;
                }
                latch_err(&shared, TranscribeError::WebSocket(format!("recv: {e}")));
                break;
            }
        };

        let Some(update) = parse(&text) else {
            continue;
        };

        if update.from_finalize {
            let _ = finalized_tx.send(true);
        }

        let is_final = update.is_final || update.speech_final || update.from_finalize;
        {
            let mut s = shared.lock().unwrap();
            s.recv_messages += 1;
            if is_final {
                s.recv_final += 1;
            } else {
                s.recv_interim += 1;
            }
        }
        if !is_final {
            continue;
        }

        let transcript = update.transcript.trim();
        if transcript.is_empty() {
            continue;
        }

        // Committed text is the space-joined concatenation of all finals;
        // every commit publishes the whole thing.
        let full_text = {
            let mut s = shared.lock().unwrap();
            if s.committed.is_empty() {
                s.committed = transcript.to_string();
            } else {
                s.committed.push(' ');
                s.committed.push_str(transcript);
            }
            s.commit_events += 1;
            s.committed.clone()
        };
        let _ = updates_tx.send(full_text);
    }
}

fn latch_err(shared: &Arc<Mutex<Shared>>, err: TranscribeError) {
    let mut s = shared.lock().unwrap();
    if s.err.is_none() {
        s.err = Some(err);
    }
}

fn format_metrics(stats: &StreamStats) -> Vec<String> {
    vec![
        format!(
            "audio:      {:.1}s | {:.1} KB PCM sent",
            stats.audio_s, stats.sent_kb
        ),
        format!(
            "stream:     deepgram | PCM16 {}Hz mono | {}ms chunks",
            SAMPLE_RATE, STREAM_CHUNK_MS
        ),
        format!("connect:    {}ms", stats.connect_ms),
        format!(
            "sent:       {} chunks | {:.1} KB",
            stats.sent_chunks, stats.sent_kb
        ),
        format!(
            "recv:       {} msgs ({} final, {} interim)",
            stats.recv_messages, stats.recv_final, stats.recv_interim
        ),
        format!("commit:     {} updates", stats.commit_events),
        format!("finalize:   {}ms", stats.finalize_ms),
        format!("total:      {}ms", stats.total_ms),
    ]
}
