//! One recording, end to end.
//!
//! Wires the capture callback into the session feeder, RMS meter, and VAD;
//! drives the silence monitor off a 100 ms ticker; merges the stop sources;
//! and hands the session to a finalizer task so the event loop is free to
//! take the next press while transcription completes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::app::App;
use crate::audio::{CaptureDevice, DataCallback};
use crate::clipboard;
use crate::diag;
use crate::encoder::SAMPLE_RATE;
use crate::feedback;
use crate::metrics::TranscriptionRecord;
use crate::silence::{SilenceEvent, SilenceMonitor, TICK_INTERVAL};
use crate::transcriber::{Session, SessionConfig, SessionResult};
use crate::vad::VadProcessor;

/// Delay after Stop before closing a streaming session, letting the last
/// chunk reach the server.
pub const RECORD_TAIL: Duration = Duration::from_millis(500);

/// Recordings under 100 ms are discarded without a provider round trip.
const MIN_FRAMES: u64 = SAMPLE_RATE as u64 / 10;

/// Run one recording. Returns once capture has stopped; transcription
/// completes on a detached finalizer task whose handle is returned for
/// callers that need to await it (benchmarks, tests).
pub async fn handle_recording(
    app: Arc<App>,
    capture: Arc<CaptureDevice>,
    stop: watch::Receiver<bool>,
    is_toggle: Option<Arc<AtomicBool>>,
) -> Result<Option<JoinHandle<()>>> {
    let transcriber = app.transcriber();
    let session = transcriber
        .new_session(SessionConfig {
            stream: app.stream_enabled(),
            format: app.format(),
            language: transcriber.language(),
        })
        .context("opening session")?;

    // Snapshot the clipboard on its own task so capture starts immediately.
    let autopaste = app.autopaste();
    let (clip_tx, clip_rx) = oneshot::channel::<String>();
    if autopaste {
        tokio::task::spawn_blocking(move || {
            let previous = clipboard::read().unwrap_or_default();
            let _ = clip_tx.send(previous);
        });
    }

    // Live updates: paste only the delta of each newly committed text.
    let updates_task = {
        let mut updates = session.updates();
        let app = app.clone();
        tokio::spawn(async move {
            let mut previous = String::new();
            while updates.changed().await.is_ok() {
                let text = updates.borrow_and_update().clone();
                if text.is_empty() {
                    continue;
                }
                app.sink.live_transcription(&text);
                if autopaste && text.len() > previous.len() {
                    let delta = text[previous.len()..].to_string();
                    if !delta.is_empty() {
                        clipboard::copy_and_paste(&delta);
                    }
                }
                previous = text;
            }
        })
    };

    let (total_frames, auto_closed) = record(&app, &capture, stop, &session, is_toggle).await?;

    if total_frames < MIN_FRAMES {
        info!("short recording discarded ({total_frames} frames)");
        updates_task.abort();
        tokio::spawn(session.abort());
        return Ok(None);
    }

    let finalizer = tokio::spawn(async move {
        finish_transcription(
            app,
            session,
            autopaste.then_some(clip_rx),
            updates_task,
            auto_closed,
        )
        .await;
    });
    Ok(Some(finalizer))
}

/// Install the callback, run the tick loop, wait for a stop, tear down.
/// Returns the captured frame count and whether the silence monitor closed
/// the recording itself.
async fn record(
    app: &Arc<App>,
    capture: &Arc<CaptureDevice>,
    mut stop: watch::Receiver<bool>,
    session: &Session,
    is_toggle: Option<Arc<AtomicBool>>,
) -> Result<(u64, bool)> {
    let vad = Arc::new(VadProcessor::new().context("initializing VAD")?);
    let total_frames = Arc::new(AtomicU64::new(0));
    let stopped = Arc::new(AtomicBool::new(false));
    let (done_tx, mut done_rx) = watch::channel(false);
    let done_tx = Arc::new(done_tx);

    {
        let feeder = session.feeder();
        let vad = vad.clone();
        let frames = total_frames.clone();
        let stopped = stopped.clone();
        let sink = app.sink.clone();
        capture.set_callback(DataCallback(Box::new(move |data, frame_count| {
            if stopped.load(Ordering::Relaxed) {
                return;
            }
            frames.fetch_add(u64::from(frame_count), Ordering::Relaxed);

            if !data.is_empty() {
                feeder.feed(data);
            }
            if data.len() > 1 {
                let mut sum_squares = 0.0f64;
                for pair in data.chunks_exact(2) {
                    let sample = i16::from_le_bytes([pair[0], pair[1]]);
                    let normalized = f64::from(sample) / 32768.0;
                    sum_squares += normalized * normalized;
                }
                let rms = (sum_squares / (data.len() / 2) as f64).sqrt();
                sink.audio_level(rms);
                vad.process(data);
            }
        })));
    }

    if let Err(e) = capture.start() {
        capture.clear_callback();
        return Err(e.context("starting capture"));
    }

    let auto_closed = Arc::new(AtomicBool::new(false));

    // Tick task: duration display plus the silence monitor.
    let ticker = {
        let app = app.clone();
        let vad = vad.clone();
        let done_tx = done_tx.clone();
        let mut done_rx = done_rx.clone();
        let auto_closed = auto_closed.clone();
        let toggle_flag = is_toggle.clone();
        tokio::spawn(async move {
            let is_toggle =
                move || toggle_flag.as_ref().is_some_and(|f| f.load(Ordering::SeqCst));
            let mut monitor = SilenceMonitor::new(is_toggle);
            let started = Instant::now();
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = done_rx.wait_for(|d| *d) => return,
                    _ = interval.tick() => {}
                }
                app.sink.recording_tick(started.elapsed().as_secs_f64());
                match monitor.tick(vad.has_speech_tick()) {
                    SilenceEvent::None => {}
                    SilenceEvent::Warn => {
                        info!("no_voice_warning");
                        app.sink.no_voice_warning();
                        feedback::play_error();
                    }
                    SilenceEvent::WarnClear => {
                        app.sink.voice_cleared();
                    }
                    SilenceEvent::Repeat => {
                        info!("silence_during_warning");
                        app.sink.no_voice_warning();
                        feedback::play_error();
                    }
                    SilenceEvent::AutoClose => {
                        info!("silence_auto_close");
                        app.sink.silence_auto_close();
                        feedback::play_end();
                        tokio::time::sleep(RECORD_TAIL).await;
                        auto_closed.store(true, Ordering::SeqCst);
                        let _ = done_tx.send(true);
                        return;
                    }
                }
            }
        })
    };

    // Stop task: external stop sources map onto the same done signal.
    let stopper = {
        let app = app.clone();
        let done_tx = done_tx.clone();
        let mut done_rx = done_rx.clone();
        let streaming = app.stream_enabled();
        tokio::spawn(async move {
            tokio::select! {
                _ = done_rx.wait_for(|d| *d) => return,
                _ = stop.wait_for(|s| *s) => {}
            }
            info!("recording_stop");
            app.sink.recording_stop();
            feedback::play_end();
            if streaming {
                tokio::time::sleep(RECORD_TAIL).await;
            }
            let _ = done_tx.send(true);
        })
    };

    let _ = done_rx.wait_for(|d| *d).await;
    let _ = tokio::join!(ticker, stopper);

    capture.stop();
    capture.clear_callback();
    stopped.store(true, Ordering::SeqCst);

    Ok((
        total_frames.load(Ordering::SeqCst),
        auto_closed.load(Ordering::SeqCst),
    ))
}

async fn finish_transcription(
    app: Arc<App>,
    session: Session,
    clip_rx: Option<oneshot::Receiver<String>>,
    updates_task: JoinHandle<()>,
    skip_paste: bool,
) {
    let close_result = session.close().await;
    let _ = updates_task.await;

    let autopaste = app.autopaste();
    let clip_previous = match clip_rx {
        Some(rx) => rx.await.unwrap_or_default(),
        None => String::new(),
    };
    app.sink.live_transcription("");

    if let Err(err) = &close_result {
        error!("transcription error: {err}");
        app.sink.error(&err.to_string());
    }

    if let Ok(result) = &close_result {
        if !app.stream_enabled() && result.has_text && autopaste && !skip_paste {
            clipboard::copy_and_paste(&result.text);
        }
    }

    if autopaste && !skip_paste && !clip_previous.is_empty() {
        clipboard::restore_later(clip_previous);
    }

    let Ok(result) = close_result else {
        return;
    };

    report_result(&app, &result);
}

fn report_result(app: &Arc<App>, result: &SessionResult) {
    app.sink
        .transcription(&result.text, &result.metrics, result.no_speech);

    if !result.rate_limit.is_empty() && result.rate_limit != "?/?" {
        info!("rate_limit: {}", result.rate_limit);
        app.sink
            .rate_limit(&format!("requests: {} remaining", result.rate_limit));
    }

    if result.no_speech {
        info!("no_speech");
    }

    if let Some(batch) = &result.batch {
        let record = TranscriptionRecord {
            audio_length_s: batch.audio_length_s,
            raw_size_kb: batch.raw_size_kb,
            compressed_size_kb: batch.compressed_size_kb,
            compression_pct: batch.compression_pct,
            encode_time_ms: batch.encode_time_ms,
            dns_time_ms: batch.dns_time_ms,
            tls_time_ms: batch.tls_time_ms,
            ttfb_ms: batch.ttfb_ms,
            total_time_ms: batch.total_time_ms,
            memory_alloc_mb: result.memory_alloc_mb,
            memory_peak_mb: result.memory_peak_mb,
        };
        app.metrics.lock().unwrap().push(record);
        info!(
            "transcription mode=batch provider={} conn={} tls_proto={} audio_s={:.1} raw_kb={:.1} \
             compressed_kb={:.1} compression_pct={:.0} encode_ms={:.0} dns_ms={:.0} tls_ms={:.0} \
             ttfb_ms={:.0} total_ms={:.0} mem_mb={:.1} peak_mb={:.1}",
            app.transcriber().name(),
            if batch.conn_reused { "reused" } else { "new" },
            batch.tls_protocol,
            batch.audio_length_s,
            batch.raw_size_kb,
            batch.compressed_size_kb,
            batch.compression_pct,
            batch.encode_time_ms,
            batch.dns_time_ms,
            batch.tls_time_ms,
            batch.ttfb_ms,
            batch.total_time_ms,
            result.memory_alloc_mb,
            result.memory_peak_mb,
        );
        if batch.confidence > 0.0 {
            info!("api_confidence confidence={:.4}", batch.confidence);
        }
    }

    if let Some(stream) = &result.stream {
        info!(
            "stream_transcription connect_ms={:.0} finalize_ms={:.0} total_ms={:.0} audio_s={:.1} \
             sent_chunks={} sent_kb={:.1} recv_messages={} recv_final={} commit_events={}",
            stream.connect_ms,
            stream.finalize_ms,
            stream.total_ms,
            stream.audio_s,
            stream.sent_chunks,
            stream.sent_kb,
            stream.recv_messages,
            stream.recv_final,
            stream.commit_events,
        );
    }

    if !result.no_speech {
        app.set_last_text(&result.text);
        diag::transcription_text(&result.text);
    }
}
