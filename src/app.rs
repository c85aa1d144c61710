//! Process-wide application state.
//!
//! Everything the recording pipeline and event loop share lives in one
//! [`App`] value behind an `Arc`; UI-ish surfaces receive an [`EventSink`]
//! so the pipeline never knows whether anything is watching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::info;

use crate::encoder::Format;
use crate::metrics::MetricsStore;
use crate::transcriber::Transcriber;

/// Display layer contract. The pipeline reports through this; the default
/// implementation prints to the terminal.
pub trait EventSink: Send + Sync {
    fn recording_start(&self) {}
    fn recording_stop(&self) {}
    fn recording_tick(&self, _duration_s: f64) {}
    fn audio_level(&self, _rms: f64) {}
    fn no_voice_warning(&self) {}
    fn voice_cleared(&self) {}
    fn silence_auto_close(&self) {}
    fn live_transcription(&self, _text: &str) {}
    fn transcription(&self, _text: &str, _metrics: &[String], _no_speech: bool) {}
    fn rate_limit(&self, _text: &str) {}
    fn mode_line(&self, _text: &str) {}
    fn device_line(&self, _text: &str) {}
    fn error(&self, _text: &str) {}
    fn update_available(&self, _version: &str) {}
}

/// Minimal terminal sink for headless operation.
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn recording_start(&self) {
        eprintln!("* recording...");
    }

    fn no_voice_warning(&self) {
        eprintln!("! no voice detected");
    }

    fn voice_cleared(&self) {
        eprintln!("  voice detected again");
    }

    fn silence_auto_close(&self) {
        eprintln!("! silent for 30s, stopping");
    }

    fn transcription(&self, text: &str, metrics: &[String], no_speech: bool) {
        if no_speech {
            println!("(no speech detected)");
        } else {
            println!("{text}");
        }
        for line in metrics {
            eprintln!("  {line}");
        }
    }

    fn rate_limit(&self, text: &str) {
        eprintln!("  {text}");
    }

    fn mode_line(&self, text: &str) {
        eprintln!("{text}");
    }

    fn device_line(&self, text: &str) {
        eprintln!("{text}");
    }

    fn error(&self, text: &str) {
        eprintln!("error: {text}");
    }

    fn update_available(&self, version: &str) {
        eprintln!("update available: {version}");
    }
}

pub struct App {
    transcriber: ArcSwap<Arc<dyn Transcriber>>,
    pub sink: Arc<dyn EventSink>,
    autopaste: AtomicBool,
    stream_enabled: AtomicBool,
    format: Mutex<Format>,
    pub metrics: Mutex<MetricsStore>,
    last_text: Mutex<String>,
}

impl App {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        sink: Arc<dyn EventSink>,
        autopaste: bool,
        stream_enabled: bool,
        format: Format,
    ) -> Arc<Self> {
        Arc::new(Self {
            transcriber: ArcSwap::from_pointee(transcriber),
            sink,
            autopaste: AtomicBool::new(autopaste),
            stream_enabled: AtomicBool::new(stream_enabled),
            format: Mutex::new(format),
            metrics: Mutex::new(MetricsStore::default()),
            last_text: Mutex::new(String::new()),
        })
    }

    pub fn transcriber(&self) -> Arc<dyn Transcriber> {
        self.transcriber.load().as_ref().clone()
    }

    pub fn set_transcriber(&self, t: Arc<dyn Transcriber>) {
        self.stream_enabled
            .store(t.supports_streaming(), Ordering::SeqCst);
        self.transcriber.store(Arc::new(t));
        self.sink.mode_line(&self.mode_line_text());
    }

    pub fn autopaste(&self) -> bool {
        self.autopaste.load(Ordering::SeqCst)
    }

    pub fn set_autopaste(&self, on: bool) {
        self.autopaste.store(on, Ordering::SeqCst);
    }

    pub fn stream_enabled(&self) -> bool {
        self.stream_enabled.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> Format {
        *self.format.lock().unwrap()
    }

    pub fn last_text(&self) -> String {
        self.last_text.lock().unwrap().clone()
    }

    pub fn set_last_text(&self, text: &str) {
        *self.last_text.lock().unwrap() = text.to_string();
    }

    pub fn mode_line_text(&self) -> String {
        let t = self.transcriber();
        let mut provider = t.name().to_string();
        let lang = t.language();
        if !lang.is_empty() {
            provider.push_str(&format!(" ({lang})"));
        }
        let format_label = if self.stream_enabled() {
            provider.push_str(" (stream)");
            "PCM16".to_string()
        } else {
            self.format().to_string()
        };
        format!("[{format_label} | {provider}]")
    }

    pub fn report_recording_error(&self, err: &anyhow::Error) {
        log::error!("recording error: {err:#}");
        self.sink.error(&format!("{err:#}"));
    }
}

pub fn graceful_shutdown(app: &App) -> ! {
    let count = app.metrics.lock().unwrap().len();
    if count > 0 {
        info!("session_end count={count}");
    }
    crate::diag::close();
    std::process::exit(0);
}
