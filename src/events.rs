//! The single-select event loop.
//!
//! Idle state selects across hotkey starts, UI start requests, device
//! hotplug, and shutdown. During a recording an inner loop forwards every
//! stop source into that recording's stop channel while the recording task
//! runs; the finalizer detaches, so the next press is accepted as soon as
//! capture has stopped.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::{mpsc, watch};

use crate::app::{graceful_shutdown, App};
use crate::audio::{is_bluetooth, AudioContext, CaptureConfig, CaptureDevice, DeviceInfo};
use crate::diag;
use crate::feedback;
use crate::hotkey::hybrid::Hybrid;
use crate::hotkey::HotkeyEvents;
use crate::recorder;
use crate::update;

const HOTPLUG_POLL: Duration = Duration::from_secs(3);

/// External control surface: an alternate UI (or the stdin test driver)
/// starts and stops recordings through these.
pub struct Controls {
    pub start_tx: mpsc::Sender<()>,
    pub stop_tx: mpsc::Sender<()>,
    pub start_rx: mpsc::Receiver<()>,
    pub stop_rx: mpsc::Receiver<()>,
}

impl Controls {
    pub fn new() -> Self {
        let (start_tx, start_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            start_tx,
            stop_tx,
            start_rx,
            stop_rx,
        }
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new()
    }
}

enum DeviceEvent {
    Disappeared(String),
    Reappeared(String),
}

/// Capture device ownership plus the user's selection state.
pub struct CaptureManager {
    pub ctx: AudioContext,
    pub capture: Arc<CaptureDevice>,
    pub config: CaptureConfig,
    pub selected: Option<DeviceInfo>,
    pub preferred: Option<String>,
}

impl CaptureManager {
    pub fn device_line_text(&self) -> String {
        let (name, suffix) = match &self.selected {
            Some(d) if is_bluetooth(&d.name) => (d.name.as_str(), " (BT!)"),
            Some(d) => (d.name.as_str(), ""),
            None => ("system default", ""),
        };
        format!("mic: {name}{suffix}")
    }

    /// Close the old device, open the new one. Never switches mid-recording:
    /// callers only invoke this from the idle arms of the loop.
    fn reopen(&mut self, app: &App, device: Option<DeviceInfo>) {
        let name = device
            .as_ref()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| "system default".into());
        info!("device_switch: {name}");
        match self.ctx.new_capture(device.as_ref(), self.config) {
            Ok(capture) => {
                self.capture = Arc::new(capture);
                self.selected = device;
                app.sink.device_line(&self.device_line_text());
            }
            Err(e) => {
                error!("capture device reinit failed: {e:#}");
                app.sink.error(&format!("{e:#}"));
            }
        }
    }

    fn handle_device_event(&mut self, app: &App, event: DeviceEvent) {
        match event {
            DeviceEvent::Disappeared(name) => {
                if self.selected.as_ref().map(|d| d.name.as_str()) == Some(name.as_str()) {
                    info!("device_disconnected: {name}");
                    self.reopen(app, None);
                }
            }
            DeviceEvent::Reappeared(name) => {
                if self.selected.is_none() && self.preferred.as_deref() == Some(name.as_str()) {
                    info!("device_reconnected: {name}");
                    let device = DeviceInfo {
                        id: name.clone(),
                        name,
                    };
                    self.reopen(app, Some(device));
                }
            }
        }
    }
}

fn spawn_signal_task() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            thread::Builder::new()
                .name("signal-handler".into())
                .spawn(move || {
                    for _ in signals.forever() {
                        let _ = tx.send(());
                    }
                })
                .ok();
        }
        Err(e) => warn!("signal handler setup failed: {e}"),
    }
    rx
}

/// 3 s device enumeration diff on its own blocking thread; cpal hosts are
/// not Send everywhere, so the poller owns a separate context.
fn spawn_hotplug_poller(initial: Vec<String>) -> mpsc::UnboundedReceiver<DeviceEvent> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("device-hotplug".into())
        .spawn(move || {
            let ctx = match AudioContext::new() {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!("hotplug poller disabled: {e:#}");
                    return;
                }
            };
            let mut last = initial;
            loop {
                thread::sleep(HOTPLUG_POLL);
                let names: Vec<String> = match ctx.devices() {
                    Ok(devices) => devices.into_iter().map(|d| d.name).collect(),
                    Err(_) => continue,
                };
                if names == last {
                    continue;
                }
                for gone in last.iter().filter(|n| !names.contains(n)) {
                    if event_tx.send(DeviceEvent::Disappeared(gone.clone())).is_err() {
                        return;
                    }
                }
                for fresh in names.iter().filter(|n| !last.contains(n)) {
                    if event_tx.send(DeviceEvent::Reappeared(fresh.clone())).is_err() {
                        return;
                    }
                }
                last = names;
            }
        })
        .ok();
    event_rx
}

enum StopSource<'a> {
    /// Hybrid mode: the state machine's own stop channel.
    Hybrid(&'a mut mpsc::UnboundedReceiver<()>),
    /// Raw mode: the key release.
    Keyup(&'a mut mpsc::UnboundedReceiver<()>),
    /// UI-initiated recordings only stop from the UI.
    None,
}

/// Drive one recording to completion, forwarding stop sources into its stop
/// channel. Returns when capture has stopped (the finalizer keeps running).
async fn run_recording(
    app: Arc<App>,
    capture: Arc<CaptureDevice>,
    mut hotkey_stop: StopSource<'_>,
    ui_stop: &mut mpsc::Receiver<()>,
    toggle_flag: Option<Arc<AtomicBool>>,
) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let recording = tokio::spawn(recorder::handle_recording(
        app.clone(),
        capture,
        stop_rx,
        toggle_flag,
    ));
    tokio::pin!(recording);

    loop {
        tokio::select! {
            biased;
            outcome = &mut recording => {
                match outcome {
                    Ok(Ok(_finalizer)) => {}
                    Ok(Err(e)) => app.report_recording_error(&e),
                    Err(e) => warn!("recording task panicked: {e}"),
                }
                return;
            }
            _ = async {
                match &mut hotkey_stop {
                    StopSource::Hybrid(rx) => { rx.recv().await; }
                    StopSource::Keyup(rx) => { rx.recv().await; }
                    StopSource::None => std::future::pending::<()>().await,
                }
            } => {
                let _ = stop_tx.send(true);
            }
            _ = ui_stop.recv() => {
                let _ = stop_tx.send(true);
            }
        }
    }
}

/// Run the main loop until shutdown.
pub async fn run(
    app: Arc<App>,
    mut manager: CaptureManager,
    mut controls: Controls,
    hotkey: HotkeyEvents,
    hybrid: bool,
    long_press: Duration,
) -> Result<()> {
    let mut signal_rx = spawn_signal_task();

    let initial_names: Vec<String> = manager
        .ctx
        .devices()
        .map(|devices| devices.into_iter().map(|d| d.name).collect())
        .unwrap_or_default();
    let mut device_rx = spawn_hotplug_poller(initial_names);

    update::start_background_check(crate::VERSION.to_string(), diag::dir(), {
        let sink = app.sink.clone();
        move |release| sink.update_available(&release.version)
    });

    app.sink.mode_line(&app.mode_line_text());
    app.sink.device_line(&manager.device_line_text());

    let announce_start = |app: &App, device_name: &str| {
        info!("recording_device: {device_name}");
        app.sink.recording_start();
        feedback::play_start();
    };

    if hybrid {
        let mut hy = Hybrid::spawn(hotkey, long_press);
        let toggle_flag = hy.toggle_flag();
        loop {
            tokio::select! {
                Some(ev) = hy.start.recv() => {
                    info!("hotkey_start mode={:?}", ev.mode);
                    announce_start(&app, manager.capture.device_name());
                    while hy.stop.try_recv().is_ok() {}
                    run_recording(
                        app.clone(),
                        manager.capture.clone(),
                        StopSource::Hybrid(&mut hy.stop),
                        &mut controls.stop_rx,
                        Some(toggle_flag.clone()),
                    )
                    .await;
                }
                Some(()) = controls.start_rx.recv() => {
                    info!("ui_record_start");
                    announce_start(&app, manager.capture.device_name());
                    run_recording(
                        app.clone(),
                        manager.capture.clone(),
                        StopSource::None,
                        &mut controls.stop_rx,
                        None,
                    )
                    .await;
                }
                Some(event) = device_rx.recv() => manager.handle_device_event(&app, event),
                Some(()) = signal_rx.recv() => {
                    info!("shutdown signal");
                    graceful_shutdown(&app);
                }
            }
        }
    } else {
        let HotkeyEvents {
            mut keydown,
            mut keyup,
        } = hotkey;
        loop {
            tokio::select! {
                Some(()) = keydown.recv() => {
                    info!("hotkey_down");
                    announce_start(&app, manager.capture.device_name());
                    while keyup.try_recv().is_ok() {}
                    run_recording(
                        app.clone(),
                        manager.capture.clone(),
                        StopSource::Keyup(&mut keyup),
                        &mut controls.stop_rx,
                        None,
                    )
                    .await;
                }
                Some(()) = controls.start_rx.recv() => {
                    info!("ui_record_start");
                    announce_start(&app, manager.capture.device_name());
                    run_recording(
                        app.clone(),
                        manager.capture.clone(),
                        StopSource::None,
                        &mut controls.stop_rx,
                        None,
                    )
                    .await;
                }
                Some(event) = device_rx.recv() => manager.handle_device_event(&app, event),
                Some(()) = signal_rx.recv() => {
                    info!("shutdown signal");
                    graceful_shutdown(&app);
                }
            }
        }
    }
}
