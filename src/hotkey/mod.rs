//! Global hotkey capture.
//!
//! rdev's listener owns a dedicated thread for the process lifetime; the
//! chord state machine lives in its callback and forwards keydown/keyup of
//! the Ctrl+Shift+Space combination as channel events. Everything above this
//! module works with the [`HotkeyEvents`] channel pair, so tests can inject
//! synthetic key events without a display server.

pub mod hybrid;

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error};
use rdev::{Event, EventType, Key};
use tokio::sync::mpsc;

pub struct HotkeyEvents {
    pub keydown: mpsc::UnboundedReceiver<()>,
    pub keyup: mpsc::UnboundedReceiver<()>,
}

/// Register the fixed Ctrl+Shift+Space shortcut.
///
/// Fails when the platform refuses the event tap (missing permissions,
/// no display connection). Fatal to the caller: the tool is useless
/// without its hotkey.
pub fn register() -> Result<HotkeyEvents> {
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    let (startup_tx, startup_rx) = std_mpsc::channel::<String>();

    thread::Builder::new()
        .name("hotkey-listener".into())
        .spawn(move || {
            let mut ctrl = false;
            let mut shift = false;
            let mut active = false;

            let callback = move |event: Event| match event.event_type {
                EventType::KeyPress(Key::ControlLeft | Key::ControlRight) => ctrl = true,
                EventType::KeyRelease(Key::ControlLeft | Key::ControlRight) => ctrl = false,
                EventType::KeyPress(Key::ShiftLeft | Key::ShiftRight) => shift = true,
                EventType::KeyRelease(Key::ShiftLeft | Key::ShiftRight) => shift = false,
                EventType::KeyPress(Key::Space) => {
                    // OS key repeat re-fires KeyPress while held.
                    if ctrl && shift && !active {
                        active = true;
                        debug!("hotkey keydown");
                        let _ = down_tx.send(());
                    }
                }
                EventType::KeyRelease(Key::Space) => {
                    if active {
                        active = false;
                        debug!("hotkey keyup");
                        let _ = up_tx.send(());
                    }
                }
                _ => {}
            };

            if let Err(e) = rdev::listen(callback) {
                error!("hotkey listener failed: {:?}", e);
                let _ = startup_tx.send(format!("{:?}", e));
            }
        })
        .map_err(|e| anyhow!("spawning hotkey listener: {}", e))?;

    // rdev::listen blocks forever on success; give it a moment to report a
    // registration failure before declaring victory.
    match startup_rx.recv_timeout(Duration::from_millis(300)) {
        Ok(err) => Err(anyhow!("registering hotkey: {}", err)),
        Err(_) => Ok(HotkeyEvents {
            keydown: down_rx,
            keyup: up_rx,
        }),
    }
}

#[cfg(test)]
pub(crate) struct FakeHotkey {
    pub down_tx: mpsc::UnboundedSender<()>,
    pub up_tx: mpsc::UnboundedSender<()>,
}

#[cfg(test)]
impl FakeHotkey {
    pub fn new() -> (Self, HotkeyEvents) {
        let (down_tx, keydown) = mpsc::unbounded_channel();
        let (up_tx, keyup) = mpsc::unbounded_channel();
        (Self { down_tx, up_tx }, HotkeyEvents { keydown, keyup })
    }

    pub fn sim_keydown(&self) {
        self.down_tx.send(()).expect("keydown send");
    }

    pub fn sim_keyup(&self) {
        self.up_tx.send(()).expect("keyup send");
    }
}
