//! Clipboard access and paste synthesis.
//!
//! Autopaste is "write to clipboard, synthesize the platform paste chord";
//! per-character typing exists only as a fallback when the chord cannot be
//! synthesized. Virtual key codes are used for the chord so it lands
//! correctly on non-QWERTY layouts.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arboard::Clipboard;
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use log::{debug, warn};

/// Delay before restoring the previous clipboard content, giving the paste
/// keystroke time to land in the focused app.
pub const RESTORE_DELAY: Duration = Duration::from_millis(600);

pub fn read() -> Result<String> {
    let mut cb = Clipboard::new().context("opening clipboard")?;
    match cb.get_text() {
        Ok(text) => Ok(text),
        // An empty or non-text clipboard is not an error for our purposes.
        Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
        Err(e) => Err(anyhow!("reading clipboard: {e}")),
    }
}

pub fn copy(text: &str) -> Result<()> {
    let mut cb = Clipboard::new().context("opening clipboard")?;
    cb.set_text(text.to_string())
        .map_err(|e| anyhow!("writing clipboard: {e}"))
}

/// Synthesize the platform paste chord (Cmd+V / Ctrl+V).
pub fn paste() -> Result<()> {
    #[cfg(target_os = "macos")]
    let (modifier, v_key) = (Key::Meta, Key::Other(9));
    #[cfg(target_os = "windows")]
    let (modifier, v_key) = (Key::Control, Key::Other(0x56));
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let (modifier, v_key) = (Key::Control, Key::Unicode('v'));

    let mut enigo =
        Enigo::new(&Settings::default()).map_err(|e| anyhow!("initializing input: {e}"))?;
    enigo
        .key(modifier, Direction::Press)
        .map_err(|e| anyhow!("pressing modifier: {e}"))?;
    enigo
        .key(v_key, Direction::Click)
        .map_err(|e| anyhow!("pressing V: {e}"))?;
    thread::sleep(Duration::from_millis(50));
    enigo
        .key(modifier, Direction::Release)
        .map_err(|e| anyhow!("releasing modifier: {e}"))?;
    Ok(())
}

/// Fallback path: type the text character by character through the input
/// synthesizer instead of going through the clipboard.
pub fn type_text(text: &str) -> Result<()> {
    let mut enigo =
        Enigo::new(&Settings::default()).map_err(|e| anyhow!("initializing input: {e}"))?;
    enigo.text(text).map_err(|e| anyhow!("typing text: {e}"))
}

/// Copy and paste, falling back to direct typing when the chord fails.
pub fn copy_and_paste(text: &str) {
    if let Err(e) = copy(text) {
        warn!("clipboard copy failed: {}", e);
        return;
    }
    if let Err(e) = paste() {
        warn!("paste chord failed, typing directly: {}", e);
        if let Err(e) = type_text(text) {
            warn!("direct typing failed: {}", e);
        }
    }
}

/// Restore the previous clipboard content after the paste has landed.
pub fn restore_later(previous: String) {
    if previous.is_empty() {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(RESTORE_DELAY).await;
        if let Err(e) = copy(&previous) {
            debug!("clipboard restore failed: {}", e);
        }
    });
}

/// One-time startup check that the paste machinery is usable at all.
pub fn init() -> Result<()> {
    Clipboard::new()
        .map(|_| ())
        .map_err(|e| anyhow!("clipboard unavailable: {e}"))
}
