//! sotto: push-to-talk cloud dictation.
//!
//! Hold (or tap) Ctrl+Shift+Space, speak, release: the microphone stream is
//! encoded on the fly, shipped to a cloud speech-to-text provider, and the
//! transcript is pasted into whatever window had focus. The crate is split
//! into the capture/VAD/silence front half and the session/provider back
//! half, glued together by [`recorder`] and the [`events`] loop.

pub mod app;
pub mod audio;
pub mod cli;
pub mod clipboard;
pub mod diag;
pub mod doctor;
pub mod encoder;
pub mod events;
pub mod feedback;
pub mod hotkey;
pub mod metrics;
pub mod profile;
pub mod recorder;
pub mod silence;
pub mod transcriber;
pub mod update;
pub mod vad;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
