//! Diagnostics, transcript, and crash logging.
//!
//! Three append-only files under the log directory:
//! `diagnostics_log.txt` (one line per event, console-writer style),
//! `transcribe_log.txt` (tab-separated `timestamp<TAB>[pid]<TAB>text`), and
//! `crash_log.txt` (session marker plus panic dumps). The `log` facade
//! routes every `debug!`/`info!`/`warn!`/`error!` call site here once
//! `init` has run; warnings and errors also mirror to stderr.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;

const DIAG_FILE: &str = "diagnostics_log.txt";
const TRANSCRIBE_FILE: &str = "transcribe_log.txt";
const CRASH_FILE: &str = "crash_log.txt";

struct DiagState {
    dir: PathBuf,
    diag: Option<File>,
    transcribe: Option<File>,
}

static STATE: Lazy<Mutex<DiagState>> = Lazy::new(|| {
    Mutex::new(DiagState {
        dir: PathBuf::new(),
        diag: None,
        transcribe: None,
    })
});

struct DiagLogger;

static LOGGER: DiagLogger = DiagLogger;

impl log::Log for DiagLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERR",
            Level::Warn => "WRN",
            Level::Info => "INF",
            Level::Debug => "DBG",
            Level::Trace => "TRC",
        };
        let line = format!(
            "{} {} {} pid={}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            record.args(),
            std::process::id()
        );

        if record.level() <= Level::Warn {
            eprintln!("{line}");
        }
        let mut state = STATE.lock().unwrap();
        if let Some(file) = state.diag.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        let mut state = STATE.lock().unwrap();
        if let Some(file) = state.diag.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Log directory resolution: `--logpath` flag, then `SOTTO_LOG_PATH`, then
/// the OS data directory.
pub fn resolve_dir(flag: Option<&str>) -> Result<PathBuf> {
    let raw = match flag {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => match std::env::var("SOTTO_LOG_PATH") {
            Ok(env_path) if !env_path.is_empty() => PathBuf::from(env_path),
            _ => default_dir()?,
        },
    };
    if raw.is_absolute() {
        Ok(raw)
    } else {
        Ok(std::env::current_dir()
            .context("resolving working directory")?
            .join(raw))
    }
}

fn default_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|d| d.join("sotto").join("logs"))
        .ok_or_else(|| anyhow!("no OS data directory available"))
}

pub fn set_dir(dir: &Path) {
    STATE.lock().unwrap().dir = dir.to_path_buf();
}

pub fn dir() -> PathBuf {
    STATE.lock().unwrap().dir.clone()
}

pub fn ensure_dir() -> Result<()> {
    let dir = dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))
}

/// Open the log files and route the `log` facade here. Safe to call once.
pub fn init() -> Result<()> {
    ensure_dir()?;
    let dir = dir();

    let open = |name: &str| -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
            .with_context(|| format!("opening {name}"))
    };

    {
        let mut state = STATE.lock().unwrap();
        state.diag = Some(open(DIAG_FILE)?);
        state.transcribe = Some(open(TRANSCRIBE_FILE)?);
    }

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
    Ok(())
}

pub fn close() {
    let mut state = STATE.lock().unwrap();
    if let Some(file) = state.diag.as_mut() {
        let _ = file.flush();
    }
    if let Some(file) = state.transcribe.as_mut() {
        let _ = file.flush();
    }
    state.diag = None;
    state.transcribe = None;
}

/// Append one transcript line: `timestamp<TAB>[pid]<TAB>text`.
pub fn transcription_text(text: &str) {
    let mut state = STATE.lock().unwrap();
    if let Some(file) = state.transcribe.as_mut() {
        let _ = writeln!(
            file,
            "{}\t[{}]\t{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::process::id(),
            text
        );
    }
}

/// Append the session marker to the crash log and install a panic hook that
/// dumps panics (with backtraces) below it.
pub fn init_crash_log() {
    let crash_path = dir().join(CRASH_FILE);
    let marker = format!(
        "\n=== Session {} [pid={}] ===\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        std::process::id()
    );
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&crash_path) {
        let _ = file.write_all(marker.as_bytes());
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&crash_path) {
            let backtrace = std::backtrace::Backtrace::force_capture();
            let _ = writeln!(
                file,
                "{} panic: {}\n{}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                info,
                backtrace
            );
        }
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_env_and_default() {
        let dir = resolve_dir(Some("/tmp/sotto-test-logs")).expect("resolve");
        assert_eq!(dir, PathBuf::from("/tmp/sotto-test-logs"));
    }

    #[test]
    fn relative_paths_anchor_to_cwd() {
        let dir = resolve_dir(Some("rel-logs")).expect("resolve");
        assert!(dir.is_absolute());
        assert!(dir.ends_with("rel-logs"));
    }
}
