//! `--doctor`: environment diagnostics.
//!
//! Checks everything a fresh install trips over: API keys, hotkey
//! registration, audio devices, log directory, encoder output, clipboard
//! access, provider reachability, and optionally a WAV file's shape.
//! Prints one pass/fail line per check and returns the process exit code.

use std::time::Duration;

use crate::audio::AudioContext;
use crate::clipboard;
use crate::diag;
use crate::encoder::{self, Encoder, SAMPLE_RATE};
use crate::hotkey;

fn check(name: &str, result: Result<String, String>) -> bool {
    match result {
        Ok(detail) if detail.is_empty() => {
            println!("  ok   {name}");
            true
        }
        Ok(detail) => {
            println!("  ok   {name}: {detail}");
            true
        }
        Err(reason) => {
            println!("  FAIL {name}: {reason}");
            false
        }
    }
}

fn check_api_keys() -> Result<String, String> {
    let keys = [
        ("DEEPGRAM_API_KEY", "deepgram"),
        ("GROQ_API_KEY", "groq"),
        ("OPENAI_API_KEY", "openai"),
    ];
    let present: Vec<&str> = keys
        .iter()
        .filter(|(var, _)| !std::env::var(var).unwrap_or_default().is_empty())
        .map(|(_, name)| *name)
        .collect();
    if present.is_empty() {
        Err("no provider API key set (DEEPGRAM_API_KEY, GROQ_API_KEY, or OPENAI_API_KEY)".into())
    } else {
        Ok(present.join(", "))
    }
}

/// Non-interactive stand-in for pressing the hotkey: register the real
/// event tap and report whether the platform accepted it. The listener
/// thread stays up until exit, which doctor reaches immediately after.
fn check_hotkey() -> Result<String, String> {
    hotkey::register()
        .map(|_| "event tap registered (Ctrl+Shift+Space)".to_string())
        .map_err(|e| format!("{e:#}"))
}

/// Clipboard probe without touching the user's clipboard content: opening
/// the clipboard is what fails on headless or misconfigured sessions, and
/// paste synthesis shares the same display connection.
fn check_clipboard() -> Result<String, String> {
    clipboard::init()
        .map(|_| String::new())
        .map_err(|e| format!("{e:#}"))
}

fn check_audio() -> Result<String, String> {
    let ctx = AudioContext::new().map_err(|e| format!("{e:#}"))?;
    let devices = ctx.devices().map_err(|e| format!("{e:#}"))?;
    if devices.is_empty() {
        return Err("no capture devices found".into());
    }
    Ok(format!("{} device(s)", devices.len()))
}

fn check_log_dir() -> Result<String, String> {
    let dir = diag::dir();
    std::fs::create_dir_all(&dir).map_err(|e| format!("creating {}: {e}", dir.display()))?;
    let probe = dir.join(".doctor_probe");
    std::fs::write(&probe, b"probe").map_err(|e| format!("writing {}: {e}", dir.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(dir.display().to_string())
}

fn tone(samples: usize) -> Vec<i16> {
    (0..samples)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE as f64;
            ((t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 16_000.0) as i16
        })
        .collect()
}

fn check_mp3() -> Result<String, String> {
    let mut enc = encoder::Mp3Encoder::new(16).map_err(|e| format!("{e:#}"))?;
    enc.encode_block(&tone(8_000));
    enc.close().map_err(|e| format!("{e:#}"))?;
    let bytes = enc.bytes();
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
        return Err("output missing MPEG frame header".into());
    }
    Ok(format!("{} bytes for 0.5s", bytes.len()))
}

fn check_flac() -> Result<String, String> {
    let mut enc = encoder::FlacEncoder::new();
    enc.encode_block(&tone(8_000));
    enc.close().map_err(|e| format!("{e:#}"))?;
    if !enc.bytes().starts_with(b"fLaC") {
        return Err("output missing fLaC magic".into());
    }
    Ok(format!("{} bytes for 0.5s", enc.bytes().len()))
}

async fn check_network() -> Result<String, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;
    let response = client
        .head("https://api.deepgram.com/")
        .send()
        .await
        .map_err(|e| e.to_string())?;
    Ok(format!("deepgram origin reachable ({})", response.status()))
}

fn check_wav(path: &str) -> Result<String, String> {
    let reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE || spec.bits_per_sample != 16 {
        return Err(format!(
            "expected 16-bit mono {SAMPLE_RATE} Hz, got {}-bit {}ch {} Hz",
            spec.bits_per_sample, spec.channels, spec.sample_rate
        ));
    }
    let duration_s = reader.duration() as f64 / spec.sample_rate as f64;
    Ok(format!("{duration_s:.1}s of PCM16"))
}

/// Run all checks; returns the exit code.
pub async fn run(wav_file: Option<&str>) -> i32 {
    println!("sotto doctor");

    let mut ok = true;
    ok &= check("api keys", check_api_keys());
    ok &= check("hotkey", check_hotkey());
    ok &= check("audio capture", check_audio());
    ok &= check("log directory", check_log_dir());
    ok &= check("mp3 encoder", check_mp3());
    ok &= check("flac encoder", check_flac());
    ok &= check("clipboard", check_clipboard());
    ok &= check("network", check_network().await);
    if let Some(path) = wav_file {
        ok &= check("wav file", check_wav(path));
    }

    if ok {
        println!("all checks passed");
        0
    } else {
        1
    }
}
