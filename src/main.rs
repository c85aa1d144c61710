use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};

use sotto::app::{App, ConsoleSink};
use sotto::audio::{self, AudioContext, CaptureConfig, DeviceInfo};
use sotto::cli::CliArgs;
use sotto::clipboard;
use sotto::diag;
use sotto::doctor;
use sotto::encoder::{Format, CHANNELS, SAMPLE_RATE};
use sotto::events::{self, CaptureManager, Controls};
use sotto::feedback;
use sotto::hotkey;
use sotto::profile;
use sotto::transcriber::{self, SessionConfig, Transcriber};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let log_dir = diag::resolve_dir(args.logpath.as_deref()).context("resolving log directory")?;
    diag::set_dir(&log_dir);
    if let Err(e) = diag::ensure_dir() {
        eprintln!("Warning: could not create log directory: {e:#}");
    }
    diag::init_crash_log();

    if args.crash {
        panic!("TEST CRASH: synthetic panic to verify crash logging");
    }

    if args.doctor {
        let wav = args.args.first().map(String::as_str);
        std::process::exit(doctor::run(wav).await);
    }

    let format = Format::parse(&args.format)
        .ok_or_else(|| anyhow!("unknown format {:?} (use mp3@16, mp3@64, or flac)", args.format))?;

    let transcriber = match &args.provider {
        Some(name) => transcriber::by_name(name)?,
        None => transcriber::from_env()?,
    };
    if !args.lang.is_empty() {
        transcriber.set_language(&args.lang);
    }

    let mut stream_enabled = args.stream;
    if transcriber.supports_streaming() {
        stream_enabled = true;
    }
    if stream_enabled && args.format != "mp3@16" {
        eprintln!("Warning: --format is ignored in streaming mode");
    }

    if let Err(e) = diag::init() {
        eprintln!("Warning: could not init logging: {e:#}");
    }
    info!(
        "session_start provider={} mode={} format={}",
        transcriber.name(),
        if stream_enabled { "stream" } else { "batch" },
        format
    );

    let app = App::new(
        transcriber,
        Arc::new(ConsoleSink),
        args.autopaste,
        stream_enabled,
        format,
    );

    if let Some(wav) = &args.benchmark {
        run_benchmark(&app, wav, args.runs).await;
        return Ok(());
    }
    if let Some(wav) = &args.test {
        return run_test_mode(&app, wav).await;
    }

    if app.autopaste() {
        if let Err(e) = clipboard::init() {
            eprintln!("Warning: paste init failed: {e:#}");
        }
    }

    let ctx = AudioContext::new().context("initializing audio context")?;

    let mut selected_device: Option<DeviceInfo> = None;
    if let Some(name) = &args.device {
        selected_device = ctx
            .devices()
            .unwrap_or_default()
            .into_iter()
            .find(|d| &d.name == name);
        if selected_device.is_none() {
            warn!("device not found: {name}");
            eprintln!("Warning: device {name:?} not found, using default");
        }
    } else if args.setup {
        match audio::picker::select_device(&ctx) {
            Ok(device) => selected_device = device,
            Err(e) => {
                warn!("device selection failed: {e:#}");
                eprintln!("Warning: device selection failed: {e:#}");
                eprintln!("Falling back to default device");
            }
        }
    }

    let capture_config = CaptureConfig {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS as u16,
    };
    let capture = ctx
        .new_capture(selected_device.as_ref(), capture_config)
        .context("initializing capture device")?;

    let hotkey_events = hotkey::register().context("registering hotkey")?;

    if let Some(addr) = args.profile.clone() {
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = profile::serve(addr, app).await {
                warn!("metrics endpoint failed: {e:#}");
            }
        });
    }

    feedback::init();

    let preferred_device = selected_device.as_ref().map(|d| d.name.clone());
    let manager = CaptureManager {
        ctx,
        capture: Arc::new(capture),
        config: capture_config,
        selected: selected_device,
        preferred: preferred_device,
    };

    events::run(
        app,
        manager,
        Controls::new(),
        hotkey_events,
        args.hybrid,
        Duration::from_millis(args.longpress),
    )
    .await
}

/// Read a WAV file into raw PCM16 LE bytes at the pipeline sample rate.
fn read_wav_pcm(path: &str) -> Result<Vec<u8>> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("opening {path}"))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE || spec.bits_per_sample != 16 {
        return Err(anyhow!(
            "expected 16-bit mono {SAMPLE_RATE} Hz WAV, got {}-bit {}ch {} Hz",
            spec.bits_per_sample,
            spec.channels,
            spec.sample_rate
        ));
    }
    let mut pcm = Vec::new();
    for sample in reader.samples::<i16>() {
        let sample = sample.context("reading wav samples")?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(pcm)
}

fn session_config(app: &App, transcriber: &Arc<dyn Transcriber>) -> SessionConfig {
    SessionConfig {
        stream: app.stream_enabled(),
        format: app.format(),
        language: transcriber.language(),
    }
}

async fn run_benchmark(app: &Arc<App>, wav_file: &str, runs: u32) {
    println!("Benchmark: {wav_file} ({runs} runs)");

    let pcm = match read_wav_pcm(wav_file) {
        Ok(pcm) => pcm,
        Err(e) => {
            eprintln!("Error reading file: {e:#}");
            return;
        }
    };
    let duration_s = (pcm.len() / 2) as f64 / SAMPLE_RATE as f64;

    for run in 1..=runs {
        println!("=== Run {run} ===");
        let transcriber = app.transcriber();
        let session = match transcriber.new_session(session_config(app, &transcriber)) {
            Ok(session) => session,
            Err(e) => {
                eprintln!("Error creating session: {e}");
                return;
            }
        };

        println!("Simulating {duration_s:.1}s recording...");
        session.feed(&pcm);
        match session.close().await {
            Ok(result) => {
                if result.no_speech {
                    println!("Text: (no speech detected)");
                } else {
                    println!("Text: {}", result.text);
                }
                for line in &result.metrics {
                    println!("  {line}");
                }
                println!();
            }
            Err(e) => {
                eprintln!("Error: {e}");
                return;
            }
        }

        if run < runs {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Headless stdin driver: `start` opens a session and feeds the WAV,
/// `stop` closes it and prints the result, `quit` exits.
async fn run_test_mode(app: &Arc<App>, wav_file: &str) -> Result<()> {
    let pcm = read_wav_pcm(wav_file)?;
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(tokio::io::stdin()));

    let mut session = None;
    while let Some(line) = lines
        .next_line()
        .await
        .context("reading stdin commands")?
    {
        match line.trim() {
            "start" => {
                if session.is_some() {
                    eprintln!("already recording");
                    continue;
                }
                let transcriber = app.transcriber();
                let new_session = transcriber
                    .new_session(session_config(app, &transcriber))
                    .context("opening session")?;
                new_session.feed(&pcm);
                session = Some(new_session);
                println!("recording");
            }
            "stop" => {
                let Some(active) = session.take() else {
                    eprintln!("not recording");
                    continue;
                };
                match active.close().await {
                    Ok(result) => {
                        if result.no_speech {
                            println!("(no speech detected)");
                        } else {
                            println!("{}", result.text);
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            "quit" | "exit" => break,
            "" => {}
            other => eprintln!("unknown command {other:?} (start, stop, quit)"),
        }
    }
    Ok(())
}
