//! Audio capture backend.
//!
//! cpal streams are not `Send`, so each capture device owns a dedicated
//! thread that builds the stream and services start/stop commands. The
//! recording pipeline installs its per-recording sink through an atomically
//! swappable callback slot; swapping the slot is the lifecycle primitive
//! for starting and stopping capture, and the realtime thread only ever
//! pays one atomic load to find it.

pub mod picker;

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwapOption;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, warn};

/// Called from the realtime audio thread with interleaved PCM16 LE bytes
/// and the frame count. The slice does not outlive the call.
pub struct DataCallback(pub Box<dyn Fn(&[u8], u32) + Send + Sync>);

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Opaque platform identifier; cpal only exposes names portably, so the
    /// name doubles as the id.
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Device names that suggest a Bluetooth route and its narrow-band capture
/// profile.
pub fn is_bluetooth(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["bluez", "bluetooth", "airpods", "a2dp", "handsfree"]
        .iter()
        .any(|tag| lower.contains(tag))
}

pub struct AudioContext {
    host: cpal::Host,
}

impl AudioContext {
    pub fn new() -> Result<Self> {
        Ok(Self {
            host: cpal::default_host(),
        })
    }

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self
            .host
            .input_devices()
            .context("enumerating input devices")?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceInfo {
                id: name.clone(),
                name,
            })
            .collect())
    }

    /// Open a capture device at the requested rate and channel count, or
    /// fail; sample-rate conversion is the platform's concern, not ours.
    pub fn new_capture(
        &self,
        device: Option<&DeviceInfo>,
        config: CaptureConfig,
    ) -> Result<CaptureDevice> {
        let cpal_device = match device {
            Some(info) => self
                .host
                .input_devices()
                .context("enumerating input devices")?
                .find(|d| d.name().map(|n| n == info.name).unwrap_or(false))
                .ok_or_else(|| anyhow!("capture device {:?} not found", info.name))?,
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| anyhow!("no default capture device"))?,
        };
        CaptureDevice::open(cpal_device, config)
    }
}

enum CaptureCommand {
    Start(std_mpsc::Sender<Result<()>>),
    Stop,
    Close,
}

pub struct CaptureDevice {
    callback: Arc<ArcSwapOption<DataCallback>>,
    cmd_tx: std_mpsc::Sender<CaptureCommand>,
    thread: Option<thread::JoinHandle<()>>,
    device_name: String,
}

impl CaptureDevice {
    fn open(device: cpal::Device, config: CaptureConfig) -> Result<Self> {
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        let callback: Arc<ArcSwapOption<DataCallback>> = Arc::new(ArcSwapOption::empty());
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<CaptureCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let slot = callback.clone();
        let thread = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(device, config, slot, cmd_rx, ready_tx))
            .context("spawning capture thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                callback,
                cmd_tx,
                thread: Some(thread),
                device_name,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow!("capture thread died during open")),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn set_callback(&self, cb: DataCallback) {
        self.callback.store(Some(Arc::new(cb)));
    }

    pub fn clear_callback(&self) {
        self.callback.store(None);
    }

    pub fn start(&self) -> Result<()> {
        let (ack_tx, ack_rx) = std_mpsc::channel();
        self.cmd_tx
            .send(CaptureCommand::Start(ack_tx))
            .map_err(|_| anyhow!("capture thread gone"))?;
        ack_rx
            .recv()
            .map_err(|_| anyhow!("capture thread gone during start"))?
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(CaptureCommand::Stop);
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(CaptureCommand::Close);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn capture_thread(
    device: cpal::Device,
    config: CaptureConfig,
    slot: Arc<ArcSwapOption<DataCallback>>,
    cmd_rx: std_mpsc::Receiver<CaptureCommand>,
    ready_tx: std_mpsc::Sender<Result<()>>,
) {
    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = config.channels as usize;

    let sample_format = match device.default_input_config() {
        Ok(cfg) => cfg.sample_format(),
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("querying device config: {e}")));
            return;
        }
    };

    let err_fn = |e: cpal::StreamError| warn!("capture stream error: {}", e);

    let build = || -> Result<cpal::Stream> {
        let stream = match sample_format {
            cpal::SampleFormat::I16 => {
                let slot = slot.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if let Some(cb) = slot.load_full() {
                            let mut bytes = Vec::with_capacity(data.len() * 2);
                            for &s in data {
                                bytes.extend_from_slice(&s.to_le_bytes());
                            }
                            (cb.0)(&bytes, (data.len() / channels) as u32);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::F32 => {
                let slot = slot.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if let Some(cb) = slot.load_full() {
                            let mut bytes = Vec::with_capacity(data.len() * 2);
                            for &s in data {
                                let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                                bytes.extend_from_slice(&v.to_le_bytes());
                            }
                            (cb.0)(&bytes, (data.len() / channels) as u32);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            other => return Err(anyhow!("unsupported capture sample format {other:?}")),
        };
        Ok(stream)
    };

    let stream = match build() {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.context("building capture stream")));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    debug!("capture stream open");

    for cmd in cmd_rx {
        match cmd {
            CaptureCommand::Start(ack) => {
                let result = stream.play().map_err(|e| anyhow!("starting capture: {e}"));
                let _ = ack.send(result);
            }
            CaptureCommand::Stop => {
                if let Err(e) = stream.pause() {
                    debug!("pausing capture: {}", e);
                }
            }
            CaptureCommand::Close => break,
        }
    }
    debug!("capture stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bluetooth_heuristic_matches_common_names() {
        assert!(is_bluetooth("bluez_input.70:26:05:A3"));
        assert!(is_bluetooth("AirPods Pro"));
        assert!(!is_bluetooth("ALC295 Analog"));
    }

    #[test]
    fn callback_slot_swaps_atomically() {
        let slot: Arc<ArcSwapOption<DataCallback>> = Arc::new(ArcSwapOption::empty());
        assert!(slot.load().is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        slot.store(Some(Arc::new(DataCallback(Box::new(move |data, frames| {
            assert_eq!(data.len(), frames as usize * 2);
            counter.fetch_add(1, Ordering::SeqCst);
        })))));

        if let Some(cb) = slot.load_full() {
            (cb.0)(&[0, 0, 1, 0], 2);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        slot.store(None);
        assert!(slot.load().is_none());
    }
}
