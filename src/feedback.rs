//! Recording feedback tones.
//!
//! Three short generated tones: a bright tick on start, a lower tick on
//! stop, and a double beep for the silence warning. Playback is
//! fire-and-forget on its own thread so it never touches the audio
//! callback path.

use std::sync::OnceLock;
use std::thread;

use log::debug;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStreamBuilder, Sink};

const PLAYBACK_RATE: u32 = 44_100;

#[derive(Clone, Copy)]
enum Tone {
    Start,
    End,
    Error,
}

struct ToneBank {
    start: Vec<f32>,
    end: Vec<f32>,
    error: Vec<f32>,
}

fn tone_bank() -> &'static ToneBank {
    static BANK: OnceLock<ToneBank> = OnceLock::new();
    BANK.get_or_init(|| ToneBank {
        start: tick(1200.0, 0.2, 0.5, 60.0),
        end: tick(900.0, 0.2, 0.5, 40.0),
        error: double_beep(350.0, 0.08, 0.05, 0.6, 30.0),
    })
}

fn tick(freq: f32, duration: f32, volume: f32, decay: f32) -> Vec<f32> {
    let n = (PLAYBACK_RATE as f32 * duration) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / PLAYBACK_RATE as f32;
            let envelope = (-t * decay).exp();
            (t * freq * 2.0 * std::f32::consts::PI).sin() * volume * envelope
        })
        .collect()
}

fn double_beep(freq: f32, beep_dur: f32, gap_dur: f32, volume: f32, decay: f32) -> Vec<f32> {
    let beep = tick(freq, beep_dur, volume, decay);
    let gap = vec![0.0; (PLAYBACK_RATE as f32 * gap_dur) as usize];
    let mut out = Vec::with_capacity(beep.len() * 2 + gap.len());
    out.extend_from_slice(&beep);
    out.extend_from_slice(&gap);
    out.extend_from_slice(&beep);
    out
}

fn play(tone: Tone) {
    thread::spawn(move || {
        let bank = tone_bank();
        let samples = match tone {
            Tone::Start => &bank.start,
            Tone::End => &bank.end,
            Tone::Error => &bank.error,
        }
        .clone();

        let builder = match OutputStreamBuilder::from_default_device() {
            Ok(builder) => builder,
            Err(e) => {
                debug!("feedback tone skipped: {}", e);
                return;
            }
        };
        let stream = match builder.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                debug!("feedback tone skipped: {}", e);
                return;
            }
        };
        let sink = Sink::connect_new(stream.mixer());
        sink.append(SamplesBuffer::new(1, PLAYBACK_RATE, samples));
        sink.sleep_until_end();
    });
}

/// Pre-generate the tone bank so the first beep has no synth latency.
pub fn init() {
    let _ = tone_bank();
}

pub fn play_start() {
    play(Tone::Start);
}

pub fn play_end() {
    play(Tone::End);
}

pub fn play_error() {
    play(Tone::Error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tones_have_expected_shape() {
        let bank = tone_bank();
        assert_eq!(bank.start.len(), (PLAYBACK_RATE as f32 * 0.2) as usize);
        assert_eq!(bank.end.len(), bank.start.len());
        // Double beep: two beeps plus the gap between them.
        let beep_len = (PLAYBACK_RATE as f32 * 0.08) as usize;
        let gap_len = (PLAYBACK_RATE as f32 * 0.05) as usize;
        assert_eq!(bank.error.len(), beep_len * 2 + gap_len);

        // The envelope decays: the last sample is quieter than the loudest.
        let peak = bank.start.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.1);
        assert!(bank.start.last().copied().unwrap_or(1.0).abs() < peak);
    }
}
