//! Voice activity classification over the rolling capture stream.
//!
//! The audio callback hands over arbitrarily sized byte chunks; the
//! processor reframes them into fixed 20 ms frames and classifies each with
//! the WebRTC VAD in its most aggressive profile. The silence monitor polls
//! [`VadProcessor::has_speech_tick`] once per 100 ms tick.

use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use earshot::{VoiceActivityDetector, VoiceActivityProfile};

use crate::encoder::SAMPLE_RATE;

pub const VAD_FRAME_MS: usize = 20;
pub const VAD_FRAME_BYTES: usize = SAMPLE_RATE as usize * VAD_FRAME_MS / 1000 * 2; // 640
const VAD_FRAME_SAMPLES: usize = VAD_FRAME_BYTES / 2;

/// Consecutive speech frames required before voice counts as confirmed.
const VAD_DEBOUNCE: u32 = 3;

/// Share of frames in a tick window that must be speech to count as speaking.
const SPEECH_THRESHOLD: f64 = 0.10;

struct VadState {
    vad: VoiceActivityDetector,
    buf: Vec<u8>,
    frame: Vec<i16>,
    voice_detected: bool,
    last_voice_time: Option<Instant>,
    speech_run: u32,
    total_frames: u64,
    speech_frames: u64,
    last_total: u64,
    last_speech: u64,
    tick_total: u64,
    tick_speech: u64,
}

/// Called from the audio callback (`process`) and the tick task
/// (`has_speech_tick`); all state sits behind one mutex.
pub struct VadProcessor {
    state: Mutex<VadState>,
}

impl VadProcessor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(VadState {
                vad: VoiceActivityDetector::new(VoiceActivityProfile::VERY_AGGRESSIVE),
                buf: Vec::new(),
                frame: Vec::with_capacity(VAD_FRAME_SAMPLES),
                voice_detected: false,
                last_voice_time: None,
                speech_run: 0,
                total_frames: 0,
                speech_frames: 0,
                last_total: 0,
                last_speech: 0,
                tick_total: 0,
                tick_speech: 0,
            }),
        })
    }

    /// Classify whatever complete 20 ms frames the chunk yields; trailing
    /// bytes under one frame carry over to the next call.
    pub fn process(&self, data: &[u8]) {
        let mut s = self.state.lock().unwrap();
        s.buf.extend_from_slice(data);

        while s.buf.len() >= VAD_FRAME_BYTES {
            s.frame.clear();
            for i in 0..VAD_FRAME_SAMPLES {
                let lo = s.buf[i * 2];
                let hi = s.buf[i * 2 + 1];
                let sample = i16::from_le_bytes([lo, hi]);
                s.frame.push(sample);
            }
            s.buf.drain(..VAD_FRAME_BYTES);

            let frame = std::mem::take(&mut s.frame);
            let active = match s.vad.predict_16khz(&frame) {
                Ok(active) => active,
                Err(_) => {
                    s.frame = frame;
                    continue;
                }
            };
            s.frame = frame;

            s.total_frames += 1;
            if active {
                s.speech_frames += 1;
                s.speech_run += 1;
                if s.voice_detected {
                    s.last_voice_time = Some(Instant::now());
                } else if s.speech_run >= VAD_DEBOUNCE {
                    s.voice_detected = true;
                    s.last_voice_time = Some(Instant::now());
                }
            } else {
                s.speech_run = 0;
            }
        }
    }

    pub fn voice_detected(&self) -> bool {
        self.state.lock().unwrap().voice_detected
    }

    pub fn last_voice_time(&self) -> Option<Instant> {
        self.state.lock().unwrap().last_voice_time
    }

    pub fn stats(&self) -> (u64, u64) {
        let s = self.state.lock().unwrap();
        (s.total_frames, s.speech_frames)
    }

    /// Counters accumulated since the previous `stats_delta` call.
    pub fn stats_delta(&self) -> (u64, u64) {
        let mut s = self.state.lock().unwrap();
        let t = s.total_frames - s.last_total;
        let sp = s.speech_frames - s.last_speech;
        s.last_total = s.total_frames;
        s.last_speech = s.speech_frames;
        (t, sp)
    }

    /// True iff at least 10% of the VAD frames since the last tick query
    /// were speech. Advances the tick cursors, so each frame is counted in
    /// exactly one tick window.
    pub fn has_speech_tick(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        let t = s.total_frames - s.tick_total;
        let sp = s.speech_frames - s.tick_speech;
        s.tick_total = s.total_frames;
        s.tick_speech = s.speech_frames;
        if t == 0 {
            return false;
        }
        sp as f64 / t as f64 >= SPEECH_THRESHOLD
    }

    pub fn reset(&self) {
        let mut s = self.state.lock().unwrap();
        s.buf.clear();
        s.voice_detected = false;
        s.last_voice_time = None;
        s.speech_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_complete_frames() {
        let vp = VadProcessor::new().expect("vad");
        // 1000 bytes = one complete 640-byte frame plus 360 carried over.
        vp.process(&vec![0u8; 1000]);
        let (total, speech) = vp.stats();
        assert_eq!(total, 1);
        assert_eq!(speech, 0);

        // The carried 360 bytes complete a second frame with 280 more.
        vp.process(&vec![0u8; 280]);
        let (total, _) = vp.stats();
        assert_eq!(total, 2);
    }

    #[test]
    fn speech_frames_never_exceed_total() {
        let vp = VadProcessor::new().expect("vad");
        for chunk in [3usize, 639, 640, 641, 1280, 77] {
            vp.process(&vec![0u8; chunk]);
            let (total, speech) = vp.stats();
            assert!(speech <= total);
        }
    }

    #[test]
    fn silence_does_not_confirm_voice() {
        let vp = VadProcessor::new().expect("vad");
        vp.process(&vec![0u8; VAD_FRAME_BYTES * 50]);
        assert!(!vp.voice_detected());
        assert!(vp.last_voice_time().is_none());
    }

    #[test]
    fn tick_windows_partition_the_frame_stream() {
        let vp = VadProcessor::new().expect("vad");
        vp.process(&vec![0u8; VAD_FRAME_BYTES * 5]);
        assert!(!vp.has_speech_tick());

        // Nothing new since the last tick: the window is empty, not reused.
        assert!(!vp.has_speech_tick());

        vp.process(&vec![0u8; VAD_FRAME_BYTES * 3]);
        let (delta_total, _) = vp.stats_delta();
        assert_eq!(delta_total, 8);
    }

    #[test]
    fn reset_clears_carry_and_voice_state() {
        let vp = VadProcessor::new().expect("vad");
        vp.process(&vec![0u8; 100]);
        vp.reset();
        vp.process(&vec![0u8; VAD_FRAME_BYTES - 100]);
        // The pre-reset 100 bytes must not combine with the new chunk.
        let (total, _) = vp.stats();
        assert_eq!(total, 0);
    }
}
