//! Tick-driven silence monitor.
//!
//! One recording owns one monitor. A 100 ms ticker feeds it the VAD's
//! per-tick speech verdict; the monitor answers with at most one event per
//! tick. Warnings use a higher clear threshold than the trigger threshold so
//! marginal audio cannot flap the warning state, and the auto-close /
//! repeat-beep behaviors apply only while the hotkey is latched in toggle
//! mode; a held key means the user is present.

use std::time::Duration;

pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
const SILENCE_WARN_EVERY: Duration = Duration::from_secs(8);
const SILENCE_AUTO_CLOSE: Duration = Duration::from_secs(30);
const SPEECH_MIN_RATIO: f64 = 0.10;
const SPEECH_CLEAR_RATIO: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SilenceEvent {
    None,
    /// No voice detected for the warn window.
    Warn,
    /// Speech resumed after a warning.
    WarnClear,
    /// Repeat beep while still warned (toggle mode only).
    Repeat,
    /// Full window silent (toggle mode only).
    AutoClose,
}

pub struct SilenceMonitor<F: Fn() -> bool> {
    warn_at: usize,
    window_size: usize,
    is_toggle: F,

    ticks: usize,
    window: Vec<bool>,
    speech_count: usize,
    warned: bool,
    last_beep: usize,
}

impl<F: Fn() -> bool> SilenceMonitor<F> {
    pub fn new(is_toggle: F) -> Self {
        let warn_at = (SILENCE_WARN_EVERY.as_millis() / TICK_INTERVAL.as_millis()) as usize;
        let window_size = (SILENCE_AUTO_CLOSE.as_millis() / TICK_INTERVAL.as_millis()) as usize;
        Self {
            warn_at,
            window_size,
            is_toggle,
            ticks: 0,
            window: vec![false; window_size],
            speech_count: 0,
            warned: false,
            last_beep: 0,
        }
    }

    /// Speech ratio over the most recent `n` ticks (or fewer, early on).
    fn ratio(&self, n: usize) -> f64 {
        let n = n.min(self.ticks);
        if n == 0 {
            return 1.0;
        }
        let mut count = 0;
        for i in 0..n {
            if self.window[(self.ticks - 1 - i + self.window_size) % self.window_size] {
                count += 1;
            }
        }
        count as f64 / n as f64
    }

    pub fn tick(&mut self, has_speech: bool) -> SilenceEvent {
        let idx = self.ticks % self.window_size;
        if self.ticks >= self.window_size && self.window[idx] {
            self.speech_count -= 1;
        }
        self.window[idx] = has_speech;
        if has_speech {
            self.speech_count += 1;
        }
        self.ticks += 1;

        let r = self.ratio(self.warn_at);

        if self.ticks >= self.warn_at && r < SPEECH_MIN_RATIO && !self.warned {
            self.warned = true;
            self.last_beep = self.ticks;
            return SilenceEvent::Warn;
        }
        if self.warned && r >= SPEECH_CLEAR_RATIO {
            self.warned = false;
            return SilenceEvent::WarnClear;
        }

        if !(self.is_toggle)() {
            return SilenceEvent::None;
        }

        // Auto-close outranks the repeat beep.
        if self.ticks >= self.window_size
            && (self.speech_count as f64 / self.window_size as f64) < SPEECH_MIN_RATIO
        {
            return SilenceEvent::AutoClose;
        }

        if self.warned && self.ticks - self.last_beep >= self.warn_at {
            self.last_beep = self.ticks;
            return SilenceEvent::Repeat;
        }

        SilenceEvent::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptt_monitor() -> SilenceMonitor<fn() -> bool> {
        SilenceMonitor::new(|| false)
    }

    fn toggle_monitor() -> SilenceMonitor<fn() -> bool> {
        SilenceMonitor::new(|| true)
    }

    fn feed_n<F: Fn() -> bool>(m: &mut SilenceMonitor<F>, speech: bool, n: usize) -> SilenceEvent {
        let mut last = SilenceEvent::None;
        for _ in 0..n {
            last = m.tick(speech);
        }
        last
    }

    #[test]
    fn warn_fires_exactly_at_eight_seconds() {
        let mut m = ptt_monitor();
        for i in 0..79 {
            assert_eq!(m.tick(false), SilenceEvent::None, "tick {i}");
        }
        assert_eq!(m.tick(false), SilenceEvent::Warn);
    }

    #[test]
    fn ptt_silence_stays_quiet_after_warning() {
        let mut m = ptt_monitor();
        feed_n(&mut m, false, 80);
        for i in 0..220 {
            assert_eq!(m.tick(false), SilenceEvent::None, "tick {i} after warn");
        }
    }

    #[test]
    fn warn_clears_only_above_hysteresis_threshold() {
        let mut m = ptt_monitor();
        feed_n(&mut m, false, 80);

        // 10% speech sits between the 10% trigger and 25% clear thresholds.
        for i in 0..80 {
            let ev = m.tick(i % 10 == 0);
            assert_ne!(ev, SilenceEvent::WarnClear, "cleared at tick {i}");
        }

        // Sustained speech clears exactly once.
        let mut clears = 0;
        for _ in 0..20 {
            if m.tick(true) == SilenceEvent::WarnClear {
                clears += 1;
            }
        }
        assert_eq!(clears, 1);
    }

    #[test]
    fn no_warn_during_speech() {
        let mut m = ptt_monitor();
        for _ in 0..200 {
            assert_ne!(m.tick(true), SilenceEvent::Warn);
        }
    }

    #[test]
    fn warn_fires_once_per_warning_period() {
        let mut m = ptt_monitor();
        let mut warns = 0;
        for _ in 0..300 {
            if m.tick(false) == SilenceEvent::Warn {
                warns += 1;
            }
        }
        assert_eq!(warns, 1);
    }

    #[test]
    fn toggle_mode_repeats_beep() {
        let mut m = toggle_monitor();
        feed_n(&mut m, false, 80);
        let mut got_repeat = false;
        for _ in 0..100 {
            if m.tick(false) == SilenceEvent::Repeat {
                got_repeat = true;
                break;
            }
        }
        assert!(got_repeat);
    }

    #[test]
    fn auto_close_beats_repeat() {
        let mut m = toggle_monitor();
        let mut got_warn = false;
        let mut got_repeat = false;
        for i in 0..400 {
            match m.tick(false) {
                SilenceEvent::Warn => got_warn = true,
                SilenceEvent::Repeat => got_repeat = true,
                SilenceEvent::AutoClose => {
                    assert!(got_warn && got_repeat);
                    assert!(i >= 299, "auto-close before the 30s window at tick {i}");
                    return;
                }
                _ => {}
            }
        }
        panic!("expected AutoClose within 400 ticks");
    }

    #[test]
    fn no_auto_close_or_repeat_in_ptt() {
        let mut m = ptt_monitor();
        for _ in 0..400 {
            let ev = m.tick(false);
            assert_ne!(ev, SilenceEvent::AutoClose);
            assert_ne!(ev, SilenceEvent::Repeat);
        }
    }

    #[test]
    fn speech_prevents_auto_close() {
        let mut m = toggle_monitor();
        for i in 0..500 {
            let speech = i % 10 < 7;
            assert_ne!(m.tick(speech), SilenceEvent::AutoClose, "tick {i}");
        }
    }

    #[test]
    fn warning_survives_sporadic_vad_noise() {
        let mut m = ptt_monitor();
        feed_n(&mut m, false, 80);
        for i in 0..80 {
            let ev = m.tick(i % 10 == 0);
            assert_ne!(ev, SilenceEvent::WarnClear);
        }
    }

    #[test]
    fn speech_count_matches_window_sum() {
        let mut m = toggle_monitor();
        for i in 0..700 {
            m.tick(i % 3 == 0);
            let populated = m.ticks.min(m.window_size);
            let sum = (0..populated)
                .filter(|&j| m.window[(m.ticks - 1 - j + m.window_size) % m.window_size])
                .count();
            assert_eq!(m.speech_count, sum, "tick {i}");
        }
    }
}
