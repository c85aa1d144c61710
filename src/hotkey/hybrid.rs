//! Tap-vs-hold disambiguation over the raw hotkey.
//!
//! Start fires on keydown immediately; latency matters more than knowing
//! which mode the press will turn out to be. The long-press timer then
//! decides: keyup first is a tap (toggle recording, wait for the next
//! down+up to stop), timer first is a hold (push-to-talk, stop on keyup).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::HotkeyEvents;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Ptt,
    Toggle,
}

#[derive(Clone, Copy, Debug)]
pub struct StartEvent {
    pub mode: Mode,
}

pub struct Hybrid {
    pub start: mpsc::UnboundedReceiver<StartEvent>,
    pub stop: mpsc::UnboundedReceiver<()>,
    is_toggle: Arc<AtomicBool>,
}

impl Hybrid {
    pub fn spawn(mut keys: HotkeyEvents, long_press: Duration) -> Self {
        let (start_tx, start) = mpsc::unbounded_channel();
        let (stop_tx, stop) = mpsc::unbounded_channel();
        let is_toggle = Arc::new(AtomicBool::new(false));
        let flag = is_toggle.clone();

        tokio::spawn(async move {
            loop {
                // Idle: a keydown starts recording right away.
                if keys.keydown.recv().await.is_none() {
                    return;
                }
                flag.store(false, Ordering::SeqCst);
                if start_tx.send(StartEvent { mode: Mode::Toggle }).is_err() {
                    return;
                }

                let timer = tokio::time::sleep(long_press);
                tokio::pin!(timer);
                tokio::select! {
                    _ = &mut timer => {
                        // Hold: push-to-talk, stop when the key comes up.
                        if keys.keyup.recv().await.is_none() {
                            return;
                        }
                        let _ = stop_tx.send(());
                    }
                    up = keys.keyup.recv() => {
                        if up.is_none() {
                            return;
                        }
                        // Tap: latch toggle mode, the next press+release stops.
                        flag.store(true, Ordering::SeqCst);
                        if keys.keydown.recv().await.is_none() {
                            return;
                        }
                        if keys.keyup.recv().await.is_none() {
                            return;
                        }
                        let _ = stop_tx.send(());
                    }
                }
            }
        });

        Self {
            start,
            stop,
            is_toggle,
        }
    }

    /// Read by the silence monitor: auto-close applies only in toggle mode.
    pub fn toggle_flag(&self) -> Arc<AtomicBool> {
        self.is_toggle.clone()
    }

    pub fn is_toggle(&self) -> bool {
        self.is_toggle.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::super::FakeHotkey;
    use super::*;
    use tokio::time::{sleep, timeout};

    const TICK: Duration = Duration::from_millis(10);

    async fn wait_start(hy: &mut Hybrid) -> StartEvent {
        timeout(Duration::from_secs(1), hy.start.recv())
            .await
            .expect("timed out waiting for start")
            .expect("start channel closed")
    }

    async fn wait_stop(hy: &mut Hybrid) {
        timeout(Duration::from_secs(1), hy.stop.recv())
            .await
            .expect("timed out waiting for stop")
            .expect("stop channel closed");
    }

    #[tokio::test]
    async fn long_press_is_ptt() {
        let (fk, events) = FakeHotkey::new();
        let threshold = Duration::from_millis(50);
        let mut hy = Hybrid::spawn(events, threshold);

        fk.sim_keydown();
        wait_start(&mut hy).await;

        sleep(threshold + Duration::from_millis(30)).await;
        assert!(!hy.is_toggle(), "expected ptt after long press");
        fk.sim_keyup();
        wait_stop(&mut hy).await;
    }

    #[tokio::test]
    async fn short_tap_is_toggle() {
        let (fk, events) = FakeHotkey::new();
        let mut hy = Hybrid::spawn(events, Duration::from_millis(200));

        fk.sim_keydown();
        wait_start(&mut hy).await;
        fk.sim_keyup();
        sleep(TICK).await;
        assert!(hy.is_toggle(), "expected toggle after short tap");

        // No stop yet: the toggle recording is still running.
        assert!(
            timeout(Duration::from_millis(50), hy.stop.recv())
                .await
                .is_err(),
            "unexpected stop after short tap"
        );

        // Second press+release stops it.
        fk.sim_keydown();
        fk.sim_keyup();
        wait_stop(&mut hy).await;
    }

    #[tokio::test]
    async fn modes_alternate_across_cycles() {
        let (fk, events) = FakeHotkey::new();
        let threshold = Duration::from_millis(50);
        let mut hy = Hybrid::spawn(events, threshold);

        // Cycle 1: hold.
        fk.sim_keydown();
        wait_start(&mut hy).await;
        sleep(threshold + Duration::from_millis(30)).await;
        fk.sim_keyup();
        wait_stop(&mut hy).await;
        assert!(!hy.is_toggle());

        // Cycle 2: tap.
        fk.sim_keydown();
        wait_start(&mut hy).await;
        fk.sim_keyup();
        sleep(TICK * 2).await;
        assert!(hy.is_toggle());
        fk.sim_keydown();
        fk.sim_keyup();
        wait_stop(&mut hy).await;

        // Cycle 3: hold again.
        fk.sim_keydown();
        wait_start(&mut hy).await;
        sleep(threshold + Duration::from_millis(30)).await;
        fk.sim_keyup();
        wait_stop(&mut hy).await;
        assert!(!hy.is_toggle());
    }
}
