// SPDX-License-Identifier: GPL-3.0-only

//! Power-hint worker.
//!
//! Frames signal "not idle" to the platform power layer. The signal is
//! throttled and delivered off the frame path over a bounded channel so a
//! slow power service can never stall present.

use std::{
    sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
    thread,
    time::{Duration, Instant},
};

const QUEUE_DEPTH: usize = 4;
const THROTTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    NonIdle,
    Shutdown,
}

#[derive(Debug)]
pub struct HintSender {
    tx: SyncSender<Hint>,
}

impl HintSender {
    pub fn spawn() -> HintSender {
        let (tx, rx) = sync_channel(QUEUE_DEPTH);
        thread::Builder::new()
            .name("dpu-hints".into())
            .spawn(move || worker(rx))
            .map_err(|err| tracing::error!(?err, "failed to spawn hint worker"))
            .ok();
        HintSender { tx }
    }

    /// Best effort. A full queue means the worker is already busy waking
    /// the power layer and the hint can be dropped.
    pub fn signal_non_idle(&self) {
        match self.tx.try_send(Hint::NonIdle) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("hint worker is gone");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(Hint::Shutdown);
    }
}

fn worker(rx: Receiver<Hint>) {
    profiling::register_thread!("dpu-hints");
    let mut last_sent: Option<Instant> = None;
    while let Ok(hint) = rx.recv() {
        match hint {
            Hint::Shutdown => break,
            Hint::NonIdle => {
                if last_sent.map(|at| at.elapsed() < THROTTLE).unwrap_or(false) {
                    continue;
                }
                last_sent = Some(Instant::now());
                tracing::trace!("delivering non-idle power hint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_does_not_block() {
        let sender = HintSender::spawn();
        for _ in 0..QUEUE_DEPTH * 4 {
            sender.signal_non_idle();
        }
        sender.shutdown();
    }
}
