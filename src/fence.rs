// SPDX-License-Identifier: GPL-3.0-only

//! Ownership-tracked synchronization handles.
//!
//! A [`Fence`] is the consumer half of a one-shot sync primitive: it can be
//! waited on, duplicated, and is closed exactly once when dropped. The
//! producer half ([`FenceSignaller`]) stays with whoever completes the work,
//! typically the commit sink. Every open handle is accounted for in a
//! [`FenceLedger`] so the display can verify after each frame that no
//! acquire fence was left dangling.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// What role a fence plays in the frame protocol. Used only for ledger
/// accounting and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceKind {
    /// A client buffer becomes readable by the display pipeline.
    SrcAcquire,
    /// The display pipeline is done reading a client buffer.
    SrcRelease,
    /// A previously displayed frame's resources are safe to reuse.
    Retire,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTime {
    At(Instant),
    Pending,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: Mutex<Option<Instant>>,
    cond: Condvar,
}

/// Open-handle accounting shared by all fences of one display.
#[derive(Debug, Default)]
pub struct FenceLedger {
    open: Mutex<HashMap<FenceKind, i64>>,
}

impl FenceLedger {
    pub fn new() -> Arc<FenceLedger> {
        Arc::new(FenceLedger::default())
    }

    fn opened(&self, kind: FenceKind) {
        *self.open.lock().entry(kind).or_insert(0) += 1;
    }

    fn closed(&self, kind: FenceKind) {
        let mut open = self.open.lock();
        let count = open.entry(kind).or_insert(0);
        *count -= 1;
        if *count < 0 {
            tracing::error!(?kind, "fence ledger went negative, double close?");
        }
    }

    /// Total number of currently open handles.
    pub fn outstanding(&self) -> i64 {
        self.open.lock().values().sum()
    }

    pub fn outstanding_of(&self, kind: FenceKind) -> i64 {
        self.open.lock().get(&kind).copied().unwrap_or(0)
    }
}

/// Move-only consumer handle. Dropping it closes the handle and balances
/// the ledger; there is no way to leak one short of `mem::forget`.
#[derive(Debug)]
pub struct Fence {
    state: Arc<FenceState>,
    kind: FenceKind,
    ledger: Arc<FenceLedger>,
}

impl Fence {
    /// Create a connected fence/signaller pair.
    pub fn pair(ledger: &Arc<FenceLedger>, kind: FenceKind) -> (Fence, FenceSignaller) {
        let state = Arc::new(FenceState::default());
        ledger.opened(kind);
        (
            Fence {
                state: state.clone(),
                kind,
                ledger: ledger.clone(),
            },
            FenceSignaller { state },
        )
    }

    /// Create an already-signaled fence.
    pub fn signaled(ledger: &Arc<FenceLedger>, kind: FenceKind) -> Fence {
        let (fence, signaller) = Fence::pair(ledger, kind);
        signaller.signal();
        fence
    }

    pub fn kind(&self) -> FenceKind {
        self.kind
    }

    pub fn ledger(&self) -> &Arc<FenceLedger> {
        &self.ledger
    }

    /// A second owned handle to the same underlying primitive.
    pub fn dup(&self) -> Fence {
        self.ledger.opened(self.kind);
        Fence {
            state: self.state.clone(),
            kind: self.kind,
            ledger: self.ledger.clone(),
        }
    }

    /// Re-tag a handle, e.g. when the last retire fence is handed out as a
    /// release fence for an unchanged commit.
    pub fn dup_as(&self, kind: FenceKind) -> Fence {
        self.ledger.opened(kind);
        Fence {
            state: self.state.clone(),
            kind,
            ledger: self.ledger.clone(),
        }
    }

    /// Block until the fence signals or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitStatus {
        let mut signaled = self.state.signaled.lock();
        if signaled.is_some() {
            return WaitStatus::Signaled;
        }
        let deadline = Instant::now() + timeout;
        while signaled.is_none() {
            if self.state.cond.wait_until(&mut signaled, deadline).timed_out() {
                return if signaled.is_some() {
                    WaitStatus::Signaled
                } else {
                    WaitStatus::TimedOut
                };
            }
        }
        WaitStatus::Signaled
    }

    pub fn signal_time(&self) -> SignalTime {
        match *self.state.signaled.lock() {
            Some(at) => SignalTime::At(at),
            None => SignalTime::Pending,
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.state.signaled.lock().is_some()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.ledger.closed(self.kind);
    }
}

/// Producer half. Kept by the collaborator that completes the work; calling
/// [`FenceSignaller::signal`] wakes all waiters. Signalling is idempotent.
#[derive(Debug)]
pub struct FenceSignaller {
    state: Arc<FenceState>,
}

impl FenceSignaller {
    pub fn signal(&self) {
        let mut signaled = self.state.signaled.lock();
        if signaled.is_none() {
            *signaled = Some(Instant::now());
            self.state.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wakes_waiters() {
        let ledger = FenceLedger::new();
        let (fence, signaller) = Fence::pair(&ledger, FenceKind::Retire);
        assert_eq!(fence.wait(Duration::from_millis(1)), WaitStatus::TimedOut);
        assert_eq!(fence.signal_time(), SignalTime::Pending);

        signaller.signal();
        assert_eq!(fence.wait(Duration::from_millis(1)), WaitStatus::Signaled);
        assert!(matches!(fence.signal_time(), SignalTime::At(_)));

        // Idempotent.
        signaller.signal();
        assert!(fence.is_signaled());
    }

    #[test]
    fn ledger_balances_on_drop() {
        let ledger = FenceLedger::new();
        let (fence, _signaller) = Fence::pair(&ledger, FenceKind::SrcAcquire);
        let dup = fence.dup();
        let retagged = fence.dup_as(FenceKind::SrcRelease);
        assert_eq!(ledger.outstanding_of(FenceKind::SrcAcquire), 2);
        assert_eq!(ledger.outstanding_of(FenceKind::SrcRelease), 1);
        assert_eq!(ledger.outstanding(), 3);

        drop(dup);
        drop(retagged);
        drop(fence);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn dup_shares_signal_state() {
        let ledger = FenceLedger::new();
        let (fence, signaller) = Fence::pair(&ledger, FenceKind::SrcRelease);
        let dup = fence.dup();
        drop(fence);
        signaller.signal();
        assert_eq!(dup.wait(Duration::ZERO), WaitStatus::Signaled);
    }
}
