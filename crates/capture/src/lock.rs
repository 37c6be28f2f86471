//! Binary lock guarding the camera open/close windows.
//!
//! The lock is a single token parked in a one-slot channel. Acquiring takes the
//! token out, dropping the returned [`LockToken`] puts it back. Unlike a mutex
//! guard the token may be handed to another thread, which is how the open window
//! ends on the hardware callback thread rather than on the caller's.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::error;

#[derive(Clone)]
pub struct HardwareLock {
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// Proof of lock ownership. Releases the lock on drop.
#[must_use = "dropping the token releases the camera lock immediately"]
pub struct LockToken {
    tx: Sender<()>,
}

impl HardwareLock {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        // The slot starts full: the lock is free.
        let _ = tx.try_send(());
        Self { tx, rx }
    }

    /// Wait at most `timeout` for the lock. `None` means the deadline passed.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<LockToken> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Some(self.token()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self) -> Option<LockToken> {
        self.rx.try_recv().ok().map(|()| self.token())
    }

    /// Block until the lock is available.
    pub fn acquire(&self) -> LockToken {
        // Both ends live in `self`, so the channel cannot disconnect here.
        let _ = self.rx.recv();
        self.token()
    }

    pub fn is_locked(&self) -> bool {
        self.rx.is_empty()
    }

    fn token(&self) -> LockToken {
        LockToken {
            tx: self.tx.clone(),
        }
    }
}

impl Default for HardwareLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                error!("camera lock released while already free");
            }
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}
