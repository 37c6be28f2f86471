//! Single-slot admission control between frame delivery and inference.
//!
//! A frame is admitted only while no other frame is in flight; everything that
//! arrives in the meantime is dropped rather than queued. Both admitting and
//! clearing are a single atomic operation, so the delivery thread never blocks.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[derive(Debug, Default)]
pub struct FrameGate {
    busy: AtomicBool,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Returns false when a frame is already in flight.
    pub fn try_admit(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Free the slot. Returns false if it was not taken.
    pub fn clear(&self) -> bool {
        self.busy.swap(false, Ordering::AcqRel)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the slot and tie its release to the returned guard.
    pub fn admit(self: &Arc<Self>) -> Option<Admission> {
        self.try_admit().then(|| Admission { gate: self.clone() })
    }
}

/// An admitted frame's claim on the gate. The slot frees when this drops,
/// whichever path the frame takes.
#[derive(Debug)]
pub struct Admission {
    gate: Arc<FrameGate>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.gate.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    #[test]
    fn second_admission_is_refused_until_cleared() {
        let gate = FrameGate::new();
        assert!(gate.try_admit());
        assert!(!gate.try_admit());
        assert!(gate.clear());
        assert!(gate.try_admit());
    }

    #[test]
    fn clearing_an_idle_gate_reports_false() {
        let gate = FrameGate::new();
        assert!(!gate.clear());
        assert!(!gate.is_busy());
    }

    #[test]
    fn admission_guard_clears_on_drop() {
        let gate = Arc::new(FrameGate::new());
        let admission = gate.admit().unwrap();
        assert!(gate.admit().is_none());
        drop(admission);
        assert!(!gate.is_busy());
        assert!(gate.admit().is_some());
    }

    #[test]
    fn at_most_one_admission_under_contention() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let gate = Arc::new(FrameGate::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let gate = gate.clone();
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        if let Some(admission) = gate.admit() {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            drop(admission);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }
}
