use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds since the UNIX epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-node Lamport clock.
///
/// # Rules
///
/// - **Local event**: `tick()` returns `local + 1` and stores it.
/// - **Receive**: `observe(l)` stores `max(local, l)`; the next local event
///   is then strictly after everything seen so far.
///
/// Lock-free; safe to share across tasks.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a recovered value.
    pub fn starting_at(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Advance for a local event and return the new value.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a lamport value seen on an incoming operation.
    pub fn observe(&self, incoming: u64) -> u64 {
        self.value.fetch_max(incoming, Ordering::SeqCst).max(incoming)
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}
