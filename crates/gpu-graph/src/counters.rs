use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Allocation accounting for executable graphs.
///
/// Shared through an `Arc` by every executable instantiated against it.
/// Updates are relaxed: only the final values matter, never the interleaving.
#[derive(Debug, Default)]
pub struct GraphExecCounters {
    allocated: AtomicUsize,
    alive: AtomicUsize,
}

/// Point-in-time copy of [`GraphExecCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphExecStats {
    pub allocated: usize,
    pub alive: usize,
}

impl GraphExecCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Records a new executable and returns its id.
    pub(crate) fn notify_created(&self) -> usize {
        let id = self.allocated.fetch_add(1, Ordering::Relaxed);
        self.alive.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Records a destroyed executable and returns the number still alive.
    pub(crate) fn notify_destroyed(&self) -> usize {
        self.alive.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Executables instantiated so far, including destroyed ones.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> GraphExecStats {
        GraphExecStats {
            allocated: self.allocated(),
            alive: self.alive(),
        }
    }
}
