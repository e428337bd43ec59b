//! Process-wide preemption suppression counter.
//!
//! Any router that has lost its interface or cannot transmit takes a unit.
//! While the counter is non-zero no router preempts and every router
//! advertises with at least [`CARP_SUPPRESSED_ADVSKEW`](crate::types::CARP_SUPPRESSED_ADVSKEW).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Default)]
pub struct SuppressionCounter {
    inner: Arc<AtomicU32>,
}

impl SuppressionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn is_suppressed(&self) -> bool {
        self.get() > 0
    }

    /// Take a unit. Returns the new value.
    pub fn increment(&self) -> u32 {
        self.inner.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Release a unit. Returns the new value; saturates at zero.
    pub fn decrement(&self) -> u32 {
        let previous = self
            .inner
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
            .unwrap_or_default();
        debug_assert!(previous > 0, "suppression counter underflow");
        previous.saturating_sub(1)
    }
}
