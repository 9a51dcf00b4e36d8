//! Single-slot force-sync request.

use std::sync::{Mutex, PoisonError};

/// Holds at most one pending force-sync target.
///
/// Setting replaces any pending target; [`ForceTarget::take`] swaps the slot
/// empty atomically so a target is consumed by exactly one cycle.
#[derive(Debug, Default)]
pub struct ForceTarget {
    slot: Mutex<Option<String>>,
}

impl ForceTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: impl Into<String>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.into());
    }

    /// Consume the pending target, leaving the slot empty.
    pub fn take(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
