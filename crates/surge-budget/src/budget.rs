//! The disruption budget.
//!
//! One budget per scaling target, owned by that target's evaluation task
//! (single writer). `total_replicas` follows the converged replica count
//! via `set_total`, so the minimum-available guarantee tracks reality
//! rather than the configured floor.

use tracing::debug;

/// Tracks how many replicas may be voluntarily unavailable at once.
///
/// Invariant: `unavailable <= total_replicas - min_available()` after
/// every successful acquire.
#[derive(Debug, Clone)]
pub struct DisruptionBudget {
    max_unavailable: u32,
    total_replicas: u32,
    unavailable: u32,
}

impl DisruptionBudget {
    pub fn new(max_unavailable: u32, total_replicas: u32) -> Self {
        Self {
            max_unavailable,
            total_replicas,
            unavailable: 0,
        }
    }

    /// Replicas that must remain available.
    pub fn min_available(&self) -> u32 {
        self.total_replicas.saturating_sub(self.max_unavailable)
    }

    /// Reserve `n` voluntary disruption slots.
    ///
    /// Succeeds only if the reservation keeps `unavailable` within
    /// `total_replicas - min_available()`; on failure nothing is reserved
    /// and the caller must defer the removal.
    pub fn try_acquire(&mut self, n: u32) -> bool {
        let allowed = self.total_replicas.saturating_sub(self.min_available());
        if self.unavailable.saturating_add(n) <= allowed {
            self.unavailable += n;
            debug!(n, unavailable = self.unavailable, allowed, "disruption slots acquired");
            true
        } else {
            debug!(
                n,
                unavailable = self.unavailable,
                allowed,
                "disruption denied, removal deferred"
            );
            false
        }
    }

    /// Return `n` previously acquired slots.
    pub fn release(&mut self, n: u32) {
        self.unavailable = self.unavailable.saturating_sub(n);
        debug!(n, unavailable = self.unavailable, "disruption slots released");
    }

    /// Follow the converged replica count for this target.
    pub fn set_total(&mut self, total: u32) {
        self.total_replicas = total;
    }

    /// Currently reserved voluntary disruptions.
    pub fn unavailable(&self) -> u32 {
        self.unavailable
    }

    pub fn total_replicas(&self) -> u32 {
        self.total_replicas
    }
}
