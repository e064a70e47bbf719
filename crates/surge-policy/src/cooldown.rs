//! Cooldown gating for scale actions.
//!
//! One gate per target, owned by that target's evaluation task. The gate
//! only looks at whether a decision would change the replica count; what
//! the count is comes from the policy.

use tracing::debug;

use surge_state::ScalingDecision;

/// Suppresses count-changing decisions that arrive too soon after the
/// last applied scale action.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown_secs: u64,
    /// Unix timestamp of the last permitted scale action.
    last_action: Option<u64>,
}

impl CooldownGate {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown_secs,
            last_action: None,
        }
    }

    /// Rule on a decision at time `now`.
    ///
    /// Decisions that leave the count unchanged always pass and never
    /// touch the timer. A count-changing decision passes only once the
    /// window since the last action has elapsed, and resets the timer
    /// when it does.
    pub fn permit(&mut self, decision: &ScalingDecision, now: u64) -> bool {
        if !decision.changes_count() {
            return true;
        }
        if let Some(last) = self.last_action
            && now.saturating_sub(last) < self.cooldown_secs
        {
            debug!(
                since = now.saturating_sub(last),
                cooldown = self.cooldown_secs,
                target_replicas = decision.target_replicas,
                "scale action suppressed by cooldown"
            );
            return false;
        }
        self.last_action = Some(now);
        true
    }

    /// When the last scale action was permitted, if any.
    pub fn last_action(&self) -> Option<u64> {
        self.last_action
    }
}
