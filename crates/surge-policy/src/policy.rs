//! The scaling decision function.
//!
//! Pure: one metric sample plus the current replica count in, one
//! `ScalingDecision` out. The controller owns timing, gating, and
//! dispatch; nothing here has side effects beyond logging.

use tracing::debug;

use surge_state::{DecisionReason, MetricSample, ScalingDecision};

/// Tunables for one target's decisions.
///
/// `threshold` is the metric value one replica is expected to absorb;
/// `activation_threshold` must be strictly below it (enforced at config
/// validation, not here).
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyParams {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub threshold: f64,
    pub activation_threshold: f64,
}

/// Decide the target replica count for one observation.
///
/// An unavailable sample holds the current count (`Suppressed`), never
/// treats the signal as zero. Below the activation threshold the target
/// drifts to `min_replicas`. Otherwise the count scales proportionally
/// with `value / threshold`, saturating into `[min_replicas, max_replicas]`.
pub fn decide(current: u32, sample: &MetricSample, params: &PolicyParams) -> ScalingDecision {
    let value = match sample.value.as_scalar() {
        Some(v) => v,
        None => {
            debug!(current, query = %sample.query, "metric unavailable, holding replica count");
            return ScalingDecision {
                target_replicas: current,
                reason: DecisionReason::Suppressed,
                timestamp: sample.observed_at,
            };
        }
    };

    let desired = if value < params.activation_threshold {
        params.min_replicas
    } else {
        // Saturating cast: a huge ratio lands on u32::MAX before the clamp.
        let raw = ((current as f64) * (value / params.threshold)).ceil() as u32;
        raw.clamp(params.min_replicas, params.max_replicas)
    };

    let reason = if desired > current {
        DecisionReason::ScaleUp
    } else if desired < current {
        DecisionReason::ScaleDown
    } else {
        DecisionReason::NoChange
    };

    debug!(
        current,
        desired,
        value,
        threshold = params.threshold,
        ?reason,
        "scaling decision"
    );

    ScalingDecision {
        target_replicas: desired,
        reason,
        timestamp: sample.observed_at,
    }
}
