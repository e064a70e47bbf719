//! surge-policy — replica-count decisions with cooldown suppression.
//!
//! `decide` turns one metric observation into a `ScalingDecision`; the
//! `CooldownGate` then rules on whether the decision may be applied now.
//! Both are pure over their inputs, so every branch is unit-testable with
//! explicit timestamps.
//!
//! # Scaling Algorithm
//!
//! ```text
//! value = observed metric (scalar or unavailable)
//!
//! if value is unavailable:
//!     Suppressed, hold current count
//!
//! if value < activation_threshold:
//!     desired = min_replicas          // signal inactive
//! else:
//!     desired = ceil(current * value / threshold)
//!
//! target = clamp(desired, min_replicas, max_replicas)
//! ```
//!
//! The clamp holds regardless of input magnitude. The cooldown window
//! suppresses any count-changing decision that lands within
//! `cooldown_secs` of the last applied action; `NoChange` passes freely
//! and never resets the window.

pub mod cooldown;
pub mod policy;

pub use cooldown::CooldownGate;
pub use policy::{PolicyParams, decide};
