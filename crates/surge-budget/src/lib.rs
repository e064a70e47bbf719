//! surge-budget — availability gating for voluntary replica removals.
//!
//! Every removal the control plane initiates itself (scale-down, rolling
//! update, node drain) must first reserve a slot here; involuntary losses
//! (node crash) never pass through this gate. A denied reservation is not
//! an error: the caller defers the removal and retries on a later cycle.

pub mod budget;

pub use budget::DisruptionBudget;
