//! Surge autoscaling controller.
//!
//! Composes the policy, cooldown gate, disruption budget, and placement
//! constraints into one reconciliation loop per scaling target. The
//! controller talks to the cluster only through the [`Orchestrator`]
//! boundary and to the metrics backend only through
//! [`surge_metrics::MetricSource`], so the whole loop runs unchanged
//! against a real cluster or the in-memory one.
//!
//! # Components
//!
//! - **`controller`** — the per-target evaluation cycle and run loop
//! - **`orchestrator`** — the cluster boundary and its in-memory implementation
//! - **`inflight`** — dispatched-but-unconfirmed delta accounting
//! - **`error`** — controller error types

pub mod controller;
pub mod error;
pub mod inflight;
pub mod orchestrator;

pub use controller::{Controller, ControllerPhase, TargetParams};
pub use error::{ControllerError, ControllerResult};
pub use inflight::InFlight;
pub use orchestrator::{BoxFuture, LocalOrchestrator, Orchestrator};
