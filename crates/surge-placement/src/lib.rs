//! Surge placement constraints — anti-affinity, topology spread.
//!
//! This crate decides which node a new replica lands on (and which node
//! loses one on scale-down). It does NOT talk to the cluster: the
//! controller hands it a [`ClusterSnapshot`] built from the orchestration
//! boundary and gets back a node id or a deferral.
//!
//! # Components
//!
//! - **`snapshot`** — per-target view of nodes, replica counts, topology domains
//! - **`constraint`** — constraint variants and the evaluation over a snapshot
//!
//! # Evaluation model
//!
//! Constraints are data, evaluated as a pure function over the snapshot:
//!
//! ```text
//! evaluate(request, snapshot)
//!   ├─ TopologySpread keys filter: candidates that keep skew ≤ max_skew
//!   │    (no survivor → Pending, retried on cluster change)
//!   ├─ rank survivors per constraint in declaration order
//!   │    (AntiAffinity: fewest co-located; spread: emptiest domain)
//!   └─ node id breaks remaining ties
//! ```
//!
//! Anti-affinity is soft: it orders candidates but never defers a
//! placement on its own. Spread is the only constraint that can produce
//! `Pending`.

pub mod constraint;
pub mod snapshot;

pub use constraint::{Constraint, ConstraintSet, Placement, PlacementRequest};
pub use snapshot::ClusterSnapshot;
