//! Domain types for the Surge state store.
//!
//! These types represent scaling targets, metric samples, scaling
//! decisions, and the cluster-state snapshot elements the controller
//! consumes. All persisted types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a scaling target (workload name).
pub type TargetId = String;

/// Unique identifier for a replica of a target.
pub type ReplicaId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

// ── Target ────────────────────────────────────────────────────────

/// A workload whose replica count the controller converges.
///
/// Mutated only by the controller after a successful reconciliation;
/// created at workload registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingTarget {
    pub name: TargetId,
    /// Replica count as of the last reconciliation.
    pub current_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Unix timestamp (seconds) when this target was registered.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last reconciliation.
    pub updated_at: u64,
}

// ── Metrics ───────────────────────────────────────────────────────

/// A scalar observation from the metrics backend, or the absence of one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Scalar(f64),
    /// Backend timeout, error, stale data, or a non-finite value.
    Unavailable,
}

impl MetricValue {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MetricValue::Unavailable)
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Unavailable => None,
        }
    }
}

/// One metric observation, owned by the polling cycle that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub value: MetricValue,
    /// Unix timestamp (seconds) when the value was observed.
    pub observed_at: u64,
    /// The query expression that produced this sample (opaque).
    pub query: String,
}

// ── Decisions ─────────────────────────────────────────────────────

/// Why a decision landed where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ScaleUp,
    ScaleDown,
    NoChange,
    Suppressed,
}

/// Outcome of one evaluation cycle for one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingDecision {
    pub target_replicas: u32,
    pub reason: DecisionReason,
    /// Unix timestamp (seconds) of the evaluation.
    pub timestamp: u64,
}

impl ScalingDecision {
    /// Whether applying this decision would change the replica count.
    pub fn changes_count(&self) -> bool {
        matches!(self.reason, DecisionReason::ScaleUp | DecisionReason::ScaleDown)
    }
}

/// Archived decision, one per evaluation that reached the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub target: TargetId,
    /// Monotonic per-target sequence number, assigned by the store.
    pub seq: u64,
    pub decision: ScalingDecision,
    /// The metric value the decision was based on.
    pub observed: MetricValue,
}

impl DecisionRecord {
    /// Build the composite key for the decisions table.
    ///
    /// Sequence numbers are zero-padded so lexicographic key order is
    /// append order.
    pub fn table_key(&self) -> String {
        format!("{}/{:020}", self.target, self.seq)
    }
}

// ── Cluster snapshot ──────────────────────────────────────────────

/// A node as reported by the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Topology labels (`zone`, `fault-domain`, ...) used by placement.
    pub labels: HashMap<String, String>,
}

/// A running replica as reported by the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub target: TargetId,
    /// Node currently hosting this replica.
    pub node: NodeId,
    pub labels: HashMap<String, String>,
}
