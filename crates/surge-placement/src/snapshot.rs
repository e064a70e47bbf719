//! Per-target cluster view used by constraint evaluation.
//!
//! Bridges `surge_state::{NodeInfo, ReplicaInfo}` into the counts the
//! constraints operate on. A snapshot is built once per evaluation cycle
//! and mutated only through [`ClusterSnapshot::record`] and
//! [`ClusterSnapshot::remove`] as a scale batch walks it.

use std::collections::HashMap;

use surge_state::{NodeId, NodeInfo, ReplicaInfo};

/// Node inventory plus one target's replica distribution.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    nodes: Vec<NodeInfo>,
    /// Node id → replicas of the target currently on that node.
    replicas_per_node: HashMap<NodeId, u32>,
}

impl ClusterSnapshot {
    /// Build a snapshot from the orchestration boundary's view.
    ///
    /// Nodes are sorted by id so iteration order is deterministic.
    /// Replicas hosted on nodes absent from the inventory still count
    /// toward totals but belong to no topology domain.
    pub fn new(mut nodes: Vec<NodeInfo>, replicas: &[ReplicaInfo]) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut replicas_per_node: HashMap<NodeId, u32> = HashMap::new();
        for replica in replicas {
            *replicas_per_node.entry(replica.node.clone()).or_insert(0) += 1;
        }
        Self {
            nodes,
            replicas_per_node,
        }
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Replicas of the target on one node.
    pub fn replicas_on(&self, node_id: &str) -> u32 {
        self.replicas_per_node.get(node_id).copied().unwrap_or(0)
    }

    pub fn total_replicas(&self) -> u32 {
        self.replicas_per_node.values().sum()
    }

    /// The topology domain a node belongs to under one label key.
    pub fn domain_of(&self, node_id: &str, key: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.id == node_id)
            .and_then(|n| n.labels.get(key))
            .map(String::as_str)
    }

    /// Replicas of the target in one topology domain.
    pub fn domain_count(&self, key: &str, domain: &str) -> u32 {
        self.replicas_per_node
            .iter()
            .filter(|(node_id, _)| self.domain_of(node_id, key) == Some(domain))
            .map(|(_, n)| *n)
            .sum()
    }

    /// Per-domain replica counts for one key, zero-count domains included.
    ///
    /// A domain exists as soon as any node in the inventory carries the
    /// key; an empty domain drags the minimum to zero.
    fn domain_counts(&self, key: &str) -> HashMap<&str, u32> {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for node in &self.nodes {
            if let Some(domain) = node.labels.get(key) {
                counts.entry(domain.as_str()).or_insert(0);
            }
        }
        for (node_id, n) in &self.replicas_per_node {
            if let Some(domain) = self.domain_of(node_id, key) {
                *counts.entry(domain).or_insert(0) += n;
            }
        }
        counts
    }

    /// Current skew for one key: max domain count minus min domain count.
    pub fn skew(&self, key: &str) -> u32 {
        let counts = self.domain_counts(key);
        match (counts.values().max(), counts.values().min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        }
    }

    /// Skew for one key if one more replica landed in `domain`.
    pub fn skew_after<'a>(&'a self, key: &str, domain: &'a str) -> u32 {
        let mut counts = self.domain_counts(key);
        *counts.entry(domain).or_insert(0) += 1;
        match (counts.values().max(), counts.values().min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        }
    }

    /// Account a placement so the next evaluation in the batch sees it.
    pub fn record(&mut self, node_id: &str) {
        *self
            .replicas_per_node
            .entry(node_id.to_string())
            .or_insert(0) += 1;
    }

    /// Account a removal during a scale-down batch.
    pub fn remove(&mut self, node_id: &str) {
        if let Some(count) = self.replicas_per_node.get_mut(node_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.replicas_per_node.remove(node_id);
            }
        }
    }
}
