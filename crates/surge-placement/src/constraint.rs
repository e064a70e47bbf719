//! Constraint variants and the evaluation over a snapshot.
//!
//! Constraints are plain data composed into a [`ConstraintSet`] per
//! target. Evaluation is a pure function over a [`ClusterSnapshot`]:
//! the same inputs always pick the same node.

use tracing::debug;

use surge_state::{NodeId, NodeInfo, ReplicaId, TargetId};

use crate::snapshot::ClusterSnapshot;

/// One placement rule. Declaration order is ranking priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Avoid co-locating replicas of the same target on one node.
    /// Soft: orders candidates, never defers a placement.
    AntiAffinity,
    /// Keep per-domain replica counts for `key` within `max_skew`.
    /// Tracked: with no acceptable candidate the request goes `Pending`.
    TopologySpread { key: String, max_skew: u32 },
}

/// Outcome of one constraint evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Place the replica on this node.
    Placed(NodeId),
    /// No node currently satisfies the tracked constraints. Retried
    /// next cycle and whenever cluster state changes.
    Pending,
}

/// One scheduling attempt for one new replica. Transient: consumed by
/// [`ConstraintSet::evaluate`], discarded after it places or defers.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub replica_id: ReplicaId,
    pub target: TargetId,
}

/// The ordered constraints governing one target's replicas.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Choose a node for one new replica, or defer.
    ///
    /// Spread keys filter: a candidate must keep skew within `max_skew`
    /// for every key, and must carry every key. Survivors are ranked per
    /// constraint in declaration order (lower load wins), then by node
    /// id. No survivor means `Pending`.
    pub fn evaluate(&self, request: &PlacementRequest, snapshot: &ClusterSnapshot) -> Placement {
        let feasible: Vec<&NodeInfo> = snapshot
            .nodes()
            .iter()
            .filter(|node| self.spread_holds_after(node, snapshot))
            .collect();

        if feasible.is_empty() {
            debug!(
                replica = %request.replica_id,
                target = %request.target,
                "no candidate node satisfies spread constraints"
            );
            return Placement::Pending;
        }

        let mut ranked: Vec<(Vec<u32>, &NodeInfo)> = feasible
            .into_iter()
            .map(|node| (self.rank(node, snapshot), node))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let chosen = ranked[0].1.id.clone();
        debug!(
            replica = %request.replica_id,
            target = %request.target,
            node = %chosen,
            "placement chosen"
        );
        Placement::Placed(chosen)
    }

    /// Pick the node to lose a replica on scale-down.
    ///
    /// Mirrors placement in reverse: drain the most-loaded domain of the
    /// highest-priority key first, then the node with the most co-located
    /// replicas, then node id. `None` when no inventoried node holds a
    /// replica of the target.
    pub fn select_victim(&self, snapshot: &ClusterSnapshot) -> Option<NodeId> {
        let mut candidates: Vec<&NodeInfo> = snapshot
            .nodes()
            .iter()
            .filter(|node| snapshot.replicas_on(&node.id) > 0)
            .collect();
        candidates.sort_by(|a, b| {
            self.rank(b, snapshot)
                .cmp(&self.rank(a, snapshot))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.first().map(|node| node.id.clone())
    }

    /// Whether placing on `node` keeps every spread key within bounds.
    fn spread_holds_after(&self, node: &NodeInfo, snapshot: &ClusterSnapshot) -> bool {
        for constraint in &self.constraints {
            if let Constraint::TopologySpread { key, max_skew } = constraint {
                // Nodes missing the key are ineligible under that key.
                let Some(domain) = node.labels.get(key) else {
                    return false;
                };
                if snapshot.skew_after(key, domain) > *max_skew {
                    return false;
                }
            }
        }
        true
    }

    /// Per-constraint load vector. Lower places first; higher drains
    /// first. A node missing a spread key ranks as maximally loaded.
    fn rank(&self, node: &NodeInfo, snapshot: &ClusterSnapshot) -> Vec<u32> {
        self.constraints
            .iter()
            .map(|constraint| match constraint {
                Constraint::AntiAffinity => snapshot.replicas_on(&node.id),
                Constraint::TopologySpread { key, .. } => node
                    .labels
                    .get(key)
                    .map(|domain| snapshot.domain_count(key, domain))
                    .unwrap_or(u32::MAX),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use surge_state::ReplicaInfo;

    use super::*;

    fn node(id: &str, labels: &[(&str, &str)]) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn replica(id: &str, node: &str) -> ReplicaInfo {
        ReplicaInfo {
            id: id.to_string(),
            target: "web".to_string(),
            node: node.to_string(),
            labels: HashMap::new(),
        }
    }

    fn request(id: &str) -> PlacementRequest {
        PlacementRequest {
            replica_id: id.to_string(),
            target: "web".to_string(),
        }
    }

    fn spread(key: &str, max_skew: u32) -> Constraint {
        Constraint::TopologySpread {
            key: key.to_string(),
            max_skew,
        }
    }

    #[test]
    fn anti_affinity_prefers_empty_node() {
        let set = ConstraintSet::new(vec![Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(
            vec![node("n1", &[]), node("n2", &[])],
            &[replica("r1", "n1")],
        );
        assert_eq!(
            set.evaluate(&request("r2"), &snapshot),
            Placement::Placed("n2".to_string())
        );
    }

    #[test]
    fn anti_affinity_never_defers() {
        // Single node, already loaded. Best effort still places there.
        let set = ConstraintSet::new(vec![Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(
            vec![node("n1", &[])],
            &[replica("r1", "n1"), replica("r2", "n1"), replica("r3", "n1")],
        );
        assert_eq!(
            set.evaluate(&request("r4"), &snapshot),
            Placement::Placed("n1".to_string())
        );
    }

    #[test]
    fn spread_places_into_emptiest_domain() {
        let set = ConstraintSet::new(vec![spread("zone", 1)]);
        let snapshot = ClusterSnapshot::new(
            vec![
                node("na", &[("zone", "a")]),
                node("nb", &[("zone", "b")]),
                node("nc", &[("zone", "c")]),
            ],
            &[replica("r1", "na"), replica("r2", "nb")],
        );
        assert_eq!(
            set.evaluate(&request("r3"), &snapshot),
            Placement::Placed("nc".to_string())
        );
    }

    #[test]
    fn spread_defers_when_no_candidate_fits() {
        // Pre-existing imbalance of 3: even the empty zone leaves skew 2.
        let set = ConstraintSet::new(vec![spread("zone", 1)]);
        let snapshot = ClusterSnapshot::new(
            vec![node("na", &[("zone", "a")]), node("nb", &[("zone", "b")])],
            &[replica("r1", "na"), replica("r2", "na"), replica("r3", "na")],
        );
        assert_eq!(set.evaluate(&request("r4"), &snapshot), Placement::Pending);
    }

    #[test]
    fn node_missing_key_is_ineligible() {
        let set = ConstraintSet::new(vec![spread("zone", 1), Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(
            vec![node("na", &[("zone", "a")]), node("nx", &[])],
            &[],
        );
        // nx is emptier under anti-affinity but carries no zone.
        assert_eq!(
            set.evaluate(&request("r1"), &snapshot),
            Placement::Placed("na".to_string())
        );
    }

    #[test]
    fn all_nodes_missing_key_is_pending() {
        let set = ConstraintSet::new(vec![spread("zone", 2)]);
        let snapshot = ClusterSnapshot::new(vec![node("n1", &[]), node("n2", &[])], &[]);
        assert_eq!(set.evaluate(&request("r1"), &snapshot), Placement::Pending);
    }

    #[test]
    fn no_nodes_is_pending() {
        let set = ConstraintSet::new(vec![Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(vec![], &[]);
        assert_eq!(set.evaluate(&request("r1"), &snapshot), Placement::Pending);
    }

    #[test]
    fn declaration_order_is_ranking_priority() {
        // x is best for the zone key, y best for the disk key.
        let nodes = vec![
            node("x", &[("zone", "a"), ("disk", "hdd")]),
            node("y", &[("zone", "b"), ("disk", "ssd")]),
            node("z", &[("zone", "b"), ("disk", "hdd")]),
        ];
        let replicas = [replica("r1", "z")];

        let zone_first = ConstraintSet::new(vec![spread("zone", 3), spread("disk", 3)]);
        let snapshot = ClusterSnapshot::new(nodes.clone(), &replicas);
        assert_eq!(
            zone_first.evaluate(&request("r2"), &snapshot),
            Placement::Placed("x".to_string())
        );

        let disk_first = ConstraintSet::new(vec![spread("disk", 3), spread("zone", 3)]);
        assert_eq!(
            disk_first.evaluate(&request("r2"), &snapshot),
            Placement::Placed("y".to_string())
        );
    }

    #[test]
    fn node_id_breaks_remaining_ties() {
        let set = ConstraintSet::new(vec![Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(
            vec![node("n2", &[]), node("n1", &[]), node("n3", &[])],
            &[],
        );
        assert_eq!(
            set.evaluate(&request("r1"), &snapshot),
            Placement::Placed("n1".to_string())
        );
    }

    #[test]
    fn empty_set_places_on_first_node_by_id() {
        let set = ConstraintSet::default();
        let snapshot = ClusterSnapshot::new(vec![node("b", &[]), node("a", &[])], &[]);
        assert_eq!(
            set.evaluate(&request("r1"), &snapshot),
            Placement::Placed("a".to_string())
        );
    }

    #[test]
    fn batch_spreads_with_recorded_placements() {
        let set = ConstraintSet::new(vec![spread("zone", 1), Constraint::AntiAffinity]);
        let mut snapshot = ClusterSnapshot::new(
            vec![
                node("na", &[("zone", "a")]),
                node("nb", &[("zone", "b")]),
                node("nc", &[("zone", "c")]),
            ],
            &[],
        );
        let mut placed = Vec::new();
        for i in 0..3 {
            match set.evaluate(&request(&format!("r{i}")), &snapshot) {
                Placement::Placed(node_id) => {
                    snapshot.record(&node_id);
                    placed.push(node_id);
                }
                Placement::Pending => panic!("batch placement deferred"),
            }
        }
        placed.sort();
        assert_eq!(placed, vec!["na", "nb", "nc"]);
        assert!(snapshot.skew("zone") <= 1);
    }

    #[test]
    fn select_victim_drains_most_loaded_domain() {
        let set = ConstraintSet::new(vec![spread("zone", 1), Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(
            vec![
                node("na1", &[("zone", "a")]),
                node("na2", &[("zone", "a")]),
                node("nb", &[("zone", "b")]),
            ],
            &[
                replica("r1", "na1"),
                replica("r2", "na1"),
                replica("r3", "na2"),
                replica("r4", "nb"),
            ],
        );
        // Zone a holds 3 of 4; within it na1 holds the most.
        assert_eq!(set.select_victim(&snapshot), Some("na1".to_string()));
    }

    #[test]
    fn select_victim_most_colocated_under_anti_affinity() {
        let set = ConstraintSet::new(vec![Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(
            vec![node("n1", &[]), node("n2", &[])],
            &[replica("r1", "n1"), replica("r2", "n2"), replica("r3", "n2")],
        );
        assert_eq!(set.select_victim(&snapshot), Some("n2".to_string()));
    }

    #[test]
    fn select_victim_none_without_replicas() {
        let set = ConstraintSet::new(vec![Constraint::AntiAffinity]);
        let snapshot = ClusterSnapshot::new(vec![node("n1", &[])], &[]);
        assert_eq!(set.select_victim(&snapshot), None);
    }
}
