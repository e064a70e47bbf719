//! The per-target reconciliation loop.
//!
//! One controller per scaling target, one tokio task per controller,
//! no shared mutable state across targets. Each cycle:
//!
//! ```text
//! list nodes + replicas            (fresh, never a cached count)
//!   └─ settle in-flight deltas     (confirmed by replica id; removes
//!                                   release their budget slots)
//! retry pending placements         (queued Pending, before new work)
//! query metric source              (bounded internally, never stalls)
//! decide                           (pure policy over the effective count)
//!   └─ cooldown gate               (count-changing decisions only)
//! dispatch                         (placements and removals, one by one)
//! retry deferred removals          (after the decision; a scale-up
//!                                   reclaims them instead of creating)
//! record + persist                 (audit trail, target intent)
//! ```
//!
//! Replica deltas complete asynchronously; the controller never blocks
//! on them. `InFlight`, the pending queue, and the deferred counter
//! carry intent across cycles so a burst is dispatched exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use surge_budget::DisruptionBudget;
use surge_metrics::MetricSource;
use surge_placement::{ClusterSnapshot, ConstraintSet, Placement, PlacementRequest};
use surge_policy::{CooldownGate, PolicyParams, decide};
use surge_state::{
    DecisionReason, MetricValue, ReplicaId, ReplicaInfo, ScalingDecision, ScalingTarget,
    StateStore,
};

use crate::error::ControllerResult;
use crate::inflight::InFlight;
use crate::orchestrator::Orchestrator;

/// Audit records kept per target.
const DECISION_HISTORY: usize = 256;

/// Where a controller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Waiting for the next poll tick.
    Idle,
    /// Reading cluster state and running the policy.
    Evaluating,
    /// The cooldown gate rejected a would-be change this cycle.
    Suppressed,
    /// Dispatching replica deltas.
    Scaling,
}

/// Per-target tunables, resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct TargetParams {
    pub name: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub threshold: f64,
    pub activation_threshold: f64,
    pub cooldown_secs: u64,
    pub max_unavailable: u32,
    pub query: String,
    pub constraints: ConstraintSet,
}

impl TargetParams {
    fn policy(&self) -> PolicyParams {
        PolicyParams {
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            threshold: self.threshold,
            activation_threshold: self.activation_threshold,
        }
    }
}

/// Drives one scaling target.
///
/// Owns the cooldown gate, disruption budget, and delta bookkeeping for
/// its target; everything here is single-writer by construction.
pub struct Controller {
    params: TargetParams,
    store: StateStore,
    source: Box<dyn MetricSource>,
    orchestrator: Arc<dyn Orchestrator>,
    gate: CooldownGate,
    budget: DisruptionBudget,
    in_flight: InFlight,
    /// Approved new replicas still waiting for a feasible node.
    pending: u32,
    /// Approved removals still waiting for disruption budget.
    deferred: u32,
    phase: ControllerPhase,
}

impl Controller {
    pub fn new(
        params: TargetParams,
        store: StateStore,
        source: Box<dyn MetricSource>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let gate = CooldownGate::new(params.cooldown_secs);
        let budget = DisruptionBudget::new(params.max_unavailable, params.min_replicas);
        Self {
            params,
            store,
            source,
            orchestrator,
            gate,
            budget,
            in_flight: InFlight::new(0),
            pending: 0,
            deferred: 0,
            phase: ControllerPhase::Idle,
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    /// Pending placements queued for retry.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Create the target's store record if this is its first run.
    pub fn ensure_registered(&self) -> ControllerResult<ScalingTarget> {
        if let Some(target) = self.store.get_target(&self.params.name)? {
            return Ok(target);
        }
        let now = epoch_secs();
        let target = ScalingTarget {
            name: self.params.name.clone(),
            current_replicas: 0,
            min_replicas: self.params.min_replicas,
            max_replicas: self.params.max_replicas,
            created_at: now,
            updated_at: now,
        };
        self.store.put_target(&target)?;
        info!(target = %target.name, "scaling target registered");
        Ok(target)
    }

    /// Run one evaluation cycle.
    ///
    /// Returns the decision for the cycle; a cooldown rejection comes
    /// back as `Suppressed` at the held count. No error path leaves the
    /// stored target partially mutated.
    pub async fn reconcile(&mut self) -> ControllerResult<ScalingDecision> {
        self.set_phase(ControllerPhase::Evaluating);
        let now = epoch_secs();

        let nodes = self.orchestrator.list_nodes().await?;
        let replicas = self.orchestrator.list_replicas(&self.params.name).await?;
        let observed = replicas.len() as u32;

        let settlement = self
            .in_flight
            .settle(replicas.iter().map(|r| r.id.as_str()));
        if settlement.confirmed_removes > 0 {
            self.budget.release(settlement.confirmed_removes);
        }
        if self.in_flight.is_settled() && self.pending == 0 && self.deferred == 0 {
            self.budget.set_total(observed);
        }

        let mut snapshot = ClusterSnapshot::new(nodes, &replicas);
        // One set per cycle so the deferred retries and a fresh
        // scale-down never pick the same victim twice.
        let mut removed: HashSet<ReplicaId> = HashSet::new();

        self.retry_pending_placements(&mut snapshot).await?;

        let effective = self
            .in_flight
            .effective()
            .saturating_add(self.pending)
            .saturating_sub(self.deferred);

        let sample = self.source.query(&self.params.query).await;
        if sample.value.is_unavailable() {
            warn!(
                target = %self.params.name,
                query = %self.params.query,
                "metric unavailable, holding replica count"
            );
        }

        let decision = decide(effective, &sample, &self.params.policy());

        if !decision.changes_count() {
            self.retry_deferred_removals(&mut snapshot, &replicas, &mut removed)
                .await?;
            // Metric holds still reach the audit trail; NoChange does not.
            if decision.reason == DecisionReason::Suppressed {
                self.record_decision(&decision, sample.value)?;
            }
            self.sync_stored_count(effective, now)?;
            self.set_phase(ControllerPhase::Idle);
            return Ok(decision);
        }

        if !self.gate.permit(&decision, now) {
            self.set_phase(ControllerPhase::Suppressed);
            let held = ScalingDecision {
                target_replicas: effective,
                reason: DecisionReason::Suppressed,
                timestamp: decision.timestamp,
            };
            self.record_decision(&held, sample.value)?;
            info!(
                target = %self.params.name,
                held = effective,
                wanted = decision.target_replicas,
                "scale action suppressed by cooldown"
            );
            self.retry_deferred_removals(&mut snapshot, &replicas, &mut removed)
                .await?;
            self.set_phase(ControllerPhase::Idle);
            return Ok(held);
        }

        self.set_phase(ControllerPhase::Scaling);
        match decision.reason {
            DecisionReason::ScaleUp => {
                let mut delta = decision.target_replicas - effective;
                // A load reversal reclaims still-deferred removals one
                // for one instead of creating replicas alongside them.
                let reclaimed = delta.min(self.deferred);
                if reclaimed > 0 {
                    self.deferred -= reclaimed;
                    delta -= reclaimed;
                    info!(target = %self.params.name, reclaimed, "deferred removals reclaimed");
                }
                self.scale_up(delta, &mut snapshot).await?;
                self.retry_deferred_removals(&mut snapshot, &replicas, &mut removed)
                    .await?;
            }
            DecisionReason::ScaleDown => {
                self.retry_deferred_removals(&mut snapshot, &replicas, &mut removed)
                    .await?;
                let delta = effective - decision.target_replicas;
                self.scale_down(delta, &mut snapshot, &replicas, &mut removed)
                    .await?;
            }
            DecisionReason::NoChange | DecisionReason::Suppressed => {}
        }

        self.record_decision(&decision, sample.value)?;
        self.store_target(decision.target_replicas, now)?;
        info!(
            target = %self.params.name,
            from = effective,
            to = decision.target_replicas,
            reason = ?decision.reason,
            "scaling decision applied"
        );
        self.set_phase(ControllerPhase::Idle);
        Ok(decision)
    }

    /// Run the evaluation loop until shutdown.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            target = %self.params.name,
            interval_secs = interval.as_secs(),
            "controller started"
        );
        if let Err(e) = self.ensure_registered() {
            error!(target = %self.params.name, error = %e, "target registration failed");
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile().await {
                        error!(target = %self.params.name, error = %e, "reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(target = %self.params.name, "controller shutting down");
                    break;
                }
            }
        }
    }

    /// Finish removals approved in an earlier cycle once budget allows.
    async fn retry_deferred_removals(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        replicas: &[ReplicaInfo],
        removed: &mut HashSet<ReplicaId>,
    ) -> ControllerResult<()> {
        while self.deferred > 0 {
            if !self.budget.try_acquire(1) {
                break;
            }
            match self.remove_one(snapshot, replicas, removed).await {
                Ok(true) => {
                    self.deferred -= 1;
                    debug!(
                        target = %self.params.name,
                        deferred = self.deferred,
                        "deferred removal dispatched"
                    );
                }
                Ok(false) => {
                    // The replicas are already gone; drop the stale intent.
                    self.budget.release(1);
                    self.deferred = 0;
                    break;
                }
                Err(e) => {
                    self.budget.release(1);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Re-evaluate queued placements before any new work.
    async fn retry_pending_placements(
        &mut self,
        snapshot: &mut ClusterSnapshot,
    ) -> ControllerResult<()> {
        while self.pending > 0 {
            let request = PlacementRequest {
                replica_id: format!("{}-pending", self.params.name),
                target: self.params.name.clone(),
            };
            match self.params.constraints.evaluate(&request, snapshot) {
                Placement::Placed(node) => {
                    let id = self
                        .orchestrator
                        .create_replica(&self.params.name, &node)
                        .await?;
                    snapshot.record(&node);
                    self.in_flight.dispatched_create(&id);
                    self.pending -= 1;
                    info!(
                        target = %self.params.name,
                        replica = %id,
                        node = %node,
                        "pending placement resolved"
                    );
                }
                // Constraints see the same snapshot; the rest stay queued.
                Placement::Pending => break,
            }
        }
        Ok(())
    }

    async fn scale_up(&mut self, delta: u32, snapshot: &mut ClusterSnapshot) -> ControllerResult<()> {
        for i in 0..delta {
            let request = PlacementRequest {
                replica_id: format!("{}-new-{i}", self.params.name),
                target: self.params.name.clone(),
            };
            match self.params.constraints.evaluate(&request, snapshot) {
                Placement::Placed(node) => {
                    let id = self
                        .orchestrator
                        .create_replica(&self.params.name, &node)
                        .await?;
                    snapshot.record(&node);
                    self.in_flight.dispatched_create(&id);
                    debug!(
                        target = %self.params.name,
                        replica = %id,
                        node = %node,
                        "replica create dispatched"
                    );
                }
                Placement::Pending => {
                    self.pending += 1;
                    info!(
                        target = %self.params.name,
                        pending = self.pending,
                        "placement infeasible, replica queued"
                    );
                }
            }
        }
        Ok(())
    }

    async fn scale_down(
        &mut self,
        mut delta: u32,
        snapshot: &mut ClusterSnapshot,
        replicas: &[ReplicaInfo],
        removed: &mut HashSet<ReplicaId>,
    ) -> ControllerResult<()> {
        // Queued pending placements hold no capacity; cancel those first,
        // no budget needed.
        let cancelled = delta.min(self.pending);
        if cancelled > 0 {
            self.pending -= cancelled;
            delta -= cancelled;
            info!(target = %self.params.name, cancelled, "pending placements cancelled");
        }

        for i in 0..delta {
            if !self.budget.try_acquire(1) {
                let remaining = delta - i;
                self.deferred += remaining;
                warn!(
                    target = %self.params.name,
                    remaining,
                    "disruption budget exhausted, removals deferred"
                );
                break;
            }
            match self.remove_one(snapshot, replicas, removed).await {
                Ok(true) => {}
                Ok(false) => {
                    self.budget.release(1);
                    break;
                }
                // A removal that never went out holds no slot.
                Err(e) => {
                    self.budget.release(1);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Remove one replica, preferring the constraint set's victim node.
    ///
    /// Returns false when no replica is left to remove.
    async fn remove_one(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        replicas: &[ReplicaInfo],
        removed: &mut HashSet<ReplicaId>,
    ) -> ControllerResult<bool> {
        let candidate = match self.params.constraints.select_victim(snapshot) {
            Some(node) => replicas
                .iter()
                .filter(|r| r.node == node && !removed.contains(&r.id))
                .min_by(|a, b| a.id.cmp(&b.id)),
            // Replicas whose node left the inventory drain first here.
            None => replicas
                .iter()
                .filter(|r| !removed.contains(&r.id))
                .min_by(|a, b| a.id.cmp(&b.id)),
        };
        let Some(victim) = candidate else {
            return Ok(false);
        };
        self.orchestrator.remove_replica(&victim.id).await?;
        snapshot.remove(&victim.node);
        self.in_flight.dispatched_remove(&victim.id);
        removed.insert(victim.id.clone());
        debug!(
            target = %self.params.name,
            replica = %victim.id,
            node = %victim.node,
            "replica removal dispatched"
        );
        Ok(true)
    }

    fn record_decision(&self, decision: &ScalingDecision, observed: MetricValue) -> ControllerResult<()> {
        let record = self.store.append_decision(&self.params.name, decision, observed)?;
        debug!(
            target = %self.params.name,
            seq = record.seq,
            reason = ?decision.reason,
            "decision recorded"
        );
        self.store.prune_decisions(&self.params.name, DECISION_HISTORY)?;
        Ok(())
    }

    /// Persist the intended replica count after an applied decision.
    fn store_target(&self, current: u32, now: u64) -> ControllerResult<()> {
        let mut target = match self.store.get_target(&self.params.name)? {
            Some(t) => t,
            None => ScalingTarget {
                name: self.params.name.clone(),
                current_replicas: 0,
                min_replicas: self.params.min_replicas,
                max_replicas: self.params.max_replicas,
                created_at: now,
                updated_at: now,
            },
        };
        target.current_replicas = current;
        target.min_replicas = self.params.min_replicas;
        target.max_replicas = self.params.max_replicas;
        target.updated_at = now;
        self.store.put_target(&target)?;
        Ok(())
    }

    /// Catch the stored count up with reality after involuntary churn.
    fn sync_stored_count(&self, effective: u32, now: u64) -> ControllerResult<()> {
        if let Some(stored) = self.store.get_target(&self.params.name)?
            && stored.current_replicas != effective
        {
            self.store_target(effective, now)?;
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: ControllerPhase) {
        if self.phase != phase {
            debug!(target = %self.params.name, ?phase, "phase transition");
            self.phase = phase;
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use surge_metrics::StaticSource;
    use surge_placement::Constraint;
    use surge_state::NodeInfo;

    use super::*;
    use crate::orchestrator::{BoxFuture, LocalOrchestrator};

    fn test_params(name: &str) -> TargetParams {
        TargetParams {
            name: name.to_string(),
            min_replicas: 2,
            max_replicas: 10,
            threshold: 50.0,
            activation_threshold: 20.0,
            cooldown_secs: 0,
            max_unavailable: 1,
            query: "avg_load".to_string(),
            constraints: ConstraintSet::new(vec![Constraint::AntiAffinity]),
        }
    }

    fn make_node(id: &str, labels: &[(&str, &str)]) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn plain_nodes(n: usize) -> Vec<NodeInfo> {
        (1..=n).map(|i| make_node(&format!("n{i}"), &[])).collect()
    }

    fn controller_with(
        params: TargetParams,
        values: Vec<MetricValue>,
        nodes: Vec<NodeInfo>,
    ) -> (Controller, Arc<LocalOrchestrator>) {
        let store = StateStore::open_in_memory().unwrap();
        let orchestrator = Arc::new(LocalOrchestrator::new(nodes));
        let source = Box::new(StaticSource::new(values));
        let controller = Controller::new(params, store, source, orchestrator.clone());
        (controller, orchestrator)
    }

    fn scalars(values: &[f64]) -> Vec<MetricValue> {
        values.iter().map(|v| MetricValue::Scalar(*v)).collect()
    }

    #[tokio::test]
    async fn bootstrap_scales_to_min() {
        let (mut controller, orchestrator) =
            controller_with(test_params("web"), scalars(&[30.0]), plain_nodes(3));

        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::ScaleUp);
        assert_eq!(decision.target_replicas, 2);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);

        let stored = controller.store.get_target("web").unwrap().unwrap();
        assert_eq!(stored.current_replicas, 2);
        assert_eq!(controller.phase(), ControllerPhase::Idle);
    }

    #[tokio::test]
    async fn scales_up_proportionally_across_cycles() {
        let (mut controller, orchestrator) =
            controller_with(test_params("web"), scalars(&[60.0, 60.0]), plain_nodes(4));

        controller.reconcile().await.unwrap();
        let decision = controller.reconcile().await.unwrap();

        // ceil(2 * 60/50) = 3.
        assert_eq!(decision.reason, DecisionReason::ScaleUp);
        assert_eq!(decision.target_replicas, 3);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unavailable_metric_holds_replica_count() {
        let values = vec![MetricValue::Scalar(30.0), MetricValue::Unavailable];
        let (mut controller, orchestrator) =
            controller_with(test_params("web"), values, plain_nodes(3));

        controller.reconcile().await.unwrap();
        let decision = controller.reconcile().await.unwrap();

        assert_eq!(decision.reason, DecisionReason::Suppressed);
        assert_eq!(decision.target_replicas, 2);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);

        // The hold is on the audit trail with the unavailable sample.
        let records = controller.store.list_decisions_for_target("web", 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].observed, MetricValue::Unavailable);
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_change() {
        let mut params = test_params("web");
        params.cooldown_secs = 1000;
        let (mut controller, orchestrator) =
            controller_with(params, scalars(&[60.0, 90.0]), plain_nodes(4));

        let first = controller.reconcile().await.unwrap();
        assert_eq!(first.reason, DecisionReason::ScaleUp);

        let second = controller.reconcile().await.unwrap();
        assert_eq!(second.reason, DecisionReason::Suppressed);
        assert_eq!(second.target_replicas, 2);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);

        // Suppression is auditable, with the sample that was rejected.
        let records = controller.store.list_decisions_for_target("web", 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].decision.reason, DecisionReason::Suppressed);
        assert_eq!(records[1].observed, MetricValue::Scalar(90.0));
    }

    #[tokio::test]
    async fn scale_down_defers_past_budget() {
        let values = scalars(&[100.0, 100.0, 15.0, 15.0, 15.0]);
        let (mut controller, orchestrator) =
            controller_with(test_params("web"), values, plain_nodes(3));

        controller.reconcile().await.unwrap(); // 0 -> 2
        controller.reconcile().await.unwrap(); // 2 -> 4

        // Wants 2, but max_unavailable=1 allows one removal per cycle.
        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::ScaleDown);
        assert_eq!(decision.target_replicas, 2);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 3);

        // The deferred removal completes once the budget frees up.
        controller.reconcile().await.unwrap();
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);

        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::NoChange);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn infeasible_placement_queues_and_resolves() {
        let mut params = test_params("web");
        params.constraints = ConstraintSet::new(vec![
            Constraint::TopologySpread {
                key: "zone".to_string(),
                max_skew: 1,
            },
            Constraint::AntiAffinity,
        ]);
        let nodes = vec![make_node("na", &[("zone", "a")]), make_node("nb", &[("zone", "b")])];
        let (mut controller, orchestrator) =
            controller_with(params, scalars(&[60.0, 50.0, 50.0]), nodes);

        // Pre-existing imbalance: three replicas already sit in zone a.
        for _ in 0..3 {
            orchestrator.create_replica("web", "na").await.unwrap();
        }

        // Wants 4; neither zone can take one without skew > 1.
        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::ScaleUp);
        assert_eq!(decision.target_replicas, 4);
        assert_eq!(controller.pending(), 1);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 3);

        // Nothing changed; the queued replica stays queued, no re-decision.
        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::NoChange);
        assert_eq!(controller.pending(), 1);

        // Zone b fills up out of band; the retry now has a feasible node.
        for _ in 0..3 {
            orchestrator.create_replica("web", "nb").await.unwrap();
        }
        controller.reconcile().await.unwrap();
        assert_eq!(controller.pending(), 0);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn scale_down_cancels_pending_before_removing() {
        let mut params = test_params("web");
        params.constraints = ConstraintSet::new(vec![
            Constraint::TopologySpread {
                key: "zone".to_string(),
                max_skew: 1,
            },
            Constraint::AntiAffinity,
        ]);
        let nodes = vec![make_node("na", &[("zone", "a")]), make_node("nb", &[("zone", "b")])];
        let (mut controller, orchestrator) =
            controller_with(params, scalars(&[60.0, 5.0]), nodes);

        for _ in 0..3 {
            orchestrator.create_replica("web", "na").await.unwrap();
        }

        controller.reconcile().await.unwrap();
        assert_eq!(controller.pending(), 1);

        // Down to min=2: the queued placement is cancelled for free, and
        // only one live replica needs a budget slot.
        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::ScaleDown);
        assert_eq!(decision.target_replicas, 2);
        assert_eq!(controller.pending(), 0);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn no_change_cycles_skip_the_audit_trail() {
        let (mut controller, _) =
            controller_with(test_params("web"), scalars(&[30.0, 30.0]), plain_nodes(3));

        controller.reconcile().await.unwrap(); // ScaleUp, recorded.
        controller.reconcile().await.unwrap(); // NoChange, not recorded.

        let records = controller.store.list_decisions_for_target("web", 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision.reason, DecisionReason::ScaleUp);
    }

    #[tokio::test]
    async fn spread_stays_within_skew_while_growing() {
        let mut params = test_params("web");
        params.constraints = ConstraintSet::new(vec![
            Constraint::TopologySpread {
                key: "zone".to_string(),
                max_skew: 1,
            },
            Constraint::AntiAffinity,
        ]);
        let nodes = vec![
            make_node("za", &[("zone", "a")]),
            make_node("zb", &[("zone", "b")]),
            make_node("zc", &[("zone", "c")]),
        ];
        let (mut controller, orchestrator) =
            controller_with(params, vec![MetricValue::Scalar(60.0)], nodes);

        for _ in 0..6 {
            controller.reconcile().await.unwrap();
        }

        let replicas = orchestrator.list_replicas("web").await.unwrap();
        assert_eq!(replicas.len(), 8);

        let mut per_zone: HashMap<&str, u32> = HashMap::new();
        for replica in &replicas {
            *per_zone.entry(replica.labels["zone"].as_str()).or_insert(0) += 1;
        }
        let max = per_zone.values().max().copied().unwrap_or(0);
        let min = per_zone.values().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "zone counts diverged: {per_zone:?}");
    }

    struct FailingOrchestrator;

    impl Orchestrator for FailingOrchestrator {
        fn create_replica(&self, _target: &str, _node: &str) -> BoxFuture<String> {
            Box::pin(async { Err(anyhow::anyhow!("cluster unreachable")) })
        }
        fn remove_replica(&self, _replica: &str) -> BoxFuture<()> {
            Box::pin(async { Err(anyhow::anyhow!("cluster unreachable")) })
        }
        fn list_replicas(&self, _target: &str) -> BoxFuture<Vec<ReplicaInfo>> {
            Box::pin(async { Err(anyhow::anyhow!("cluster unreachable")) })
        }
        fn list_nodes(&self) -> BoxFuture<Vec<NodeInfo>> {
            Box::pin(async { Err(anyhow::anyhow!("cluster unreachable")) })
        }
    }

    #[tokio::test]
    async fn orchestration_errors_propagate() {
        let store = StateStore::open_in_memory().unwrap();
        let source = Box::new(StaticSource::constant(30.0));
        let mut controller = Controller::new(
            test_params("web"),
            store,
            source,
            Arc::new(FailingOrchestrator),
        );

        let result = controller.reconcile().await;
        assert!(matches!(
            result,
            Err(crate::error::ControllerError::Orchestration(_))
        ));
    }

    /// Delegates to a local orchestrator, failing the n-th remove call.
    struct FailNthRemove {
        inner: Arc<LocalOrchestrator>,
        fail_on: u32,
        calls: AtomicU32,
    }

    impl FailNthRemove {
        fn new(inner: Arc<LocalOrchestrator>, fail_on: u32) -> Self {
            Self {
                inner,
                fail_on,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Orchestrator for FailNthRemove {
        fn create_replica(&self, target: &str, node: &str) -> BoxFuture<String> {
            self.inner.create_replica(target, node)
        }
        fn remove_replica(&self, replica: &str) -> BoxFuture<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                return Box::pin(async { Err(anyhow::anyhow!("remove rpc timed out")) });
            }
            self.inner.remove_replica(replica)
        }
        fn list_replicas(&self, target: &str) -> BoxFuture<Vec<ReplicaInfo>> {
            self.inner.list_replicas(target)
        }
        fn list_nodes(&self) -> BoxFuture<Vec<NodeInfo>> {
            self.inner.list_nodes()
        }
    }

    fn controller_with_flaky_removes(
        values: &[f64],
        fail_on: u32,
    ) -> (Controller, Arc<LocalOrchestrator>) {
        let local = Arc::new(LocalOrchestrator::new(plain_nodes(4)));
        let store = StateStore::open_in_memory().unwrap();
        let source = Box::new(StaticSource::new(scalars(values)));
        let orchestrator = Arc::new(FailNthRemove::new(local.clone(), fail_on));
        let controller = Controller::new(test_params("web"), store, source, orchestrator);
        (controller, local)
    }

    #[tokio::test]
    async fn failed_removal_returns_its_budget_slot() {
        let (mut controller, local) =
            controller_with_flaky_removes(&[60.0, 100.0, 15.0, 15.0, 15.0], 1);

        controller.reconcile().await.unwrap(); // 0 -> 2
        controller.reconcile().await.unwrap(); // 2 -> 4

        // The first removal dies on the wire; its slot must come back.
        let result = controller.reconcile().await;
        assert!(matches!(
            result,
            Err(crate::error::ControllerError::Orchestration(_))
        ));
        assert_eq!(local.list_replicas("web").await.unwrap().len(), 4);

        // Next cycle the budget still allows one removal per cycle.
        controller.reconcile().await.unwrap();
        assert_eq!(local.list_replicas("web").await.unwrap().len(), 3);

        controller.reconcile().await.unwrap();
        assert_eq!(local.list_replicas("web").await.unwrap().len(), 2);
        let stored = controller.store.get_target("web").unwrap().unwrap();
        assert_eq!(stored.current_replicas, 2);
    }

    #[tokio::test]
    async fn failed_deferred_retry_returns_its_budget_slot() {
        let (mut controller, local) =
            controller_with_flaky_removes(&[60.0, 100.0, 15.0, 15.0, 15.0], 2);

        controller.reconcile().await.unwrap(); // 0 -> 2
        controller.reconcile().await.unwrap(); // 2 -> 4

        // One removal lands, the second defers past the budget.
        controller.reconcile().await.unwrap();
        assert_eq!(local.list_replicas("web").await.unwrap().len(), 3);

        // The deferred retry fails; the slot comes back, the intent stays.
        let result = controller.reconcile().await;
        assert!(matches!(
            result,
            Err(crate::error::ControllerError::Orchestration(_))
        ));
        assert_eq!(local.list_replicas("web").await.unwrap().len(), 3);

        controller.reconcile().await.unwrap();
        assert_eq!(local.list_replicas("web").await.unwrap().len(), 2);
        let stored = controller.store.get_target("web").unwrap().unwrap();
        assert_eq!(stored.current_replicas, 2);
    }

    #[tokio::test]
    async fn load_reversal_reclaims_deferred_removal() {
        let values = scalars(&[60.0, 100.0, 5.0, 60.0, 48.0]);
        let (mut controller, orchestrator) =
            controller_with(test_params("web"), values, plain_nodes(4));

        controller.reconcile().await.unwrap(); // 0 -> 2
        controller.reconcile().await.unwrap(); // 2 -> 4

        // Down to min=2: one removal lands, one defers past the budget.
        controller.reconcile().await.unwrap();
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 3);

        // Load comes back before the deferred removal completes. The
        // scale-up absorbs it instead of tearing down and re-creating.
        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::ScaleUp);
        assert_eq!(decision.target_replicas, 3);
        let replicas = orchestrator.list_replicas("web").await.unwrap();
        assert_eq!(replicas.len(), 3);
        assert!(!replicas.iter().any(|r| r.id == "web-5"));

        let stored = controller.store.get_target("web").unwrap().unwrap();
        assert_eq!(stored.current_replicas, 3);

        let decision = controller.reconcile().await.unwrap();
        assert_eq!(decision.reason, DecisionReason::NoChange);
        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (mut controller, orchestrator) = controller_with(
            test_params("web"),
            vec![MetricValue::Scalar(30.0)],
            plain_nodes(3),
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            controller.run(Duration::from_millis(10), rx).await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(orchestrator.list_replicas("web").await.unwrap().len(), 2);
    }
}
