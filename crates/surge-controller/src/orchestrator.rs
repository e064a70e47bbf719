//! The orchestration boundary.
//!
//! The controller drives a narrow, idempotent cluster surface: create
//! and remove replicas, list replicas and nodes. The listings are the
//! source of truth each cycle; duplicate create/remove requests must be
//! tolerated by implementations.
//!
//! `LocalOrchestrator` implements the boundary in memory so standalone
//! mode and integration tests run the full loop with no external
//! cluster.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use surge_state::{NodeInfo, ReplicaId, ReplicaInfo};

/// Boxed future for object-safe async trait methods.
pub type BoxFuture<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<T>> + Send>>;

/// The cluster surface the controller drives.
pub trait Orchestrator: Send + Sync {
    /// Start a replica of `target` on `node`, returning its id.
    fn create_replica(&self, target: &str, node: &str) -> BoxFuture<ReplicaId>;

    /// Stop a replica. Removing an unknown id is a no-op.
    fn remove_replica(&self, replica: &str) -> BoxFuture<()>;

    /// All replicas of one target currently running.
    fn list_replicas(&self, target: &str) -> BoxFuture<Vec<ReplicaInfo>>;

    /// Current node inventory with topology labels.
    fn list_nodes(&self) -> BoxFuture<Vec<NodeInfo>>;
}

/// In-memory orchestrator for standalone mode and tests.
///
/// Replica ids are `{target}-{n}` with a per-target counter that never
/// resets, so ids stay unique across churn.
#[derive(Clone)]
pub struct LocalOrchestrator {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    nodes: Vec<NodeInfo>,
    replicas: HashMap<ReplicaId, ReplicaInfo>,
    counters: HashMap<String, u64>,
}

impl LocalOrchestrator {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                replicas: HashMap::new(),
                counters: HashMap::new(),
            })),
        }
    }

    /// Replace the node inventory, e.g. when a node joins mid-run.
    pub async fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.inner.lock().await.nodes = nodes;
    }
}

impl Orchestrator for LocalOrchestrator {
    fn create_replica(&self, target: &str, node: &str) -> BoxFuture<ReplicaId> {
        let inner = self.inner.clone();
        let target = target.to_string();
        let node = node.to_string();
        Box::pin(async move {
            let mut inner = inner.lock().await;
            let seq = {
                let counter = inner.counters.entry(target.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let id = format!("{target}-{seq}");
            let labels = inner
                .nodes
                .iter()
                .find(|n| n.id == node)
                .map(|n| n.labels.clone())
                .unwrap_or_default();
            inner.replicas.insert(
                id.clone(),
                ReplicaInfo {
                    id: id.clone(),
                    target,
                    node,
                    labels,
                },
            );
            Ok(id)
        })
    }

    fn remove_replica(&self, replica: &str) -> BoxFuture<()> {
        let inner = self.inner.clone();
        let replica = replica.to_string();
        Box::pin(async move {
            inner.lock().await.replicas.remove(&replica);
            Ok(())
        })
    }

    fn list_replicas(&self, target: &str) -> BoxFuture<Vec<ReplicaInfo>> {
        let inner = self.inner.clone();
        let target = target.to_string();
        Box::pin(async move {
            let inner = inner.lock().await;
            let mut replicas: Vec<ReplicaInfo> = inner
                .replicas
                .values()
                .filter(|r| r.target == target)
                .cloned()
                .collect();
            replicas.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(replicas)
        })
    }

    fn list_nodes(&self) -> BoxFuture<Vec<NodeInfo>> {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.lock().await.nodes.clone()) })
    }
}
