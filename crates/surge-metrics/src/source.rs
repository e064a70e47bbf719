//! The `MetricSource` trait and the static replay source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use surge_state::{MetricSample, MetricValue};

pub type BoxFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = MetricSample> + Send>,
>;

/// A scalar time-series backend.
///
/// `query` resolves to exactly one sample; implementations bound their
/// own wait internally so the caller's control loop can never stall on
/// a slow backend.
pub trait MetricSource: Send + Sync {
    fn query(&self, expression: &str) -> BoxFuture;
}

/// Replays a fixed sequence of values, then holds the last one.
///
/// Backs standalone mode and tests; an empty sequence is permanently
/// unavailable.
pub struct StaticSource {
    values: Vec<MetricValue>,
    cursor: AtomicUsize,
}

impl StaticSource {
    pub fn new(values: Vec<MetricValue>) -> Self {
        Self {
            values,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A source that always reports the same scalar.
    pub fn constant(value: f64) -> Self {
        Self::new(vec![MetricValue::Scalar(value)])
    }
}

impl MetricSource for StaticSource {
    fn query(&self, expression: &str) -> BoxFuture {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        let value = self
            .values
            .get(idx)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(MetricValue::Unavailable);
        let sample = MetricSample {
            value,
            observed_at: epoch_secs(),
            query: expression.to_string(),
        };
        Box::pin(async move { sample })
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
