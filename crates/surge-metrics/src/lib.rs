//! surge-metrics — the metric source boundary.
//!
//! A `MetricSource` turns an opaque query expression into one scalar
//! observation. Sources never error and never block past their timeout:
//! every failure mode (backend down, timeout, malformed body, stale or
//! non-finite data) collapses into an `Unavailable` sample, which the
//! controller treats as "hold current state".
//!
//! Two backends ship here: `PromSource` speaks the Prometheus instant
//! query API over HTTP, `StaticSource` replays a fixed sequence for
//! standalone runs and tests.

pub mod prom;
pub mod source;

pub use prom::PromSource;
pub use source::{BoxFuture, MetricSource, StaticSource};
