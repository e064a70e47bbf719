//! surge-core — configuration parsing and startup validation.
//!
//! Parses `surge.toml` into typed config structs and enforces the
//! parameter invariants the control loop depends on. Validation failures
//! are fatal at startup; the daemon refuses to run an invalid target.

pub mod config;
pub mod error;

pub use config::{MetricsConfig, NodeConfig, SpreadConfig, SurgeConfig, TargetConfig, parse_duration};
pub use error::{ConfigError, ConfigResult};
