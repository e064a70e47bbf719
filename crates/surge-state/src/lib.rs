//! surge-state — embedded state store for Surge.
//!
//! Backed by [redb](https://docs.rs/redb), persists scaling targets and
//! the per-target decision audit trail, with an in-memory variant for
//! tests and standalone runs.
//!
//! # Architecture
//!
//! Domain types are JSON-encoded into redb's `&[u8]` value columns, one
//! table per record kind. Decision records use composite keys
//! (`{target}/{seq:020}`) so a prefix scan returns one target's history
//! in append order.
//!
//! `StateStore` wraps an `Arc<Database>`; clones share the database and
//! are handed to one controller task per target.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
