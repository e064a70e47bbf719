//! redb table definitions for the Surge state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Decision keys follow the pattern `{target}/{seq:020}` so prefix
//! scans walk one target's history in order.

use redb::TableDefinition;

/// Scaling targets keyed by `{name}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Decision records keyed by `{target}/{seq:020}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");
