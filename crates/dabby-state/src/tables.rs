//! redb table definitions for the dabby state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Job keys are zero-padded so lexicographic order equals id order.

use redb::TableDefinition;

/// Job records keyed by zero-padded job id (`{id:020}`).
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Instance health records keyed by `{instance_id}`.
pub const INSTANCE_HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("instance_health");
