//! redb table definitions for the job store.

use redb::TableDefinition;

/// Jobs keyed by their numeric id, values are codec-encoded `Job` records.
pub const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");
