//! JobStore — redb-backed job persistence.
//!
//! Jobs are stored by id in a single table. Values go through
//! [`codec`](crate::codec) so a record that fails to decode surfaces as
//! [`StateError::Deserialize`] instead of being skipped. The store supports
//! both on-disk and in-memory backends.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::codec::{decode_job, encode_job};
use crate::error::{StateError, StateResult};
use crate::tables::JOBS;
use crate::types::{Job, JobId};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe job store backed by redb.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    /// Open (or create) a persistent job store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "job store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory job store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory job store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace a job.
    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        let value = encode_job(job)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(job.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode_job(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: JobId) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        Ok(table.get(id).map_err(map_err!(Read))?.is_some())
    }

    /// All jobs in id order.
    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.scan(|_| true)
    }

    /// Jobs matching a predicate, in id order.
    pub fn scan(&self, mut keep: impl FnMut(&Job) -> bool) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job = decode_job(value.value())?;
            if keep(&job) {
                results.push(job);
            }
        }
        Ok(results)
    }

    /// Delete a job by id. Returns true if it existed.
    pub fn delete_job(&self, id: JobId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = id, existed, "job deleted");
        Ok(existed)
    }

    /// Delete several jobs in one transaction. Returns the number removed.
    pub fn delete_jobs(&self, ids: &[JobId]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            for id in ids {
                if table.remove(*id).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    /// Highest job id currently stored, or 0 for an empty store.
    pub fn max_job_id(&self) -> StateResult<JobId> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let last = table.last().map_err(map_err!(Read))?;
        Ok(last.map(|(key, _)| key.value()).unwrap_or(0))
    }
}
