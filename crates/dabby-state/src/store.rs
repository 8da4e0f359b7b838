//! StateStore — redb-backed persistence for jobs and instance health.
//!
//! Provides typed CRUD over job records and instance health records. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCE_HEALTH).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job record.
    pub fn put_job(&self, job: &JobRecord) -> StateResult<()> {
        let key = job.table_key();
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = job.id, status = ?job.status, "job stored");
        Ok(())
    }

    /// Get a job by id.
    pub fn get_job(&self, id: JobId) -> StateResult<Option<JobRecord>> {
        let key = job_table_key(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: JobRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List all jobs in ascending id order.
    pub fn list_jobs(&self) -> StateResult<Vec<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: JobRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }

    /// List Pending jobs due at or before `now`, in ascending id order.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> StateResult<Vec<JobRecord>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending && j.next_run_at <= now)
            .collect())
    }

    /// Delete a job by id. Returns true if it existed.
    pub fn delete_job(&self, id: JobId) -> StateResult<bool> {
        let key = job_table_key(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = id, existed, "job deleted");
        Ok(existed)
    }

    /// Return any job left `Running` by a previous process to `Pending`.
    ///
    /// Delivery is at-least-once: a job that was in flight when the process
    /// died is re-dispatched on the next tick after recovery. Returns the
    /// number of jobs recovered.
    pub fn recover_running_jobs(&self, now: DateTime<Utc>) -> StateResult<u32> {
        let mut recovered = 0;
        for mut job in self.list_jobs()? {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.next_run_at = now;
                job.updated_at = now.timestamp() as u64;
                self.put_job(&job)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Highest job id present, for seeding the id counter after recovery.
    pub fn max_job_id(&self) -> StateResult<Option<JobId>> {
        Ok(self.list_jobs()?.last().map(|j| j.id))
    }

    // ── Instance health ────────────────────────────────────────────

    /// Insert or update an instance health record.
    pub fn put_instance_health(&self, record: &InstanceHealthRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCE_HEALTH).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the health record for an instance.
    pub fn get_instance_health(&self, id: &str) -> StateResult<Option<InstanceHealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCE_HEALTH).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceHealthRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all instance health records.
    pub fn list_instance_health(&self) -> StateResult<Vec<InstanceHealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCE_HEALTH).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceHealthRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an instance health record. Returns true if it existed.
    pub fn delete_instance_health(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCE_HEALTH).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_job(id: JobId, status: JobStatus, due: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id,
            kind: JobKind::Immediate,
            payload: serde_json::json!({"task": "consultation"}),
            status,
            attempts: 0,
            max_attempts: 3,
            next_run_at: due,
            last_error: None,
            cancel_requested: false,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn job_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job(1, JobStatus::Pending, at(1000));

        store.put_job(&job).unwrap();
        let retrieved = store.get_job(1).unwrap();
        assert_eq!(retrieved, Some(job));
    }

    #[test]
    fn job_list_ascending_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        // Insert out of order; zero-padded keys restore id order.
        for id in [12u64, 3, 100, 7] {
            store.put_job(&test_job(id, JobStatus::Pending, at(1000))).unwrap();
        }

        let ids: Vec<JobId> = store.list_jobs().unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![3, 7, 12, 100]);
    }

    #[test]
    fn due_jobs_filters_by_status_and_time() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&test_job(1, JobStatus::Pending, at(1000))).unwrap();
        store.put_job(&test_job(2, JobStatus::Pending, at(5000))).unwrap();
        store.put_job(&test_job(3, JobStatus::Running, at(1000))).unwrap();
        store.put_job(&test_job(4, JobStatus::Succeeded, at(1000))).unwrap();

        let due = store.due_jobs(at(2000)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, 1);
    }

    #[test]
    fn job_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&test_job(1, JobStatus::Pending, at(1000))).unwrap();

        assert!(store.delete_job(1).unwrap());
        assert!(!store.delete_job(1).unwrap());
        assert!(store.get_job(1).unwrap().is_none());
    }

    #[test]
    fn recover_running_jobs_returns_them_to_pending() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&test_job(1, JobStatus::Running, at(1000))).unwrap();
        store.put_job(&test_job(2, JobStatus::Pending, at(9000))).unwrap();
        store.put_job(&test_job(3, JobStatus::Succeeded, at(1000))).unwrap();

        let recovered = store.recover_running_jobs(at(2000)).unwrap();
        assert_eq!(recovered, 1);

        let job = store.get_job(1).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_run_at, at(2000));
        // Untouched records keep their state.
        assert_eq!(store.get_job(2).unwrap().unwrap().next_run_at, at(9000));
        assert_eq!(store.get_job(3).unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn max_job_id_tracks_highest() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.max_job_id().unwrap(), None);

        store.put_job(&test_job(5, JobStatus::Pending, at(1000))).unwrap();
        store.put_job(&test_job(42, JobStatus::Pending, at(1000))).unwrap();
        assert_eq!(store.max_job_id().unwrap(), Some(42));
    }

    #[test]
    fn instance_health_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let record = InstanceHealthRecord {
            id: "consultant-0".to_string(),
            health: HealthState::Suspect,
            consecutive_failures: 4,
            last_response_time_ms: Some(120.5),
            reopen_count: 2,
            updated_at: 1000,
        };

        store.put_instance_health(&record).unwrap();
        assert_eq!(store.get_instance_health("consultant-0").unwrap(), Some(record));
        assert_eq!(store.list_instance_health().unwrap().len(), 1);
        assert!(store.delete_instance_health("consultant-0").unwrap());
        assert!(store.get_instance_health("consultant-0").unwrap().is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_job(&test_job(7, JobStatus::Pending, at(1000))).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let job = store.get_job(7).unwrap();
        assert!(job.is_some());
        assert_eq!(job.unwrap().id, 7);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_jobs().unwrap().is_empty());
        assert!(store.due_jobs(at(1000)).unwrap().is_empty());
        assert!(store.list_instance_health().unwrap().is_empty());
        assert!(!store.delete_job(1).unwrap());
        assert!(!store.delete_instance_health("nope").unwrap());
        assert_eq!(store.recover_running_jobs(at(1000)).unwrap(), 0);
    }
}
