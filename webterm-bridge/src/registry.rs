//! Process-wide bookkeeping of live connections.

use crate::record::{ConnectionId, ConnectionRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_shutdown::{ShutdownTimeout, with_grace};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}

/// Mapping from connection id to its record.
///
/// Every mutation takes the one registry lock; no operation holds it across an
/// await or while killing a process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionRecord>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: Arc<ConnectionRecord>) -> Result<(), RegistryError> {
        let id = record.id();
        let mut sessions = self.sessions();
        if sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        sessions.insert(id, record);
        debug!(conn_id = %id, active = sessions.len(), "Session registered");
        Ok(())
    }

    /// Remove a record. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let mut sessions = self.sessions();
        let removed = sessions.remove(id);
        if removed.is_some() {
            debug!(conn_id = %id, active = sessions.len(), "Session removed");
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.sessions().get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sessions().keys().copied().collect()
    }

    /// Visit every record. The callback runs on a snapshot, outside the lock.
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionRecord)) {
        let snapshot: Vec<_> = self.sessions().values().cloned().collect();
        for record in &snapshot {
            f(record);
        }
    }

    /// Empty the registry and kill every shell it held.
    ///
    /// The registry is cleared immediately. Kills run concurrently on the
    /// blocking pool; if they have not all finished within `grace` this returns
    /// [`ShutdownTimeout`] and leaves the stragglers to finish in the
    /// background.
    pub async fn shutdown(&self, grace: Duration) -> Result<usize, ShutdownTimeout> {
        let drained: Vec<_> = self.sessions().drain().map(|(_, record)| record).collect();
        let count = drained.len();
        if count == 0 {
            return Ok(0);
        }

        info!(sessions = count, "Killing all shell sessions");
        let kills = drained.into_iter().map(|record| {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = record.process().kill() {
                    warn!(conn_id = %record.id(), error = %e, "Failed to kill shell during shutdown");
                }
            })
        });

        with_grace(grace, futures::future::join_all(kills))
            .await
            .inspect_err(|e| warn!(error = %e, "Shell cleanup timed out"))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use webterm_pty::{ProcessEvents, ProcessHandle, SpawnConfig};

    fn sleeping_record() -> (Arc<ConnectionRecord>, ProcessEvents) {
        let (handle, events) =
            ProcessHandle::spawn(&SpawnConfig::new("sleep").arg("60")).expect("spawn sleep");
        let record = Arc::new(ConnectionRecord::new(ConnectionId::new(), Arc::new(handle)));
        (record, events)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        let (record, _events) = sleeping_record();
        let id = record.id();

        registry.insert(Arc::clone(&record)).expect("insert");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
        assert_eq!(registry.ids(), vec![id]);

        let removed = registry.remove(&id).expect("removed");
        assert_eq!(removed.id(), id);
        assert!(registry.is_empty());

        // Idempotent
        assert!(registry.remove(&id).is_none());
        record.process().kill().expect("kill");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_insert_rejected() {
        let registry = SessionRegistry::new();
        let (record, _events) = sleeping_record();

        registry.insert(Arc::clone(&record)).expect("first insert");
        let err = registry.insert(Arc::clone(&record)).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(id) if id == record.id()));
        assert_eq!(registry.len(), 1);
        record.process().kill().expect("kill");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_for_each_visits_every_record() {
        let registry = SessionRegistry::new();
        let records: Vec<_> = (0..3).map(|_| sleeping_record()).collect();
        for (record, _) in &records {
            registry.insert(Arc::clone(record)).expect("insert");
        }

        let mut seen = Vec::new();
        registry.for_each(|record| seen.push(record.id()));
        seen.sort();
        let mut expected: Vec<_> = records.iter().map(|(r, _)| r.id()).collect();
        expected.sort();
        assert_eq!(seen, expected);

        registry.shutdown(Duration::from_secs(5)).await.expect("shutdown");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_kills_and_clears() {
        let registry = SessionRegistry::new();
        let records: Vec<_> = (0..3).map(|_| sleeping_record()).collect();
        for (record, _) in &records {
            registry.insert(Arc::clone(record)).expect("insert");
        }

        let killed = registry.shutdown(Duration::from_secs(5)).await.expect("in time");
        assert_eq!(killed, 3);
        assert!(registry.is_empty());

        for (record, events) in records {
            assert!(!record.process().is_alive());
            let exit = tokio::time::timeout(Duration::from_secs(5), events.exit).await;
            assert!(exit.is_ok(), "shell {} still running", record.id());
        }
    }

    #[tokio::test]
    async fn test_shutdown_of_empty_registry() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.shutdown(Duration::from_millis(10)).await, Ok(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_error_counter() {
        let (record, _events) = sleeping_record();
        assert_eq!(record.error_count(), 0);
        assert!(record.last_error_at().is_none());

        assert_eq!(record.record_error(), 1);
        assert_eq!(record.record_error(), 2);
        assert_eq!(record.error_count(), 2);
        assert!(record.last_error_at().is_some());
        assert!(record.last_error_at() >= Some(record.connected_at()));
        record.process().kill().expect("kill");
    }
}
