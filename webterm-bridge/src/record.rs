use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;
use webterm_pty::ProcessHandle;

/// Identity of one client channel, unique for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct ErrorStats {
    count: u32,
    last_at: Option<DateTime<Utc>>,
}

/// One client channel paired with the shell serving it.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    process: Arc<ProcessHandle>,
    connected_at: DateTime<Utc>,
    errors: Mutex<ErrorStats>,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, process: Arc<ProcessHandle>) -> Self {
        Self {
            id,
            process,
            connected_at: Utc::now(),
            errors: Mutex::new(ErrorStats::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn process(&self) -> &Arc<ProcessHandle> {
        &self.process
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Count a transient transport error. Returns the new total.
    pub fn record_error(&self) -> u32 {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        errors.count = errors.count.saturating_add(1);
        errors.last_at = Some(Utc::now());
        errors.count
    }

    pub fn error_count(&self) -> u32 {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_at
    }
}
