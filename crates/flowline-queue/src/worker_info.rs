use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registration and liveness record for a worker process, stored as the
/// JSON value behind `worker:<id>` in Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub address: String,
    pub served_types: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(id: Uuid, address: impl Into<String>, served_types: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            address: address.into(),
            served_types,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// A worker's lease is considered expired once its last heartbeat is
    /// older than the 2-minute deadline, independent of the Redis key TTL
    /// (which is the coarser 5-minute registration TTL).
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat) > chrono::Duration::seconds(120)
    }
}
