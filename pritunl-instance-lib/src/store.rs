//! Trait over the shared datastore's compare-and-set operations on a
//! server's `instances` array.
//!
//! A missed claim or a lost heartbeat are normal, expected outcomes of
//! optimistic concurrency control, not datastore errors — [`Error`] is
//! reserved for things actually wrong with the datastore (connection
//! failures, timeouts), which callers retry rather than propagate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::instance::{InstanceId, InstanceRow};
use crate::server::ServerId;

#[derive(Debug, thiserror::Error)]
#[error("datastore error: {0}")]
pub struct Error(pub String);

#[derive(Debug, Eq, PartialEq)]
pub enum ClaimOutcome {
    /// Our row was admitted; `stale_evicted` lists instance ids whose rows
    /// were past `ping_timeout` and were swept out to make room.
    Claimed { stale_evicted: Vec<InstanceId> },
    /// Another instance already holds an unexpired slot for this server.
    Missed,
}

#[derive(Debug, Eq, PartialEq)]
pub enum HeartbeatOutcome {
    Updated,
    /// Our row is gone: another process's claim swept us out as stale, or an
    /// operator removed it directly.
    Evicted,
}

#[derive(Debug, Eq, PartialEq)]
pub struct ReleaseOutcome {
    /// `false` when the row was already gone (e.g. evicted concurrently);
    /// `instances_count` must not be decremented twice for one claim.
    pub row_removed: bool,
}

pub trait InstanceStore: Send + Sync {
    /// Admits `row` if fewer than `replica_count` unexpired instances are
    /// currently claimed for `server_id`, first sweeping out any row past
    /// `ping_timeout`. The admission bound, not just "is the slot empty".
    fn claim(&self, server_id: ServerId, row: &InstanceRow, replica_count: u32, ping_timeout: Duration, now: SystemTime) -> Result<ClaimOutcome, Error>;
    fn heartbeat(&self, server_id: ServerId, instance_id: InstanceId, now: SystemTime) -> Result<HeartbeatOutcome, Error>;
    fn release(&self, server_id: ServerId, instance_id: InstanceId) -> Result<ReleaseOutcome, Error>;
}

/// In-memory stand-in used by tests and by the Non-goal-scoped CLI demo
/// paths; a real deployment backs [`InstanceStore`] with the shared
/// document store named in the datastore Non-goal.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<ServerId, Vec<InstanceRow>>>,
    instances_count: Mutex<HashMap<ServerId, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instances_count(&self, server_id: ServerId) -> u32 {
        *self.instances_count.lock().expect("instances_count poisoned").get(&server_id).unwrap_or(&0)
    }
}

impl InstanceStore for MemoryStore {
    fn claim(&self, server_id: ServerId, row: &InstanceRow, replica_count: u32, ping_timeout: Duration, now: SystemTime) -> Result<ClaimOutcome, Error> {
        let mut rows = self.rows.lock().expect("instance rows poisoned");
        let entry = rows.entry(server_id).or_default();

        let mut stale_evicted = Vec::new();
        entry.retain(|existing| {
            let expired = now.duration_since(existing.ping_timestamp).unwrap_or(Duration::ZERO) > ping_timeout;
            if expired {
                stale_evicted.push(existing.instance_id);
            }
            !expired
        });

        if entry.len() as u32 >= replica_count {
            return Ok(ClaimOutcome::Missed);
        }

        entry.push(row.clone());
        *self.instances_count.lock().expect("instances_count poisoned").entry(server_id).or_insert(0) += 1;
        Ok(ClaimOutcome::Claimed { stale_evicted })
    }

    fn heartbeat(&self, server_id: ServerId, instance_id: InstanceId, now: SystemTime) -> Result<HeartbeatOutcome, Error> {
        let mut rows = self.rows.lock().expect("instance rows poisoned");
        let Some(entry) = rows.get_mut(&server_id) else {
            return Ok(HeartbeatOutcome::Evicted);
        };
        match entry.iter_mut().find(|r| r.instance_id == instance_id) {
            Some(row) => {
                row.ping_timestamp = now;
                Ok(HeartbeatOutcome::Updated)
            }
            None => Ok(HeartbeatOutcome::Evicted),
        }
    }

    fn release(&self, server_id: ServerId, instance_id: InstanceId) -> Result<ReleaseOutcome, Error> {
        let mut rows = self.rows.lock().expect("instance rows poisoned");
        let Some(entry) = rows.get_mut(&server_id) else {
            return Ok(ReleaseOutcome { row_removed: false });
        };
        let before = entry.len();
        entry.retain(|r| r.instance_id != instance_id);
        let removed = entry.len() != before;
        if removed {
            let mut counts = self.instances_count.lock().expect("instances_count poisoned");
            if let Some(count) = counts.get_mut(&server_id) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(ReleaseOutcome { row_removed: removed })
    }
}
