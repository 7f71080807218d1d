//! Process-wide allocator for TUN/TAP interface names and per-server
//! serialization locks.
//!
//! The lock map is keyed by server id, created lazily and never emptied —
//! bounded by the count of distinct servers a process ever touches, mirroring
//! `instance.py`'s `_resource_locks = collections.defaultdict(threading.Lock)`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::server::{AdapterType, ServerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no free interface name for adapter type {0:?}")]
    Exhausted(AdapterType),
}

const MAX_INTERFACES_PER_ADAPTER: u32 = 4096;

/// A held-or-free binary lock that can be owned (not borrowed) by the holder,
/// so a run's resources can be released from a `Drop` impl without tying the
/// struct to the registry's lifetime.
#[derive(Clone)]
pub struct ServerLock {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl ServerLock {
    fn new() -> Self {
        ServerLock {
            state: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Blocks until the lock is free, then holds it.
    pub fn lock(&self) -> ServerLockGuard {
        let (mutex, condvar) = &*self.state;
        let mut held = mutex.lock().expect("server lock poisoned");
        while *held {
            held = condvar.wait(held).expect("server lock poisoned");
        }
        *held = true;
        ServerLockGuard { state: self.state.clone() }
    }
}

pub struct ServerLockGuard {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Drop for ServerLockGuard {
    fn drop(&mut self) {
        let (mutex, condvar) = &*self.state;
        let mut held = mutex.lock().expect("server lock poisoned");
        *held = false;
        condvar.notify_one();
    }
}

struct Inner {
    locks: HashMap<ServerId, ServerLock>,
    allocated: HashMap<AdapterType, Vec<bool>>,
}

/// Process-wide, thread-safe registry. Cheap to clone (shares state via `Arc`).
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        ResourceRegistry {
            inner: Arc::new(Mutex::new(Inner {
                locks: HashMap::new(),
                allocated: HashMap::new(),
            })),
        }
    }

    /// Returns the per-server serialization lock, creating it on first access.
    /// The caller is expected to hold the returned lock across resource
    /// acquisition and release (blocking acquire).
    pub fn server_lock(&self, server_id: ServerId) -> ServerLock {
        let mut inner = self.inner.lock().expect("resource registry poisoned");
        inner.locks.entry(server_id).or_insert_with(ServerLock::new).clone()
    }

    /// Acquires the lowest-numbered free interface name for the adapter
    /// family. Mutually exclusive across all callers in the process.
    pub fn acquire_interface(&self, adapter_type: AdapterType) -> Result<String, Error> {
        let mut inner = self.inner.lock().expect("resource registry poisoned");
        let slots = inner
            .allocated
            .entry(adapter_type)
            .or_insert_with(|| vec![false; MAX_INTERFACES_PER_ADAPTER as usize]);

        let index = slots
            .iter()
            .position(|taken| !taken)
            .ok_or(Error::Exhausted(adapter_type))?;
        slots[index] = true;

        let prefix = match adapter_type {
            AdapterType::Tun => "tun",
            AdapterType::Tap => "tap",
        };
        Ok(format!("{prefix}{index}"))
    }

    /// Releases a previously acquired interface name. A name must be released
    /// exactly once; releasing an unallocated or already-released name is a
    /// no-op (defends against a double-release in a teardown retry path, it
    /// does not mask it — the slot was already free).
    pub fn release_interface(&self, adapter_type: AdapterType, name: &str) {
        let mut inner = self.inner.lock().expect("resource registry poisoned");
        let Some(slots) = inner.allocated.get_mut(&adapter_type) else {
            return;
        };
        let prefix = match adapter_type {
            AdapterType::Tun => "tun",
            AdapterType::Tap => "tap",
        };
        if let Some(index_str) = name.strip_prefix(prefix)
            && let Ok(index) = index_str.parse::<usize>()
            && index < slots.len()
        {
            slots[index] = false;
        }
    }
}

/// Convenience wrapper mirroring the original's `resources_acquire` /
/// `resources_release` pairing: holds the server lock guard alongside the
/// acquired interface name so the orchestrator can release both, in reverse
/// order, from a single owned handle.
pub struct AcquiredResources {
    registry: ResourceRegistry,
    _lock_guard: ServerLockGuard,
    pub interface: String,
}

impl ResourceRegistry {
    pub fn acquire_resources(
        &self,
        adapter_type: AdapterType,
        lock: &ServerLock,
    ) -> Result<AcquiredResources, Error> {
        let guard = lock.lock();
        let interface = self.acquire_interface(adapter_type)?;
        Ok(AcquiredResources {
            registry: self.clone(),
            _lock_guard: guard,
            interface,
        })
    }
}

impl Drop for AcquiredResources {
    fn drop(&mut self) {
        self.registry.release_interface(adapter_from_name(&self.interface), &self.interface);
    }
}

fn adapter_from_name(name: &str) -> AdapterType {
    if name.starts_with("tap") {
        AdapterType::Tap
    } else {
        AdapterType::Tun
    }
}
