//! Periodic liveness ping against the claimed instance row.
//!
//! Runs on its own thread, ticking on `ping_interval`, and reports either a
//! successful update or an eviction back to the orchestrator over a
//! channel — grounded in `instance.py`'s `_keep_alive_thread`, which polls
//! in a loop rather than awaiting a single future for the run's whole
//! lifetime.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crate::instance::InstanceId;
use crate::server::ServerId;
use crate::store::{HeartbeatOutcome, InstanceStore};

#[derive(Debug)]
pub enum Event {
    Evicted,
}

const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct HeartbeatWriter {
    cancel: crossbeam_channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HeartbeatWriter {
    /// Spawns the writer thread. `events` is the orchestrator's shared
    /// inbox; an eviction is sent at most once, after which the thread exits.
    pub fn spawn(
        store: Arc<dyn InstanceStore>,
        server_id: ServerId,
        instance_id: InstanceId,
        ping_interval: Duration,
        events: crossbeam_channel::Sender<Event>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        let ticker = crossbeam_channel::tick(ping_interval);

        let handle = thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(cancel_rx) -> _ => return,
                recv(ticker) -> _ => {
                    match send_with_retry(&*store, server_id, instance_id, &cancel_rx) {
                        Outcome::Updated => {}
                        Outcome::Evicted => {
                            let _ = events.send(Event::Evicted);
                            return;
                        }
                        Outcome::Cancelled => return,
                    }
                }
            }
        });

        HeartbeatWriter { cancel: cancel_tx, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        let _ = self.cancel.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Outcome {
    Updated,
    Evicted,
    Cancelled,
}

/// Retries transient datastore errors every second until they clear,
/// cancellation is requested, or the update lands.
fn send_with_retry(store: &dyn InstanceStore, server_id: ServerId, instance_id: InstanceId, cancel: &crossbeam_channel::Receiver<()>) -> Outcome {
    loop {
        match store.heartbeat(server_id, instance_id, SystemTime::now()) {
            Ok(HeartbeatOutcome::Updated) => return Outcome::Updated,
            Ok(HeartbeatOutcome::Evicted) => return Outcome::Evicted,
            Err(err) => {
                tracing::error!(server_id = %server_id, error = %err, "heartbeat update failed, retrying");
                if cancel.recv_timeout(TRANSIENT_RETRY_DELAY).is_ok() {
                    return Outcome::Cancelled;
                }
            }
        }
    }
}
