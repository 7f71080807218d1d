//! Listens for operator-issued `stop`/`force_stop` commands targeted at
//! this run.
//!
//! Subscribes to the bus *before* the orchestrator finishes bringing the
//! instance up, so a command published in the narrow window between claim
//! and subscribe is still queued on our receiver rather than lost —
//! grounded in `instance.py`'s `_sub_thread`, which the original starts
//! ahead of publishing `started`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::bus::Bus;
use crate::instance::InstanceId;

pub const CONTROL_CHANNEL: &str = "instance_control";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControlCommand {
    Stop,
    ForceStop,
}

pub struct ControlSubscriber {
    cancel: crossbeam_channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

impl ControlSubscriber {
    /// Subscribes to [`CONTROL_CHANNEL`] and begins forwarding matching
    /// commands to `commands`. Returns once the subscription is live, so
    /// the caller can rely on no command published after this call
    /// returning being missed.
    pub fn spawn(bus: Arc<dyn Bus>, instance_id: InstanceId, commands: crossbeam_channel::Sender<ControlCommand>) -> Self {
        let mut subscription = bus.subscribe(CONTROL_CHANNEL);
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        let target = instance_id.to_string();

        let handle = thread::spawn(move || loop {
            if cancel_rx.try_recv().is_ok() {
                return;
            }
            let Some(message) = subscription.recv_timeout(POLL_TIMEOUT) else {
                continue;
            };
            if message.resource_id != target {
                continue;
            }
            let command = match message.payload.as_str() {
                "stop" => ControlCommand::Stop,
                "force_stop" => ControlCommand::ForceStop,
                other => {
                    tracing::warn!(command = other, "unrecognized control command, ignoring");
                    continue;
                }
            };
            if commands.send(command).is_err() {
                return;
            }
        });

        ControlSubscriber { cancel: cancel_tx, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        let _ = self.cancel.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, Message};

    #[test]
    fn forwards_stop_command_addressed_to_this_instance() {
        let bus = Arc::new(MemoryBus::new());
        let instance_id = InstanceId::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let subscriber = ControlSubscriber::spawn(bus.clone(), instance_id, tx);

        bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id.to_string(), payload: "stop".to_string() });

        let command = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(command, ControlCommand::Stop);
        subscriber.stop();
    }

    #[test]
    fn ignores_commands_addressed_to_other_instances() {
        let bus = Arc::new(MemoryBus::new());
        let instance_id = InstanceId::new();
        let other = InstanceId::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let subscriber = ControlSubscriber::spawn(bus.clone(), instance_id, tx);

        bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: other.to_string(), payload: "stop".to_string() });

        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        subscriber.stop();
    }
}
