//! Publish/subscribe channel abstraction shared by the Control Subscriber
//! and Event Coalescer.
//!
//! A single trait backs both: control commands and cache-invalidation
//! events are both "something happened to resource X, on channel Y",
//! delivered to independent per-subscriber queues. Production code backs
//! this with the shared message bus named in the pub/sub Non-goal; tests
//! and the in-process demo paths use [`MemoryBus`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub resource_id: String,
    pub payload: String,
}

pub trait Bus: Send + Sync {
    fn publish(&self, message: Message);
    fn subscribe(&self, channel: &str) -> Box<dyn Subscription>;
}

pub trait Subscription: Send {
    fn recv_timeout(&mut self, timeout: Duration) -> Option<Message>;
}

impl Subscription for crossbeam_channel::Receiver<Message> {
    fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        (*self).recv_timeout(timeout).ok()
    }
}

#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<crossbeam_channel::Sender<Message>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, message: Message) {
        let mut subscribers = self.subscribers.lock().expect("bus subscribers poisoned");
        if let Some(senders) = subscribers.get_mut(&message.channel) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    fn subscribe(&self, channel: &str) -> Box<dyn Subscription> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().expect("bus subscribers poisoned").entry(channel.to_string()).or_default().push(tx);
        Box::new(rx)
    }
}
