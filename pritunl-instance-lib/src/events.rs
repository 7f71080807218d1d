//! Publishes lifecycle events immediately or after a delay, and offers a
//! coalescing read helper for consumers that only care about the latest
//! state of each resource.
//!
//! Grounded in `event.py`: a delay queue of `(fire_at, event_type,
//! resource_id)` tuples feeding the same publish path as immediate events,
//! and a reader that folds a short burst of cursor reads down to one entry
//! per `(event_type, resource_id)` pair, keeping the most recent.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::{Bus, Message, Subscription};

const COALESCE_WINDOW: Duration = Duration::from_millis(20);
const COALESCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fired (with an empty `resource_id`) whenever the set of servers an
/// operator's view depends on may be stale: a start, an unclean stop, or
/// anything else that invalidates a cached server listing.
pub const SERVERS_UPDATED: &str = "servers_updated";

/// Fired per organization, `resource_id` set to the organization id, when a
/// server start means that organization's users should refresh their
/// pushed configs.
pub const USERS_UPDATED: &str = "users_updated";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub resource_id: String,
}

struct Scheduled {
    fire_at: Instant,
    event: Event,
}

impl Eq for Scheduled {}
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want soonest-first
        other.fire_at.cmp(&self.fire_at)
    }
}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum Command {
    Publish(Scheduled),
    Shutdown,
}

pub struct EventCoalescer {
    commands: crossbeam_channel::Sender<Command>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventCoalescer {
    pub fn spawn(bus: Arc<dyn Bus>, channel: String) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Command>();

        let handle = thread::spawn(move || {
            let mut pending: BinaryHeap<Scheduled> = BinaryHeap::new();
            loop {
                let timeout = pending.peek().map(|s| s.fire_at.saturating_duration_since(Instant::now())).unwrap_or(Duration::from_secs(3600));

                match rx.recv_timeout(timeout) {
                    Ok(Command::Publish(scheduled)) => pending.push(scheduled),
                    Ok(Command::Shutdown) => return,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }

                let now = Instant::now();
                while let Some(top) = pending.peek() {
                    if top.fire_at > now {
                        break;
                    }
                    let scheduled = pending.pop().expect("peeked item must pop");
                    bus.publish(Message {
                        channel: channel.clone(),
                        resource_id: scheduled.event.resource_id,
                        payload: scheduled.event.event_type,
                    });
                }
            }
        });

        EventCoalescer { commands: tx, handle: Some(handle) }
    }

    pub fn publish(&self, event: Event) {
        self.schedule(event, Duration::ZERO);
    }

    pub fn schedule(&self, event: Event, delay: Duration) {
        let _ = self.commands.send(Command::Publish(Scheduled { fire_at: Instant::now() + delay, event }));
    }

    pub fn stop(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Blocks up to `COALESCE_TIMEOUT` for the first message, then drains
/// everything that arrives within the next `COALESCE_WINDOW`, folding
/// duplicates of the same `(channel, resource_id)` down to the most recent
/// payload. Returns an empty vec on timeout with nothing received.
pub fn recv_coalesced(subscription: &mut dyn Subscription) -> Vec<Message> {
    let Some(first) = subscription.recv_timeout(COALESCE_TIMEOUT) else {
        return Vec::new();
    };

    let mut latest: HashMap<(String, String), Message> = HashMap::new();
    latest.insert((first.channel.clone(), first.resource_id.clone()), first);

    let deadline = Instant::now() + COALESCE_WINDOW;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match subscription.recv_timeout(remaining) {
            Some(message) => {
                latest.insert((message.channel.clone(), message.resource_id.clone()), message);
            }
            None => break,
        }
    }

    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[test]
    fn publish_is_delivered_immediately() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe("events");
        let coalescer = EventCoalescer::spawn(bus.clone(), "events".to_string());

        coalescer.publish(Event { event_type: "started".to_string(), resource_id: "srv-1".to_string() });
        let msg = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.payload, "started");
        coalescer.stop();
    }

    #[test]
    fn schedule_delays_delivery() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe("events");
        let coalescer = EventCoalescer::spawn(bus.clone(), "events".to_string());

        coalescer.schedule(Event { event_type: "stopped".to_string(), resource_id: "srv-1".to_string() }, Duration::from_millis(100));
        assert!(sub.recv_timeout(Duration::from_millis(30)).is_none());
        let msg = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.payload, "stopped");
        coalescer.stop();
    }

    #[test]
    fn recv_coalesced_dedups_bursts_keeping_latest() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe("events");
        bus.publish(Message { channel: "events".to_string(), resource_id: "srv-1".to_string(), payload: "updated-1".to_string() });
        bus.publish(Message { channel: "events".to_string(), resource_id: "srv-1".to_string(), payload: "updated-2".to_string() });
        bus.publish(Message { channel: "events".to_string(), resource_id: "srv-2".to_string(), payload: "updated-3".to_string() });

        let mut messages = recv_coalesced(sub.as_mut());
        messages.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, "updated-2");
        assert_eq!(messages[1].payload, "updated-3");
    }
}
