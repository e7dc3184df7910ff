//! Process-local event bus.
//!
//! Components receive a bus handle at construction and subscribe for as long
//! as they run; dropping the [`Subscription`] unsubscribes.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;
use tracing::warn;

use crate::domain::ActivityReason;
use crate::domain::HardwareId;
use crate::domain::IdleState;
use crate::domain::MonitorInfo;

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 64;

/// Notifications published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The set of connected monitors changed. Records are fully enriched.
    MonitorsChanged(Vec<MonitorInfo>),

    /// A monitor's idle state transition was committed.
    IdleStateChanged {
        hardware_id: HardwareId,
        state: IdleState,
        reason: ActivityReason,
    },

    /// Lift every blackout and undim every monitor.
    RestoreAll,
}

/// Cloneable handle to the bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    pub fn publish(&self, event: BusEvent) -> usize {
        if let Ok(n) = self.tx.send(event) {
            n
        } else {
            trace!("Event published with no subscribers");
            0
        }
    }

    /// Start receiving events published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A live subscription. Drop it to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once every bus handle is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(BusEvent::RestoreAll), 2);
        assert_eq!(a.recv().await, Some(BusEvent::RestoreAll));
        assert_eq!(b.recv().await, Some(BusEvent::RestoreAll));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(BusEvent::RestoreAll), 0);
    }

    #[test]
    fn test_subscription_sees_only_later_events() {
        let bus = EventBus::default();
        bus.publish(BusEvent::RestoreAll);

        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_lagged_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for _ in 0..3 {
            bus.publish(BusEvent::RestoreAll);
        }
        bus.publish(BusEvent::MonitorsChanged(Vec::new()));

        assert_eq!(sub.try_recv(), Some(BusEvent::RestoreAll));
        assert_eq!(sub.try_recv(), Some(BusEvent::MonitorsChanged(Vec::new())));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_none_after_bus_dropped() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }
}
