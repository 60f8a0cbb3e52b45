use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

/// In-process named channels. Any number of writers may publish to a name and
/// every live subscriber receives each message.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl BroadcastHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns how many listeners the message reached.
    pub fn publish(&self, name: &str, message: &str) -> usize {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = channels.get(name) else {
            return 0;
        };
        if let Ok(delivered) = sender.send(message.to_string()) {
            delivered
        } else {
            channels.remove(name);
            0
        }
    }

    /// Drops channels whose last listener has gone away.
    pub fn prune(&self) {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The hosting window regained focus.
    FocusGained,
    VisibilityChanged { visible: bool },
}

impl HostEvent {
    /// Events after which a dismissed popup or tab becomes observable.
    #[must_use]
    pub fn may_reveal_dismissal(self) -> bool {
        matches!(
            self,
            Self::FocusGained | Self::VisibilityChanged { visible: true }
        )
    }
}

/// Focus and visibility notifications from the host UI. Headless hosts never
/// publish, so dismissal there is only noticed through the timeout.
#[derive(Debug, Clone)]
pub struct HostEventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl Default for HostEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish(&self, event: HostEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_listener() {
        let hub = BroadcastHub::new();
        let mut first = hub.subscribe("openagents-redirect-a");
        let mut second = hub.subscribe("openagents-redirect-a");
        assert_eq!(hub.publish("openagents-redirect-a", "hello"), 2);
        assert_eq!(first.recv().await.expect("first"), "hello");
        assert_eq!(second.recv().await.expect("second"), "hello");
        assert_eq!(hub.publish("openagents-redirect-b", "nobody"), 0);
    }

    #[test]
    fn channels_are_pruned_after_last_listener_leaves() {
        let hub = BroadcastHub::new();
        let receiver = hub.subscribe("gone");
        assert_eq!(hub.listener_count("gone"), 1);
        drop(receiver);
        hub.prune();
        assert_eq!(hub.channel_count(), 0);
        assert_eq!(hub.publish("gone", "late"), 0);
    }

    #[test]
    fn only_focus_and_visible_events_reveal_dismissal() {
        assert!(HostEvent::FocusGained.may_reveal_dismissal());
        assert!(HostEvent::VisibilityChanged { visible: true }.may_reveal_dismissal());
        assert!(!HostEvent::VisibilityChanged { visible: false }.may_reveal_dismissal());
    }
}
