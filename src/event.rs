//! Domain events handed to the presentation layer.
//!
//! The core never renders anything.  It calls [`EventBus::post`] and
//! whatever subscribed to the receiving end decides how to display it.

use tokio::sync::mpsc;

use crate::member::Member;
use crate::protocol::TextMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    /// A text message arrived from another member.
    MessageReceived(TextMessage),
    /// A member was admitted (locally or by announcement).
    MemberJoined(Member),
    /// A member left, voluntarily or declared dead.
    MemberLeft(Member),
    /// The group has a new coordinator.
    CoordinatorChanged(Member),
    /// Operational notice for the local operator.
    Notice(String),
}

/// Sending half of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<GroupEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an event.  Dropped silently once nobody listens.
    pub fn post(&self, event: GroupEvent) {
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.post(GroupEvent::Notice(text.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_delivers_in_order() {
        let (bus, mut rx) = EventBus::new();
        bus.notice("one");
        bus.post(GroupEvent::MemberLeft(Member::with_id("bob", 1, "h", 1)));
        assert_eq!(rx.recv().await, Some(GroupEvent::Notice("one".to_string())));
        assert!(matches!(rx.recv().await, Some(GroupEvent::MemberLeft(m)) if m.id == 1));
    }

    #[test]
    fn test_post_after_receiver_dropped_is_silent() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.notice("nobody listens");
    }
}
