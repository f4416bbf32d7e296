use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::permission::PermissionLevel;

const CAPACITY: usize = 100;

/// Published after a task or sub-task commits.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    ItemCreated { id: Uuid, parent: Option<Uuid> },
    ItemUpdated { id: Uuid },
    ItemDeleted { id: Uuid },
    ItemMoved { id: Uuid, new_parent: Option<Uuid> },
    ItemCopied { source: Uuid, copy: Uuid },
    MembershipCreated {
        id: Uuid,
        item: Uuid,
        account: Uuid,
        permission: PermissionLevel,
    },
    MembershipUpdated { id: Uuid, permission: PermissionLevel },
    MembershipDeleted { id: Uuid, item: Uuid, account: Uuid },
}

/// Fan-out of [`Event`]s to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks
/// and never fails, even with nobody listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new();
        // nobody listening yet
        bus.send(Event::ItemDeleted { id: Uuid::new_v4() });

        let mut rx = bus.subscribe();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        bus.send(Event::ItemCreated { id: a, parent: None });
        bus.send(Event::ItemMoved {
            id: a,
            new_parent: Some(b),
        });

        assert_eq!(rx.recv().await.unwrap(), Event::ItemCreated { id: a, parent: None });
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ItemMoved {
                id: a,
                new_parent: Some(b)
            }
        );
    }

    #[test]
    fn test_events_are_tagged_by_type() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(Event::ItemUpdated { id }).unwrap();
        assert_eq!(json["type"], "ItemUpdated");
        assert_eq!(json["id"], id.to_string());
    }
}
