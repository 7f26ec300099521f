use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{Chat, Message, User, UserId};

/// Something changed; subscribers re-query what they show.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ChatCreated { chat: Chat, members: Vec<UserId> },
    MessageCreated { message: Message },
    ChatRead { chat_id: String, user_id: UserId, last_read_at: i64 },
    UserUpdated { user: User },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    Everyone,
    Users(Vec<UserId>),
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ChatEvent,
}

impl Envelope {
    pub fn is_for(&self, user_id: &str) -> bool {
        match &self.audience {
            Audience::Everyone => true,
            Audience::Users(users) => users.iter().any(|u| u == user_id),
        }
    }
}

pub fn publish(events: &broadcast::Sender<Envelope>, audience: Audience, event: ChatEvent) {
    // no subscribers is fine
    let _ = events.send(Envelope { audience, event });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(users: &[&str]) -> Envelope {
        Envelope {
            audience: Audience::Users(users.iter().map(|u| u.to_string()).collect()),
            event: ChatEvent::ChatRead { chat_id: "c".to_owned(), user_id: "a".to_owned(), last_read_at: 1 },
        }
    }

    #[test]
    fn audience_filters_users() {
        let envelope = read(&["a", "b"]);
        assert!(envelope.is_for("a"));
        assert!(envelope.is_for("b"));
        assert!(!envelope.is_for("c"));
    }

    #[test]
    fn everyone_sees_everything() {
        let mut envelope = read(&[]);
        assert!(!envelope.is_for("a"));
        envelope.audience = Audience::Everyone;
        assert!(envelope.is_for("a"));
    }

    #[test]
    fn events_are_tagged() {
        let json = serde_json::to_value(&read(&[]).event).unwrap();
        assert_eq!(json["type"], "chat_read");
        assert_eq!(json["chat_id"], "c");
        assert_eq!(json["last_read_at"], 1);
    }

    #[test]
    fn publish_without_subscribers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        publish(&tx, Audience::Everyone, read(&[]).event);
    }

    #[test]
    fn chat_created_lists_members() {
        let chat = Chat {
            id: "c".to_owned(),
            name: "Alice, Bob".to_owned(),
            chat_type: crate::db::ChatType::Direct,
            created_at: 1,
            updated_at: 1,
        };
        let json = serde_json::to_value(ChatEvent::ChatCreated { chat, members: vec!["a".to_owned(), "b".to_owned()] }).unwrap();
        assert_eq!(json["type"], "chat_created");
        assert_eq!(json["chat"]["chat_type"], "direct");
        assert_eq!(json["members"], serde_json::json!(["a", "b"]));
    }
}
