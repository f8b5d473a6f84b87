//! Typed change notifications.
//!
//! The collaborator emits `{op, table, record}` triples with untyped JSON
//! records. [`ChangeEvent::decode`] turns one into a typed event for an
//! [`Entity`]. Delete records only need to carry the id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::Hash;

use crate::{Chat, ChatId, Message, MessageId, Profile, Reaction, ReactionId, SyncError};
use crate::{TypingIndicator, UserId};

/// Remote collections the engine reads or subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// User profiles.
    Profiles,
    /// Chats.
    Chats,
    /// Messages.
    Messages,
    /// Emoji reactions.
    MessageReactions,
    /// Ephemeral typing signals (broadcast only, never persisted).
    TypingIndicators,
}

impl Table {
    /// Collection name as used by the remote store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Chats => "chats",
            Table::Messages => "messages",
            Table::MessageReactions => "message_reactions",
            Table::TypingIndicators => "typing_indicators",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed.
    Delete,
}

/// An entity that can be decoded from a collaborator record.
pub trait Entity: DeserializeOwned + Clone + Send + 'static {
    /// Identity used for idempotent merges.
    type Id: Copy + Eq + Hash + fmt::Debug + Send + 'static;

    /// Collection the entity lives in.
    const TABLE: Table;

    /// The entity's id.
    fn id(&self) -> Self::Id;

    /// Extract the id from a (possibly partial) delete record.
    fn decode_id(record: &Value) -> Result<Self::Id, SyncError>;
}

#[derive(Deserialize)]
struct IdOnly<I> {
    id: I,
}

fn decode_id_field<I: DeserializeOwned>(table: Table, record: &Value) -> Result<I, SyncError> {
    IdOnly::<I>::deserialize(record)
        .map(|r| r.id)
        .map_err(|e| SyncError::InvalidRecord {
            table,
            reason: e.to_string(),
        })
}

impl Entity for Profile {
    type Id = UserId;
    const TABLE: Table = Table::Profiles;

    fn id(&self) -> UserId {
        self.id
    }

    fn decode_id(record: &Value) -> Result<UserId, SyncError> {
        decode_id_field(Self::TABLE, record)
    }
}

impl Entity for Chat {
    type Id = ChatId;
    const TABLE: Table = Table::Chats;

    fn id(&self) -> ChatId {
        self.id
    }

    fn decode_id(record: &Value) -> Result<ChatId, SyncError> {
        decode_id_field(Self::TABLE, record)
    }
}

impl Entity for Message {
    type Id = MessageId;
    const TABLE: Table = Table::Messages;

    fn id(&self) -> MessageId {
        self.id
    }

    fn decode_id(record: &Value) -> Result<MessageId, SyncError> {
        decode_id_field(Self::TABLE, record)
    }
}

impl Entity for Reaction {
    type Id = ReactionId;
    const TABLE: Table = Table::MessageReactions;

    fn id(&self) -> ReactionId {
        self.id
    }

    fn decode_id(record: &Value) -> Result<ReactionId, SyncError> {
        decode_id_field(Self::TABLE, record)
    }
}

impl Entity for TypingIndicator {
    type Id = (ChatId, UserId);
    const TABLE: Table = Table::TypingIndicators;

    fn id(&self) -> (ChatId, UserId) {
        (self.chat_id, self.user_id)
    }

    fn decode_id(record: &Value) -> Result<(ChatId, UserId), SyncError> {
        #[derive(Deserialize)]
        struct Key {
            chat_id: ChatId,
            user_id: UserId,
        }
        Key::deserialize(record)
            .map(|k| (k.chat_id, k.user_id))
            .map_err(|e| SyncError::InvalidRecord {
                table: Self::TABLE,
                reason: e.to_string(),
            })
    }
}

/// A typed insert/update/delete notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T: Entity> {
    /// A new row.
    Insert(T),
    /// A modified row (full record).
    Update(T),
    /// A removed row.
    Delete(T::Id),
}

impl<T: Entity> ChangeEvent<T> {
    /// Decode a raw collaborator record.
    pub fn decode(op: ChangeOp, record: &Value) -> Result<Self, SyncError> {
        let entity = || {
            T::deserialize(record).map_err(|e| SyncError::InvalidRecord {
                table: T::TABLE,
                reason: e.to_string(),
            })
        };
        match op {
            ChangeOp::Insert => entity().map(Self::Insert),
            ChangeOp::Update => entity().map(Self::Update),
            ChangeOp::Delete => T::decode_id(record).map(Self::Delete),
        }
    }

    /// Id of the affected row.
    pub fn id(&self) -> T::Id {
        match self {
            Self::Insert(e) | Self::Update(e) => e.id(),
            Self::Delete(id) => *id,
        }
    }

    /// The full entity, if this is not a delete.
    pub fn entity(&self) -> Option<&T> {
        match self {
            Self::Insert(e) | Self::Update(e) => Some(e),
            Self::Delete(_) => None,
        }
    }

    /// Operation kind.
    pub fn op(&self) -> ChangeOp {
        match self {
            Self::Insert(_) => ChangeOp::Insert,
            Self::Update(_) => ChangeOp::Update,
            Self::Delete(_) => ChangeOp::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_names_match_store() {
        assert_eq!(Table::MessageReactions.to_string(), "message_reactions");
        assert_eq!(
            serde_json::to_value(Table::Messages).unwrap(),
            json!("messages")
        );
    }

    #[test]
    fn op_uses_uppercase_wire_names() {
        let op: ChangeOp = serde_json::from_value(json!("DELETE")).unwrap();
        assert_eq!(op, ChangeOp::Delete);
    }

    #[test]
    fn decode_delete_needs_only_id() {
        let id = MessageId::new();
        let event = ChangeEvent::<Message>::decode(ChangeOp::Delete, &json!({ "id": id })).unwrap();
        assert_eq!(event, ChangeEvent::Delete(id));
        assert!(event.entity().is_none());
    }

    #[test]
    fn decode_insert_rejects_partial_record() {
        let result = ChangeEvent::<Message>::decode(ChangeOp::Insert, &json!({ "id": MessageId::new() }));
        assert!(matches!(
            result,
            Err(SyncError::InvalidRecord {
                table: Table::Messages,
                ..
            })
        ));
    }

    #[test]
    fn decode_update_keeps_entity() {
        let chat_id = ChatId::new();
        let record = json!({
            "id": chat_id,
            "created_at": "2024-01-01T00:00:00Z",
            "is_group": true,
            "participants": [],
            "name": "Team",
        });
        let event = ChangeEvent::<Chat>::decode(ChangeOp::Update, &record).unwrap();
        assert_eq!(event.op(), ChangeOp::Update);
        assert_eq!(event.id(), chat_id);
        assert_eq!(event.entity().unwrap().name.as_deref(), Some("Team"));
    }

    #[test]
    fn typing_id_is_chat_and_user() {
        let (chat_id, user_id) = (ChatId::new(), UserId::new());
        let id = TypingIndicator::decode_id(&json!({ "chat_id": chat_id, "user_id": user_id }))
            .unwrap();
        assert_eq!(id, (chat_id, user_id));
    }
}
