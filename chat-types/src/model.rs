//! Entities mirrored from the remote store.
//!
//! Field names match the collaborator's column names so rows decode
//! directly with serde. Optional list columns may arrive as `null`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::{ChatId, MessageId, ReactionId, UserId};

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A user's public profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// User id (same as the auth user id).
    pub id: UserId,
    /// Display handle.
    pub username: String,
    /// Optional avatar image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Username shown for users whose profile could not be resolved.
    pub const UNKNOWN_USERNAME: &'static str = "Unknown User";

    /// Placeholder profile for an unresolvable id.
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            username: Self::UNKNOWN_USERNAME.to_string(),
            avatar_url: None,
            created_at: DateTime::<Utc>::default(),
        }
    }

    /// Check whether this is a placeholder from [`Profile::unknown`].
    pub fn is_placeholder(&self) -> bool {
        self.username == Self::UNKNOWN_USERNAME && self.created_at == DateTime::<Utc>::default()
    }
}

/// A conversation between two or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat id.
    pub id: ChatId,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Explicit name; display falls back to a computed label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Group chat (more than one other participant, or explicitly grouped).
    #[serde(default)]
    pub is_group: bool,
    /// Participants in join order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub participants: Vec<UserId>,
}

impl Chat {
    /// Check if the user participates in this chat.
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    /// Participants other than `me`, in join order.
    pub fn others<'a>(&'a self, me: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |id| *id != me)
    }

    /// The explicit name, if set and not blank.
    pub fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }

    /// Drop repeated participants, keeping first occurrence.
    pub fn normalized(mut self) -> Self {
        let mut seen = BTreeSet::new();
        self.participants.retain(|id| seen.insert(*id));
        self
    }
}

/// One emoji reaction by one user on one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Reaction id.
    pub id: ReactionId,
    /// Message reacted to.
    pub message_id: MessageId,
    /// Reacting user.
    pub user_id: UserId,
    /// The emoji.
    pub emoji: String,
}

impl Reaction {
    /// Whether two reactions express the same `(message, user, emoji)` triple.
    pub fn same_as(&self, other: &Reaction) -> bool {
        self.message_id == other.message_id
            && self.user_id == other.user_id
            && self.emoji == other.emoji
    }

    /// Insert payload (the store assigns the id).
    pub fn insert_record(message_id: MessageId, user_id: UserId, emoji: &str) -> Value {
        json!({
            "message_id": message_id,
            "user_id": user_id,
            "emoji": emoji,
        })
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: MessageId,
    /// Owning chat.
    pub chat_id: ChatId,
    /// Author.
    pub user_id: UserId,
    /// Text, or the file name for attachments.
    pub content: String,
    /// Client-stamped creation time.
    pub created_at: DateTime<Utc>,
    /// Public URL of an attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// MIME type of the attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Reactions; grows monotonically.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub reactions: Vec<Reaction>,
    /// Users who have read the message; grows monotonically.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    /// Total order within a chat: `(created_at, id)`.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    /// Whether the message carries a file.
    pub fn is_attachment(&self) -> bool {
        self.file_url.is_some()
    }

    /// Whether the attachment should render inline as an image.
    pub fn is_image(&self) -> bool {
        self.file_url.is_some()
            && self
                .file_type
                .as_deref()
                .is_some_and(|t| t.starts_with("image/"))
    }

    /// Union the monotonic fields of `other` into `self`.
    pub fn absorb(&mut self, other: &Message) {
        for reaction in &other.reactions {
            self.add_reaction(reaction.clone());
        }
        self.read_by.extend(other.read_by.iter().copied());
    }

    /// Add a reaction unless one with the same id is already present.
    ///
    /// Rows repeating a `(user, emoji)` pair under another id are kept, so
    /// deleting one of them leaves the other regardless of arrival order.
    /// Returns true if the reaction was added.
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        if self.reactions.iter().any(|r| r.id == reaction.id) {
            return false;
        }
        self.reactions.push(reaction);
        self.reactions.sort_by_key(|r| r.id);
        true
    }

    /// Reactions to display: one per `(user, emoji)`, the lowest id winning.
    pub fn visible_reactions(&self) -> Vec<&Reaction> {
        let mut visible: Vec<&Reaction> = Vec::with_capacity(self.reactions.len());
        for reaction in &self.reactions {
            if !visible.iter().any(|r| r.same_as(reaction)) {
                visible.push(reaction);
            }
        }
        visible
    }

    /// Whether `user_id` has reacted with `emoji`.
    pub fn has_reaction(&self, user_id: &UserId, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.user_id == *user_id && r.emoji == emoji)
    }

    /// Build the optimistic local copy of a draft.
    pub fn from_draft(id: MessageId, draft: &MessageDraft) -> Self {
        Self {
            id,
            chat_id: draft.chat_id,
            user_id: draft.user_id,
            content: draft.content.clone(),
            created_at: draft.created_at,
            file_url: draft.file_url.clone(),
            file_type: draft.file_type.clone(),
            reactions: Vec::new(),
            read_by: BTreeSet::new(),
        }
    }
}

/// A message composed locally, not yet confirmed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Target chat.
    pub chat_id: ChatId,
    /// Author (the session user).
    pub user_id: UserId,
    /// Text, or the file name for attachments.
    pub content: String,
    /// Client timestamp; also used as the server `created_at`.
    pub created_at: DateTime<Utc>,
    /// Public URL of an uploaded attachment.
    pub file_url: Option<String>,
    /// MIME type of the attachment.
    pub file_type: Option<String>,
}

impl MessageDraft {
    /// A plain text draft stamped now.
    pub fn text(chat_id: ChatId, user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            user_id,
            content: content.into(),
            created_at: Utc::now(),
            file_url: None,
            file_type: None,
        }
    }

    /// Attach a file reference.
    pub fn with_file(mut self, url: impl Into<String>, file_type: impl Into<String>) -> Self {
        self.file_url = Some(url.into());
        self.file_type = Some(file_type.into());
        self
    }

    /// Insert payload for the messages collection (the store assigns the id).
    pub fn insert_record(&self) -> Value {
        let mut record = json!({
            "chat_id": self.chat_id,
            "user_id": self.user_id,
            "content": self.content,
            "created_at": self.created_at,
        });
        if let (Some(url), Value::Object(map)) = (&self.file_url, &mut record) {
            map.insert("file_url".into(), json!(url));
            map.insert("file_type".into(), json!(self.file_type));
        }
        record
    }
}

/// Ephemeral "user is typing" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    /// Typing user.
    pub user_id: UserId,
    /// Chat being typed in.
    pub chat_id: ChatId,
    /// When the keystroke happened (milliseconds on the wire).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
