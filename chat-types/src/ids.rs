//! Identity types for chatsync.
//!
//! Every id the remote store hands out is a UUID. The newtypes keep a
//! `ChatId` from being passed where a `UserId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random id.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifies a user (and their profile row).
    UserId
);

uuid_id!(
    /// Identifies a chat.
    ChatId
);

uuid_id!(
    /// Identifies a message. Server-assigned, unique across all chats.
    MessageId
);

uuid_id!(
    /// Identifies a single reaction record.
    ReactionId
);

uuid_id!(
    /// Temporary id of an optimistic message awaiting server confirmation.
    ///
    /// Never sent to the remote store and never equal to a server id.
    PendingId
);

impl PendingId {
    /// The temporary message id used for the optimistic entry.
    pub fn as_message_id(&self) -> MessageId {
        MessageId(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_uuid_v4() {
        let id = MessageId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn id_parses_from_display() {
        let original = ChatId::new();
        let parsed: ChatId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn id_rejects_garbage() {
        assert!("not-a-uuid".parse::<UserId>().is_err());
    }

    #[test]
    fn debug_is_shortened() {
        let id = UserId::new();
        let debug = format!("{:?}", id);
        assert!(debug.starts_with("UserId("));
        assert_eq!(debug.len(), "UserId(".len() + 8 + 1);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn pending_message_id_shares_uuid() {
        let pending = PendingId::new();
        assert_eq!(pending.as_message_id().as_uuid(), pending.as_uuid());
    }
}
