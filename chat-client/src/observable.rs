//! Observable engine state.
//!
//! The engine publishes an immutable [`EngineSnapshot`] after every change;
//! UI layers hold a `watch::Receiver` and re-render on `changed()`.

use std::collections::HashMap;

use tokio::sync::watch;

use chatsync_core::{SelectionState, StoredMessage};
use chatsync_types::{Chat, ChatId, Profile, SyncError, UserId};

/// A chat together with its computed display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    /// The chat.
    pub chat: Chat,
    /// Name shown to the session user.
    pub display_name: String,
}

/// Status of the selected chat, as shown to the application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionStatus {
    /// No chat selected.
    #[default]
    Unselected,
    /// Initial load in progress.
    Loading,
    /// Loaded and streaming.
    Live,
    /// Recovering from a dropped stream.
    Resyncing {
        /// Current attempt.
        attempt: u32,
    },
    /// Load failed; selecting again retries.
    Error {
        /// The failure.
        error: SyncError,
    },
}

impl From<&SelectionState> for SelectionStatus {
    fn from(state: &SelectionState) -> Self {
        match state {
            SelectionState::Unselected => SelectionStatus::Unselected,
            SelectionState::Loading { .. } => SelectionStatus::Loading,
            SelectionState::Live { .. } => SelectionStatus::Live,
            SelectionState::Resyncing { attempt, .. } => SelectionStatus::Resyncing {
                attempt: *attempt,
            },
            SelectionState::Error { error, .. } => SelectionStatus::Error {
                error: error.clone(),
            },
        }
    }
}

/// Everything a UI needs to render, at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    /// Signed-in user.
    pub user_id: Option<UserId>,
    /// Roster, ordered by `(created_at, id)`.
    pub chats: Vec<ChatView>,
    /// Selected chat.
    pub selected_chat: Option<ChatId>,
    /// Status of the selection.
    pub selection: SelectionStatus,
    /// Message window of the selected chat, ordered.
    pub messages: Vec<StoredMessage>,
    /// Other users typing in the selected chat, most recent first.
    pub typing_users: Vec<UserId>,
    /// Known profiles.
    pub profiles: HashMap<UserId, Profile>,
}

impl EngineSnapshot {
    /// Display name of a chat in the roster.
    pub fn chat_name(&self, chat_id: &ChatId) -> Option<&str> {
        self.chats
            .iter()
            .find(|view| view.chat.id == *chat_id)
            .map(|view| view.display_name.as_str())
    }

    /// Username for a user id, falling back to the placeholder name.
    pub fn username(&self, user_id: &UserId) -> &str {
        self.profiles
            .get(user_id)
            .map(|p| p.username.as_str())
            .unwrap_or(Profile::UNKNOWN_USERNAME)
    }
}

/// Single-writer, many-reader snapshot cell.
#[derive(Debug)]
pub struct Observable {
    sender: watch::Sender<EngineSnapshot>,
}

impl Default for Observable {
    fn default() -> Self {
        let (sender, _) = watch::channel(EngineSnapshot::default());
        Self { sender }
    }
}

impl Observable {
    /// Create a cell holding the empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot, waking subscribers only if it changed.
    pub fn publish(&self, snapshot: EngineSnapshot) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        })
    }

    /// Subscribe to snapshots.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.sender.subscribe()
    }

    /// The current snapshot.
    pub fn current(&self) -> EngineSnapshot {
        self.sender.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_wakes_subscribers_on_change_only() {
        let cell = Observable::new();
        let mut rx = cell.subscribe();
        let user = UserId::new();

        let snapshot = EngineSnapshot {
            user_id: Some(user),
            ..EngineSnapshot::default()
        };
        assert!(cell.publish(snapshot.clone()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().user_id, Some(user));

        assert!(!cell.publish(snapshot));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn username_falls_back_to_placeholder() {
        let snapshot = EngineSnapshot::default();
        assert_eq!(snapshot.username(&UserId::new()), "Unknown User");
    }

    #[test]
    fn status_from_state() {
        let chat_id = ChatId::new();
        let state = SelectionState::Resyncing {
            chat_id,
            epoch: 1,
            attempt: 2,
        };
        assert_eq!(
            SelectionStatus::from(&state),
            SelectionStatus::Resyncing { attempt: 2 }
        );
    }
}
