//! Typing presence.
//!
//! Keeps the latest typing signal per `(chat, user)`. A user counts as
//! typing while their last signal is younger than the window. Entries are
//! bounded: past capacity, the stalest signal is evicted.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use chatsync_types::{ChatId, TypingIndicator, UserId};

/// Default liveness window.
pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_millis(4000);

/// Default number of tracked `(chat, user)` pairs.
pub const DEFAULT_TYPING_CAPACITY: usize = 256;

/// Time-windowed map of who is typing where.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    window_ms: i64,
    capacity: usize,
    entries: HashMap<(ChatId, UserId), DateTime<Utc>>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_WINDOW, DEFAULT_TYPING_CAPACITY)
    }
}

impl TypingTracker {
    /// Create a tracker. A zero capacity is treated as one.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// Record a typing signal.
    ///
    /// Signals older than the one already held are ignored. Returns true if
    /// the entry was stored.
    pub fn set_typing(&mut self, chat_id: ChatId, user_id: UserId, at: DateTime<Utc>) -> bool {
        let key = (chat_id, user_id);
        if let Some(existing) = self.entries.get(&key) {
            if *existing >= at {
                return false;
            }
        }
        self.entries.insert(key, at);

        while self.entries.len() > self.capacity {
            let stalest = self
                .entries
                .iter()
                .min_by_key(|(k, ts)| (**ts, **k))
                .map(|(k, _)| *k);
            match stalest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
        self.entries.contains_key(&key)
    }

    /// Record a decoded typing indicator.
    pub fn apply(&mut self, indicator: &TypingIndicator) -> bool {
        self.set_typing(indicator.chat_id, indicator.user_id, indicator.timestamp)
    }

    /// Users typing in a chat as of `now`, most recent first.
    pub fn get(&self, chat_id: &ChatId, now: DateTime<Utc>) -> Vec<UserId> {
        let mut live: Vec<_> = self
            .entries
            .iter()
            .filter(|((chat, _), ts)| chat == chat_id && self.is_live(**ts, now))
            .map(|((_, user), ts)| (*ts, *user))
            .collect();
        live.sort_by(|a, b| b.cmp(a));
        live.into_iter().map(|(_, user)| user).collect()
    }

    /// Drop expired entries. Returns the number removed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let window_ms = self.window_ms;
        self.entries
            .retain(|_, ts| (now - *ts).num_milliseconds() < window_ms);
        before - self.entries.len()
    }

    /// Forget a user's signal in a chat.
    pub fn clear(&mut self, chat_id: &ChatId, user_id: &UserId) -> bool {
        self.entries.remove(&(*chat_id, *user_id)).is_some()
    }

    /// Forget all signals for a chat.
    pub fn clear_chat(&mut self, chat_id: &ChatId) {
        self.entries.retain(|(chat, _), _| chat != chat_id);
    }

    /// Number of tracked entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - ts).num_milliseconds() < self.window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn tracker() -> TypingTracker {
        TypingTracker::new(Duration::from_millis(4000), 8)
    }

    #[test]
    fn signal_is_live_within_window() {
        let mut typing = tracker();
        let (chat, user) = (ChatId::new(), UserId::new());
        let t = Utc::now();

        typing.set_typing(chat, user, t);

        assert_eq!(typing.get(&chat, t + TimeDelta::milliseconds(3999)), vec![user]);
        assert!(typing.get(&chat, t + TimeDelta::milliseconds(4000)).is_empty());
    }

    #[test]
    fn other_chats_are_not_reported() {
        let mut typing = tracker();
        let t = Utc::now();
        typing.set_typing(ChatId::new(), UserId::new(), t);

        assert!(typing.get(&ChatId::new(), t).is_empty());
    }

    #[test]
    fn older_signal_does_not_overwrite_newer() {
        let mut typing = tracker();
        let (chat, user) = (ChatId::new(), UserId::new());
        let t = Utc::now();

        assert!(typing.set_typing(chat, user, t));
        assert!(!typing.set_typing(chat, user, t - TimeDelta::seconds(10)));
        assert_eq!(typing.get(&chat, t + TimeDelta::seconds(1)), vec![user]);
    }

    #[test]
    fn most_recent_first() {
        let mut typing = tracker();
        let chat = ChatId::new();
        let (a, b) = (UserId::new(), UserId::new());
        let t = Utc::now();

        typing.set_typing(chat, a, t);
        typing.set_typing(chat, b, t + TimeDelta::milliseconds(500));

        assert_eq!(typing.get(&chat, t + TimeDelta::seconds(1)), vec![b, a]);
    }

    #[test]
    fn capacity_evicts_stalest() {
        let mut typing = TypingTracker::new(Duration::from_secs(60), 2);
        let chat = ChatId::new();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let t = Utc::now();

        typing.set_typing(chat, a, t);
        typing.set_typing(chat, b, t + TimeDelta::seconds(1));
        typing.set_typing(chat, c, t + TimeDelta::seconds(2));

        assert_eq!(typing.len(), 2);
        assert_eq!(typing.get(&chat, t + TimeDelta::seconds(3)), vec![c, b]);
    }

    #[test]
    fn sweep_removes_expired() {
        let mut typing = tracker();
        let chat = ChatId::new();
        let t = Utc::now();
        typing.set_typing(chat, UserId::new(), t);
        typing.set_typing(chat, UserId::new(), t + TimeDelta::seconds(3));

        assert_eq!(typing.sweep(t + TimeDelta::seconds(5)), 1);
        assert_eq!(typing.len(), 1);
    }

    #[test]
    fn clear_chat_forgets_signals() {
        let mut typing = tracker();
        let (chat, user) = (ChatId::new(), UserId::new());
        let t = Utc::now();
        typing.set_typing(chat, user, t);
        typing.set_typing(ChatId::new(), user, t);

        typing.clear_chat(&chat);
        assert_eq!(typing.len(), 1);
        assert!(!typing.clear(&chat, &user));
    }

    #[test]
    fn apply_indicator() {
        let mut typing = TypingTracker::default();
        let indicator = TypingIndicator {
            user_id: UserId::new(),
            chat_id: ChatId::new(),
            timestamp: Utc::now(),
        };

        assert!(typing.apply(&indicator));
        assert_eq!(
            typing.get(&indicator.chat_id, indicator.timestamp),
            vec![indicator.user_id]
        );
    }
}
