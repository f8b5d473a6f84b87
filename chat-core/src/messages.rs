//! Message store for chatsync.
//!
//! This module provides the per-chat message window with:
//! - Idempotent merging of insert/update/delete events by message id
//! - Total ordering by `(created_at, id)`, re-derived after every merge
//! - Optimistic entries that are reconciled to their confirmed form or
//!   flagged failed, never silently dropped
//!
//! Ids deleted from the window are tombstoned for its lifetime, so a late
//! insert cannot resurrect a deleted message. Together with set-union
//! merging of reactions and read receipts this makes the final view
//! independent of event arrival order and duplication.
//!
//! Events that match nothing in the window (reactions on unknown messages,
//! deletes of unknown ids) are mostly traffic of other chats, since the
//! reaction feed and delete records carry no chat id. They are held only up
//! to [`HELD_EVENTS_CAPACITY`], oldest first out.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;

use chatsync_types::{
    ChangeEvent, ChatId, Message, MessageDraft, MessageId, PendingId, Reaction, ReactionId, UserId,
};

/// Delivery state of a message in the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Shown optimistically, awaiting the remote insert.
    Pending,
    /// Server-confirmed.
    Confirmed,
    /// The remote insert failed; retry or discard is up to the user.
    Failed {
        /// Collaborator error message.
        reason: String,
    },
}

/// A message in the window together with its delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// The message (temporary id while not confirmed).
    pub message: Message,
    /// Delivery state.
    pub status: DeliveryStatus,
    /// Set for optimistic entries.
    pub pending_id: Option<PendingId>,
}

impl StoredMessage {
    fn confirmed(message: Message) -> Self {
        Self {
            message,
            status: DeliveryStatus::Confirmed,
            pending_id: None,
        }
    }

    /// Check if the entry is server-confirmed.
    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Confirmed)
    }

    /// Check if the entry failed to send.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }
}

/// Upper bound on held reactions and on remembered unmatched deletes.
pub const HELD_EVENTS_CAPACITY: usize = 256;

/// Insertion-ordered set that forgets its oldest entries past a capacity.
#[derive(Debug, Clone)]
struct RecentSet<T> {
    members: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy + Eq + Hash> RecentSet<T> {
    fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, value: T) {
        if !self.members.insert(value) {
            return;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Event recorded while a full fetch is in flight.
#[derive(Debug, Clone)]
enum Journaled {
    Message(ChangeEvent<Message>),
    Reaction(ChangeEvent<Reaction>),
}

/// Ordered, deduplicated message window for one chat.
///
/// Entries flow through the window in this order:
/// 1. `append_optimistic()` - pending entry under a temporary id
/// 2. `reconcile()` - replaced by the confirmed message, or flagged failed
/// 3. `retry()` / `discard()` - user decision on a failed entry
///
/// Remote events go through `apply_event()` and `apply_reaction()`.
#[derive(Debug, Clone)]
pub struct MessageStore {
    chat_id: ChatId,
    entries: HashMap<MessageId, StoredMessage>,
    order: Vec<MessageId>,
    /// Ids removed from the window.
    tombstones: HashSet<MessageId>,
    /// Deletes of ids the window never held.
    unmatched_deletes: RecentSet<MessageId>,
    drafts: HashMap<PendingId, MessageDraft>,
    /// Reactions that arrived before their message, oldest first.
    orphan_reactions: VecDeque<Reaction>,
    removed_reactions: HashSet<ReactionId>,
    unmatched_reaction_deletes: RecentSet<ReactionId>,
    held_capacity: usize,
    /// `Some` between `begin_sync()` and `load()`.
    journal: Option<Vec<Journaled>>,
}

impl MessageStore {
    /// Create an empty window for a chat.
    pub fn new(chat_id: ChatId) -> Self {
        Self::with_held_capacity(chat_id, HELD_EVENTS_CAPACITY)
    }

    /// Create an empty window holding at most `capacity` unmatched
    /// reactions and `capacity` unmatched deletes of each kind.
    pub fn with_held_capacity(chat_id: ChatId, capacity: usize) -> Self {
        Self {
            chat_id,
            entries: HashMap::new(),
            order: Vec::new(),
            tombstones: HashSet::new(),
            unmatched_deletes: RecentSet::new(capacity),
            drafts: HashMap::new(),
            orphan_reactions: VecDeque::new(),
            removed_reactions: HashSet::new(),
            unmatched_reaction_deletes: RecentSet::new(capacity),
            held_capacity: capacity,
            journal: None,
        }
    }

    /// The chat this window belongs to.
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Mark the start of a full fetch.
    ///
    /// Events applied from now on are also journaled and replayed on top of
    /// the fetched snapshot in `load()`, so nothing delivered while the fetch
    /// was in flight is lost.
    pub fn begin_sync(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Install the result of a full fetch.
    ///
    /// Confirmed entries are replaced by the snapshot; optimistic and failed
    /// entries are kept. Records for other chats are ignored.
    pub fn load(&mut self, snapshot: Vec<Message>) {
        self.entries.retain(|_, entry| !entry.is_confirmed());
        self.tombstones.clear();
        self.unmatched_deletes.clear();
        self.orphan_reactions.clear();
        self.removed_reactions.clear();
        self.unmatched_reaction_deletes.clear();

        for message in snapshot {
            if message.chat_id == self.chat_id {
                self.entries
                    .insert(message.id, StoredMessage::confirmed(message));
            }
        }

        for event in self.journal.take().unwrap_or_default() {
            match event {
                Journaled::Message(e) => {
                    self.merge_message(e);
                }
                Journaled::Reaction(e) => {
                    self.merge_reaction(e);
                }
            }
        }
        self.reorder();
    }

    /// Merge a remote message event.
    ///
    /// Returns true if the visible window changed. Re-delivery of an
    /// already-merged event is a no-op.
    pub fn apply_event(&mut self, event: ChangeEvent<Message>) -> bool {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(Journaled::Message(event.clone()));
        }
        let changed = self.merge_message(event);
        if changed {
            self.reorder();
        }
        changed
    }

    /// Merge a remote reaction event.
    ///
    /// Reactions for messages not yet in the window are held until the
    /// message arrives.
    pub fn apply_reaction(&mut self, event: ChangeEvent<Reaction>) -> bool {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(Journaled::Reaction(event.clone()));
        }
        self.merge_reaction(event)
    }

    /// Remove a reaction by id (remote delete).
    pub fn remove_reaction(&mut self, reaction_id: ReactionId) -> bool {
        self.apply_reaction(ChangeEvent::Delete(reaction_id))
    }

    /// Insert a client-synthesized message immediately.
    ///
    /// The entry is shown under a temporary id until `reconcile()`.
    pub fn append_optimistic(&mut self, draft: MessageDraft) -> PendingId {
        let pending_id = PendingId::new();
        let message = Message::from_draft(pending_id.as_message_id(), &draft);
        self.entries.insert(
            message.id,
            StoredMessage {
                message,
                status: DeliveryStatus::Pending,
                pending_id: Some(pending_id),
            },
        );
        self.drafts.insert(pending_id, draft);
        self.reorder();
        pending_id
    }

    /// Settle an optimistic entry.
    ///
    /// On success the temporary entry is replaced by the confirmed message
    /// (merged if the change stream already delivered it). On failure the
    /// entry stays, flagged failed. Returns false for unknown pending ids.
    pub fn reconcile(&mut self, pending_id: PendingId, result: Result<Message, String>) -> bool {
        let temp_id = pending_id.as_message_id();
        if !self.entries.contains_key(&temp_id) {
            return false;
        }

        match result {
            Ok(confirmed) => {
                self.entries.remove(&temp_id);
                self.drafts.remove(&pending_id);
                self.merge_message(ChangeEvent::Insert(confirmed));
            }
            Err(reason) => {
                if let Some(entry) = self.entries.get_mut(&temp_id) {
                    entry.status = DeliveryStatus::Failed { reason };
                }
            }
        }
        self.reorder();
        true
    }

    /// Move a failed entry back to pending and return its draft for resending.
    pub fn retry(&mut self, pending_id: PendingId) -> Option<MessageDraft> {
        let entry = self.entries.get_mut(&pending_id.as_message_id())?;
        if !entry.is_failed() {
            return None;
        }
        entry.status = DeliveryStatus::Pending;
        self.drafts.get(&pending_id).cloned()
    }

    /// Remove a failed entry at the user's request.
    ///
    /// Pending entries cannot be discarded.
    pub fn discard(&mut self, pending_id: PendingId) -> bool {
        let temp_id = pending_id.as_message_id();
        match self.entries.get(&temp_id) {
            Some(entry) if entry.is_failed() => {
                self.entries.remove(&temp_id);
                self.drafts.remove(&pending_id);
                self.order.retain(|id| *id != temp_id);
                true
            }
            _ => false,
        }
    }

    /// Ordered view of the window.
    pub fn messages(&self) -> Vec<&StoredMessage> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    /// Look up a message by id (temporary ids included).
    pub fn get(&self, id: &MessageId) -> Option<&StoredMessage> {
        self.entries.get(id)
    }

    /// Delivery state of an optimistic entry.
    pub fn status(&self, pending_id: &PendingId) -> Option<&DeliveryStatus> {
        self.entries
            .get(&pending_id.as_message_id())
            .map(|entry| &entry.status)
    }

    /// Authors of all messages in the window.
    pub fn author_ids(&self) -> BTreeSet<UserId> {
        self.entries.values().map(|e| e.message.user_id).collect()
    }

    /// Number of optimistic entries still awaiting confirmation.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.status, DeliveryStatus::Pending))
            .count()
    }

    /// Number of held events that matched nothing in the window.
    pub fn held_len(&self) -> usize {
        self.orphan_reactions.len()
            + self.unmatched_deletes.len()
            + self.unmatched_reaction_deletes.len()
    }

    /// Number of messages in the window.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn merge_message(&mut self, event: ChangeEvent<Message>) -> bool {
        match event {
            ChangeEvent::Insert(incoming) | ChangeEvent::Update(incoming) => {
                if incoming.chat_id != self.chat_id
                    || self.tombstones.contains(&incoming.id)
                    || self.unmatched_deletes.contains(&incoming.id)
                {
                    return false;
                }
                let mut merged = incoming;
                let (mine, rest): (VecDeque<_>, VecDeque<_>) = self
                    .orphan_reactions
                    .drain(..)
                    .partition(|r| r.message_id == merged.id);
                self.orphan_reactions = rest;
                for reaction in mine {
                    merged.add_reaction(reaction);
                }
                merged.reactions.retain(|r| !self.is_removed_reaction(&r.id));

                match self.entries.get_mut(&merged.id) {
                    Some(existing) => {
                        merged.absorb(&existing.message);
                        if existing.message == merged && existing.is_confirmed() {
                            return false;
                        }
                        *existing = StoredMessage::confirmed(merged);
                    }
                    None => {
                        self.entries
                            .insert(merged.id, StoredMessage::confirmed(merged));
                    }
                }
                true
            }
            ChangeEvent::Delete(id) => {
                self.orphan_reactions.retain(|r| r.message_id != id);
                if self.entries.remove(&id).is_some() {
                    self.tombstones.insert(id);
                    true
                } else {
                    self.unmatched_deletes.insert(id);
                    false
                }
            }
        }
    }

    fn merge_reaction(&mut self, event: ChangeEvent<Reaction>) -> bool {
        match event {
            ChangeEvent::Insert(reaction) | ChangeEvent::Update(reaction) => {
                if self.is_removed_reaction(&reaction.id)
                    || self.tombstones.contains(&reaction.message_id)
                    || self.unmatched_deletes.contains(&reaction.message_id)
                {
                    return false;
                }
                match self.entries.get_mut(&reaction.message_id) {
                    Some(entry) => entry.message.add_reaction(reaction),
                    None => {
                        if !self.orphan_reactions.iter().any(|r| r.id == reaction.id) {
                            self.orphan_reactions.push_back(reaction);
                            while self.orphan_reactions.len() > self.held_capacity {
                                self.orphan_reactions.pop_front();
                            }
                        }
                        false
                    }
                }
            }
            ChangeEvent::Delete(reaction_id) => {
                self.orphan_reactions.retain(|r| r.id != reaction_id);
                let mut changed = false;
                for entry in self.entries.values_mut() {
                    let before = entry.message.reactions.len();
                    entry.message.reactions.retain(|r| r.id != reaction_id);
                    changed |= entry.message.reactions.len() != before;
                }
                if changed {
                    self.removed_reactions.insert(reaction_id);
                } else {
                    self.unmatched_reaction_deletes.insert(reaction_id);
                }
                changed
            }
        }
    }

    fn is_removed_reaction(&self, id: &ReactionId) -> bool {
        self.removed_reactions.contains(id) || self.unmatched_reaction_deletes.contains(id)
    }

    fn reorder(&mut self) {
        let mut order: Vec<_> = self
            .entries
            .values()
            .map(|entry| entry.message.order_key())
            .collect();
        order.sort_unstable();
        self.order = order.into_iter().map(|(_, id)| id).collect();
    }
}
