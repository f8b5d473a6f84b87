//! Chat roster: the chats the session user participates in.
//!
//! Ordered by `(created_at, id)` ascending. Chat events are filtered by
//! membership, so a chat the user is removed from drops out and a chat the
//! user is added to appears.

use std::collections::{BTreeSet, HashMap, HashSet};

use chatsync_types::{ChangeEvent, Chat, ChatId, Profile, UserId};

/// Label for a group chat with no name and no resolved participants.
pub const GROUP_FALLBACK_NAME: &str = "Group Chat";

/// Maximum number of usernames listed in a computed group label.
pub const GROUP_LABEL_NAMES: usize = 3;

/// Membership-filtered list of chats for one user.
#[derive(Debug, Clone)]
pub struct ChatRoster {
    user_id: UserId,
    chats: Vec<Chat>,
    deleted: HashSet<ChatId>,
}

impl ChatRoster {
    /// Create an empty roster for the session user.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            chats: Vec::new(),
            deleted: HashSet::new(),
        }
    }

    /// The session user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Replace the roster with a fetched list.
    ///
    /// Chats the user does not participate in are dropped.
    pub fn load(&mut self, chats: Vec<Chat>) -> &[Chat] {
        self.deleted.clear();
        self.chats = chats
            .into_iter()
            .map(Chat::normalized)
            .filter(|chat| chat.has_participant(&self.user_id))
            .collect();
        self.chats.sort_by_key(|c| (c.created_at, c.id));
        self.chats.dedup_by_key(|c| c.id);
        &self.chats
    }

    /// Merge a chat event. Returns true if the roster changed.
    pub fn apply_event(&mut self, event: ChangeEvent<Chat>) -> bool {
        match event {
            ChangeEvent::Insert(chat) | ChangeEvent::Update(chat) => {
                if self.deleted.contains(&chat.id) {
                    return false;
                }
                let chat = chat.normalized();
                let position = self.chats.iter().position(|c| c.id == chat.id);

                if !chat.has_participant(&self.user_id) {
                    return match position {
                        Some(index) => {
                            self.chats.remove(index);
                            true
                        }
                        None => false,
                    };
                }

                match position {
                    Some(index) if self.chats[index] == chat => false,
                    Some(index) => {
                        self.chats[index] = chat;
                        self.chats.sort_by_key(|c| (c.created_at, c.id));
                        true
                    }
                    None => {
                        self.chats.push(chat);
                        self.chats.sort_by_key(|c| (c.created_at, c.id));
                        true
                    }
                }
            }
            ChangeEvent::Delete(id) => {
                self.deleted.insert(id);
                let before = self.chats.len();
                self.chats.retain(|c| c.id != id);
                self.chats.len() != before
            }
        }
    }

    /// All chats, ordered.
    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    /// Look up a chat by id.
    pub fn get(&self, id: &ChatId) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == *id)
    }

    /// Check if the roster contains a chat.
    pub fn contains(&self, id: &ChatId) -> bool {
        self.get(id).is_some()
    }

    /// Everyone the user chats with, excluding the user.
    pub fn participant_ids(&self) -> BTreeSet<UserId> {
        self.chats
            .iter()
            .flat_map(|c| c.others(&self.user_id).copied().collect::<Vec<_>>())
            .collect()
    }

    /// Display name of a chat from this user's point of view.
    pub fn display_name(&self, chat: &Chat, profiles: &HashMap<UserId, Profile>) -> String {
        display_name(chat, &self.user_id, profiles)
    }
}

/// Display name of a chat from `me`'s point of view.
///
/// - An explicit, non-blank name wins.
/// - A one-to-one chat shows the other participant's username, or the
///   placeholder username if it is not resolved.
/// - A group chat lists up to three resolved usernames of the other
///   participants in join order, with `+N` for the rest, or
///   [`GROUP_FALLBACK_NAME`] when none are resolved.
pub fn display_name(chat: &Chat, me: &UserId, profiles: &HashMap<UserId, Profile>) -> String {
    if let Some(name) = chat.explicit_name() {
        return name.to_string();
    }

    if !chat.is_group {
        return chat
            .others(me)
            .next()
            .and_then(|id| profiles.get(id))
            .map(|p| p.username.clone())
            .unwrap_or_else(|| Profile::UNKNOWN_USERNAME.to_string());
    }

    let names: Vec<&str> = chat
        .others(me)
        .filter_map(|id| profiles.get(id))
        .filter(|p| !p.is_placeholder())
        .map(|p| p.username.as_str())
        .collect();

    match names.len() {
        0 => GROUP_FALLBACK_NAME.to_string(),
        n if n <= GROUP_LABEL_NAMES => names.join(", "),
        n => format!(
            "{} +{}",
            names[..GROUP_LABEL_NAMES].join(", "),
            n - GROUP_LABEL_NAMES
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn chat(participants: Vec<UserId>, is_group: bool, secs: i64) -> Chat {
        Chat {
            id: ChatId::new(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            name: None,
            is_group,
            participants,
        }
    }

    fn profile(id: UserId, name: &str) -> Profile {
        Profile {
            id,
            username: name.into(),
            avatar_url: None,
            created_at: Utc::now(),
        }
    }

    fn profiles(entries: &[(UserId, &str)]) -> HashMap<UserId, Profile> {
        entries
            .iter()
            .map(|(id, name)| (*id, profile(*id, name)))
            .collect()
    }

    #[test]
    fn load_filters_by_membership_and_orders() {
        let me = UserId::new();
        let mut roster = ChatRoster::new(me);
        let later = chat(vec![me, UserId::new()], false, 20);
        let earlier = chat(vec![UserId::new(), me], false, 10);
        let foreign = chat(vec![UserId::new(), UserId::new()], false, 5);

        let loaded = roster.load(vec![later.clone(), foreign, earlier.clone()]);

        let ids: Vec<_> = loaded.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
    }

    #[test]
    fn removal_from_participants_drops_chat() {
        let me = UserId::new();
        let other = UserId::new();
        let mut roster = ChatRoster::new(me);
        let mut c = chat(vec![me, other], false, 0);
        roster.load(vec![c.clone()]);

        c.participants = vec![other];
        assert!(roster.apply_event(ChangeEvent::Update(c.clone())));
        assert!(!roster.contains(&c.id));
    }

    #[test]
    fn addition_to_participants_adds_chat() {
        let me = UserId::new();
        let mut roster = ChatRoster::new(me);
        let c = chat(vec![UserId::new(), me], true, 0);

        assert!(roster.apply_event(ChangeEvent::Insert(c.clone())));
        assert!(!roster.apply_event(ChangeEvent::Insert(c.clone())));
        assert!(roster.contains(&c.id));
    }

    #[test]
    fn foreign_chat_events_are_ignored() {
        let mut roster = ChatRoster::new(UserId::new());
        let c = chat(vec![UserId::new()], false, 0);

        assert!(!roster.apply_event(ChangeEvent::Insert(c)));
        assert!(roster.chats().is_empty());
    }

    #[test]
    fn deleted_chat_is_not_resurrected() {
        let me = UserId::new();
        let mut roster = ChatRoster::new(me);
        let c = chat(vec![me], false, 0);

        assert!(!roster.apply_event(ChangeEvent::Delete(c.id)));
        assert!(!roster.apply_event(ChangeEvent::Insert(c.clone())));
        assert!(roster.chats().is_empty());
    }

    #[test]
    fn participant_ids_exclude_self() {
        let me = UserId::new();
        let (a, b) = (UserId::new(), UserId::new());
        let mut roster = ChatRoster::new(me);
        roster.load(vec![chat(vec![me, a], false, 0), chat(vec![me, a, b], true, 1)]);

        assert_eq!(roster.participant_ids(), [a, b].into_iter().collect());
    }

    #[test]
    fn explicit_name_wins() {
        let me = UserId::new();
        let mut c = chat(vec![me, UserId::new()], true, 0);
        c.name = Some("Design Team".into());

        assert_eq!(display_name(&c, &me, &HashMap::new()), "Design Team");
    }

    #[test]
    fn direct_chat_shows_other_username() {
        let me = UserId::new();
        let bob = UserId::new();
        let c = chat(vec![me, bob], false, 0);

        let names = profiles(&[(me, "me"), (bob, "bob")]);
        assert_eq!(display_name(&c, &me, &names), "bob");
        assert_eq!(display_name(&c, &me, &HashMap::new()), "Unknown User");
    }

    #[test]
    fn group_without_name_lists_resolved_usernames() {
        let me = UserId::new();
        let ids: Vec<_> = (0..5).map(|_| UserId::new()).collect();
        let mut participants = vec![me];
        participants.extend(ids.iter().copied());
        let c = chat(participants, true, 0);

        let two = profiles(&[(ids[0], "ann"), (ids[1], "bob")]);
        assert_eq!(display_name(&c, &me, &two), "ann, bob");

        let five = profiles(&[
            (ids[0], "ann"),
            (ids[1], "bob"),
            (ids[2], "cid"),
            (ids[3], "dee"),
            (ids[4], "eve"),
        ]);
        assert_eq!(display_name(&c, &me, &five), "ann, bob, cid +2");
    }

    #[test]
    fn group_with_blank_name_and_no_profiles_falls_back() {
        let me = UserId::new();
        let other = UserId::new();
        let mut c = chat(vec![me, other], true, 0);
        c.name = Some("  ".into());

        let mut names = HashMap::new();
        names.insert(other, Profile::unknown(other));
        assert_eq!(display_name(&c, &me, &names), GROUP_FALLBACK_NAME);
    }
}
