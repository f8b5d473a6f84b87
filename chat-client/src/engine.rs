//! SyncEngine - the main interface for chatsync.
//!
//! This module provides [`SyncEngine`], the API applications use to show a
//! live chat list, a live message window and typing presence.
//!
//! # Architecture
//!
//! SyncEngine uses the pure selection state machine (from chatsync-core)
//! for lifecycle logic and interprets its actions to perform actual I/O
//! via the collaborator traits.
//!
//! ```text
//! Application → SyncEngine → Backend / ChangeFeed / BlobStorage
//!                   ↓
//!             chatsync-core (pure merge rules + state machine)
//! ```
//!
//! All mutable state lives in one `EngineState` behind a mutex that is
//! never held across an `.await`. Stream pumps are tokio tasks tagged with
//! the epoch of the subscribe/fetch cycle that started them; a pump whose
//! epoch is no longer current stops without touching state.
//!
//! # Example
//!
//! ```ignore
//! use chatsync_client::{Collaborators, EngineConfig, MockBackend, SyncEngine};
//!
//! let engine = SyncEngine::new(Collaborators::single(MockBackend::new()), EngineConfig::default());
//! engine.init(user_id).await?;
//! engine.select_chat(chat_id).await?;
//! engine.send_message("hello").await?;
//!
//! let mut snapshots = engine.subscribe();
//! snapshots.changed().await?;
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chatsync_core::{
    Action, ChatRoster, EngineEvent, Event, MessageStore, ResyncPolicy, SelectionState,
    TypingTracker,
};
use chatsync_types::{
    ChangeEvent, Chat, ChatId, Message, MessageDraft, MessageId, PendingId, Profile, Reaction,
    SyncError, Table, TypingIndicator, UserId,
};

use crate::backend::{BackendError, Collaborators, Filter, SubscriptionHandle};
use crate::config::EngineConfig;
use crate::identity::IdentityCache;
use crate::observable::{ChatView, EngineSnapshot, Observable};
use crate::stream::{ChangeStream, StreamItem};

/// Capacity of the engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A file to attach to a message.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Original file name; becomes the message content.
    pub name: String,
    /// File contents.
    pub bytes: Vec<u8>,
    /// MIME type.
    pub content_type: String,
}

impl Attachment {
    /// Create an attachment.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes,
            content_type: content_type.into(),
        }
    }

    /// File extension used for the storage path (`bin` if none).
    pub fn extension(&self) -> &str {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .unwrap_or("bin")
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("name", &self.name)
            .field("bytes", &format!("[{} bytes]", self.bytes.len()))
            .field("content_type", &self.content_type)
            .finish()
    }
}

struct EngineState {
    user_id: Option<UserId>,
    roster: Option<ChatRoster>,
    selection: SelectionState,
    window: Option<MessageStore>,
    typing: TypingTracker,
    /// Pumps and handles of the current selection cycle.
    pumps: Vec<JoinHandle<()>>,
    handles: Vec<SubscriptionHandle>,
    resync_timer: Option<JoinHandle<()>>,
    /// Pumps and handles of the signed-in session (roster, profiles).
    session_pumps: Vec<JoinHandle<()>>,
    session_handles: Vec<SubscriptionHandle>,
    session_epoch: u64,
    session_watcher: Option<JoinHandle<()>>,
}

struct EngineInner {
    collab: Collaborators,
    config: EngineConfig,
    policy: ResyncPolicy,
    identity: IdentityCache,
    state: Mutex<EngineState>,
    observable: Observable,
    events: broadcast::Sender<EngineEvent>,
    epochs: AtomicU64,
}

/// The chat synchronization engine.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine over a set of collaborators.
    pub fn new(collab: Collaborators, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = EngineState {
            user_id: None,
            roster: None,
            selection: SelectionState::new(),
            window: None,
            typing: TypingTracker::new(config.typing_window(), config.typing.capacity),
            pumps: Vec::new(),
            handles: Vec::new(),
            resync_timer: None,
            session_pumps: Vec::new(),
            session_handles: Vec::new(),
            session_epoch: 0,
            session_watcher: None,
        };
        Self {
            inner: Arc::new(EngineInner {
                identity: IdentityCache::new(collab.backend.clone()),
                policy: config.resync_policy(),
                collab,
                config,
                state: Mutex::new(state),
                observable: Observable::new(),
                events,
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Observe engine snapshots.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.inner.observable.subscribe()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.observable.current()
    }

    /// Observe lifecycle events (selection, resync, failures).
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// The profile cache.
    pub fn identity(&self) -> &IdentityCache {
        &self.inner.identity
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Follow the session provider: sign-in runs `init`, sign-out `teardown`.
    pub fn attach_session(&self) {
        let engine = self.clone();
        let mut session = self.inner.collab.session.watch();

        let watcher = tokio::spawn(async move {
            loop {
                let user = *session.borrow_and_update();
                match user {
                    Some(user_id) => {
                        if let Err(e) = engine.init(user_id).await {
                            error!(user = %user_id, error = %e, "Session init failed");
                        }
                    }
                    None => engine.teardown().await,
                }
                if session.changed().await.is_err() {
                    break;
                }
            }
        });

        if let Some(old) = self.inner.lock().session_watcher.replace(watcher) {
            old.abort();
        }
    }

    /// Start a session: load the roster and subscribe to chat and profile
    /// changes. A session for another user is torn down first.
    pub async fn init(&self, user_id: UserId) -> Result<(), SyncError> {
        let current = self.inner.lock().user_id;
        match current {
            Some(existing) if existing == user_id => return Ok(()),
            Some(_) => self.teardown().await,
            None => {}
        }

        let session = {
            let mut state = self.inner.lock();
            state.user_id = Some(user_id);
            state.roster = Some(ChatRoster::new(user_id));
            state.session_epoch += 1;
            self.inner.publish(&state);
            state.session_epoch
        };
        info!(user = %user_id, "Session started");

        let result = self.inner.start_session(session).await;
        if let Err(e) = &result {
            // Leave no half-started session behind, so init can be retried
            let mut state = self.inner.lock();
            if state.session_epoch == session {
                state.session_epoch += 1;
                state.user_id = None;
                state.roster = None;
                self.inner.publish(&state);
                warn!(user = %user_id, error = %e, "Session start failed");
            }
        }
        result
    }

    /// End the session: deselect, close every stream, forget the roster and
    /// all cached profiles.
    pub async fn teardown(&self) {
        self.inner.dispatch(None, Event::DeselectRequested).await;

        let (released, user) = {
            let mut state = self.inner.lock();
            for pump in state.session_pumps.drain(..) {
                pump.abort();
            }
            let released = std::mem::take(&mut state.session_handles);
            if let Some(timer) = state.resync_timer.take() {
                timer.abort();
            }
            state.session_epoch += 1;
            state.roster = None;
            state.typing = TypingTracker::new(
                self.inner.config.typing_window(),
                self.inner.config.typing.capacity,
            );
            (released, state.user_id.take())
        };
        self.inner.release(released).await;
        self.inner.identity.clear();
        self.inner.republish();

        if let Some(user_id) = user {
            info!(user = %user_id, "Session ended");
        }
    }

    /// Stop following the session provider and tear down.
    pub async fn shutdown(&self) {
        let watcher = self.inner.lock().session_watcher.take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.teardown().await;
    }

    /// Refetch the roster and resolve every participant.
    pub async fn refresh_roster(&self) -> Result<(), SyncError> {
        self.inner.refresh_roster().await
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Select a chat: load its messages, resolve participants and authors,
    /// and stream changes until deselected.
    ///
    /// Returns the load error if the selection ended up in the error state.
    pub async fn select_chat(&self, chat_id: ChatId) -> Result<(), SyncError> {
        if self.inner.lock().user_id.is_none() {
            return Err(SyncError::NotAuthenticated);
        }

        let epoch = self.inner.next_epoch();
        self.inner
            .dispatch(None, Event::SelectRequested { chat_id, epoch })
            .await;

        let state = self.inner.lock();
        match &state.selection {
            SelectionState::Error { chat_id: failed, error } if *failed == chat_id => {
                Err(error.clone())
            }
            _ => Ok(()),
        }
    }

    /// Clear the selection. Streams are closed before this returns; the
    /// roster and profile cache are kept.
    pub async fn deselect(&self) {
        self.inner.dispatch(None, Event::DeselectRequested).await;
    }

    // =========================================================================
    // Commands on the selected chat
    // =========================================================================

    /// Send a text message to the selected chat.
    ///
    /// The message shows up immediately as pending. On failure it stays in
    /// the window flagged failed and the error is returned.
    pub async fn send_message(&self, content: &str) -> Result<MessageId, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let (pending, draft) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let user_id = state.user_id.ok_or(SyncError::NotAuthenticated)?;
            let window = state.window.as_mut().ok_or(SyncError::NoChatSelected)?;
            let chat_id = window.chat_id();

            let draft = MessageDraft::text(chat_id, user_id, content);
            let pending = window.append_optimistic(draft.clone());
            state.typing.clear(&chat_id, &user_id);
            self.inner.publish(state);
            (pending, draft)
        };

        self.inner.deliver(pending, draft).await
    }

    /// Resend a failed message.
    pub async fn retry_message(&self, pending: PendingId) -> Result<MessageId, SyncError> {
        let draft = {
            let mut state = self.inner.lock();
            let draft = state
                .window
                .as_mut()
                .and_then(|window| window.retry(pending))
                .ok_or_else(|| SyncError::UnknownMessage(pending.to_string()))?;
            self.inner.publish(&state);
            draft
        };
        info!(pending = %pending, "Retrying message");

        self.inner.deliver(pending, draft).await
    }

    /// Remove a failed message from the window.
    pub fn discard_message(&self, pending: PendingId) -> Result<(), SyncError> {
        let mut state = self.inner.lock();
        let discarded = state
            .window
            .as_mut()
            .is_some_and(|window| window.discard(pending));
        if !discarded {
            return Err(SyncError::UnknownMessage(pending.to_string()));
        }
        self.inner.publish(&state);
        Ok(())
    }

    /// Upload a file and send it as a message to the selected chat.
    ///
    /// The file goes to `{chat_id}/{uuid}.{ext}` in the configured bucket.
    /// If the upload fails no message is created.
    pub async fn upload_attachment(&self, attachment: Attachment) -> Result<MessageId, SyncError> {
        let (chat_id, user_id) = self.inner.selected()?;
        let storage = &self.inner.collab.storage;
        let bucket = &self.inner.config.storage.bucket;
        let path = format!("{}/{}.{}", chat_id, uuid::Uuid::new_v4(), attachment.extension());

        debug!(path = %path, size = attachment.bytes.len(), "Uploading attachment");
        if let Err(e) = storage
            .upload(bucket, &path, attachment.bytes, &attachment.content_type)
            .await
        {
            warn!(path = %path, error = %e, "Attachment upload failed");
            return Err(SyncError::UploadFailed {
                path,
                reason: e.to_string(),
            });
        }
        let url = storage.public_url(bucket, &path);

        let draft =
            MessageDraft::text(chat_id, user_id, attachment.name).with_file(url, attachment.content_type);
        let pending = {
            let mut state = self.inner.lock();
            let window = state
                .window
                .as_mut()
                .filter(|window| window.chat_id() == chat_id)
                .ok_or(SyncError::NoChatSelected)?;
            let pending = window.append_optimistic(draft.clone());
            self.inner.publish(&state);
            pending
        };

        self.inner.deliver(pending, draft).await
    }

    /// Signal that the session user is typing in the selected chat.
    ///
    /// The broadcast is best-effort; its failure is not reported.
    pub async fn set_typing(&self) -> Result<(), SyncError> {
        let (chat_id, user_id) = self.inner.selected()?;
        let indicator = TypingIndicator {
            user_id,
            chat_id,
            timestamp: Utc::now(),
        };
        {
            let mut state = self.inner.lock();
            state.typing.set_typing(chat_id, user_id, indicator.timestamp);
        }

        let record = serde_json::to_value(&indicator).map_err(|e| SyncError::InvalidRecord {
            table: Table::TypingIndicators,
            reason: e.to_string(),
        })?;
        if let Err(e) = self
            .inner
            .collab
            .feed
            .broadcast(Table::TypingIndicators, record)
            .await
        {
            debug!(chat = %chat_id, error = %e, "Typing broadcast failed");
        }
        Ok(())
    }

    /// React to a message. Reacting twice with the same emoji is a no-op.
    pub async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> Result<(), SyncError> {
        let (_, user_id) = self.inner.selected()?;
        {
            let state = self.inner.lock();
            let message = state.confirmed_message(&message_id)?;
            if message.has_reaction(&user_id, emoji) {
                return Ok(());
            }
        }

        let row = self
            .inner
            .collab
            .backend
            .insert(
                Table::MessageReactions,
                Reaction::insert_record(message_id, user_id, emoji),
            )
            .await
            .map_err(|e| mutation_failed(Table::MessageReactions, e))?;
        let reaction: Reaction =
            serde_json::from_value(row).map_err(|e| SyncError::InvalidRecord {
                table: Table::MessageReactions,
                reason: e.to_string(),
            })?;

        let mut state = self.inner.lock();
        if let Some(window) = state.window.as_mut() {
            window.apply_reaction(ChangeEvent::Insert(reaction));
        }
        self.inner.publish(&state);
        Ok(())
    }

    /// Mark a message as read by the session user. Idempotent.
    ///
    /// The reader is appended in the store, so readers this client has not
    /// seen yet are kept.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), SyncError> {
        let (_, user_id) = self.inner.selected()?;
        {
            let state = self.inner.lock();
            if state.confirmed_message(&message_id)?.read_by.contains(&user_id) {
                return Ok(());
            }
        }

        let rows = self
            .inner
            .collab
            .backend
            .append_unique(
                Table::Messages,
                &[Filter::eq("id", message_id)],
                "read_by",
                vec![json!(user_id)],
            )
            .await
            .map_err(|e| mutation_failed(Table::Messages, e))?;

        let mut state = self.inner.lock();
        if let Some(window) = state.window.as_mut() {
            for message in decode_rows::<Message>(Table::Messages, rows) {
                window.apply_event(ChangeEvent::Update(message));
            }
        }
        self.inner.publish(&state);
        Ok(())
    }
}

impl EngineState {
    fn confirmed_message(&self, id: &MessageId) -> Result<&Message, SyncError> {
        self.window
            .as_ref()
            .and_then(|window| window.get(id))
            .filter(|entry| entry.is_confirmed())
            .map(|entry| &entry.message)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The selected chat and the session user.
    fn selected(&self) -> Result<(ChatId, UserId), SyncError> {
        let state = self.lock();
        let user_id = state.user_id.ok_or(SyncError::NotAuthenticated)?;
        let chat_id = state
            .window
            .as_ref()
            .map(MessageStore::chat_id)
            .ok_or(SyncError::NoChatSelected)?;
        Ok((chat_id, user_id))
    }

    /// Build and publish a snapshot of `state`.
    fn publish(&self, state: &EngineState) {
        let profiles = self.identity.snapshot();
        let chats = state
            .roster
            .as_ref()
            .map(|roster| {
                roster
                    .chats()
                    .iter()
                    .map(|chat| ChatView {
                        display_name: roster.display_name(chat, &profiles),
                        chat: chat.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let selected_chat = state.selection.chat_id();
        let messages = state
            .window
            .as_ref()
            .map(|window| window.messages().into_iter().cloned().collect())
            .unwrap_or_default();
        let typing_users = selected_chat
            .map(|chat_id| {
                state
                    .typing
                    .get(&chat_id, Utc::now())
                    .into_iter()
                    .filter(|user| Some(*user) != state.user_id)
                    .collect()
            })
            .unwrap_or_default();

        self.observable.publish(EngineSnapshot {
            user_id: state.user_id,
            chats,
            selected_chat,
            selection: (&state.selection).into(),
            messages,
            typing_users,
            profiles,
        });
    }

    fn republish(&self) {
        let state = self.lock();
        self.publish(&state);
    }

    /// Run `f` if `epoch` is still the current selection cycle.
    fn with_epoch<R>(&self, epoch: u64, f: impl FnOnce(&mut EngineState) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.selection.epoch() != Some(epoch) {
            return None;
        }
        let result = f(&mut state);
        self.publish(&state);
        Some(result)
    }

    /// Run `f` if `session` is still the current session.
    fn with_session<R>(&self, session: u64, f: impl FnOnce(&mut EngineState) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.session_epoch != session {
            return None;
        }
        let result = f(&mut state);
        self.publish(&state);
        Some(result)
    }

    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::Selected { chat_id } => info!(chat = %chat_id, "Chat selected"),
            EngineEvent::Live { chat_id } => info!(chat = %chat_id, "Chat live"),
            EngineEvent::Deselected { chat_id } => info!(chat = %chat_id, "Chat deselected"),
            EngineEvent::Resyncing {
                chat_id,
                attempt,
                reason,
            } => warn!(chat = %chat_id, attempt, reason = %reason, "Resyncing chat"),
            EngineEvent::ResyncFailed {
                chat_id,
                attempt,
                error,
            } => warn!(chat = %chat_id, attempt, error = %error, "Resync attempt failed"),
            EngineEvent::Resynced { chat_id } => info!(chat = %chat_id, "Chat resynced"),
            EngineEvent::SelectionFailed { chat_id, error } => {
                error!(chat = %chat_id, error = %error, "Chat load failed")
            }
        }
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn release(&self, handles: Vec<SubscriptionHandle>) {
        for handle in handles {
            if let Err(e) = self.collab.feed.unsubscribe(handle).await {
                debug!(handle = %handle, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Feed one event into the selection state machine and run the actions,
    /// looping until no follow-up event is produced.
    ///
    /// With `guard` set, the event is dropped unless that epoch is current.
    fn dispatch(self: &Arc<Self>, guard: Option<u64>, event: Event) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        async move {
            let mut guard = guard;
            let mut queue = VecDeque::from([event]);

            while let Some(event) = queue.pop_front() {
                let (work, released) = {
                    let mut state = inner.lock();
                    if let Some(epoch) = guard.take() {
                        if state.selection.epoch() != Some(epoch) {
                            debug!(epoch, "Dropping event for stale cycle");
                            return;
                        }
                    }

                    let current = std::mem::take(&mut state.selection);
                    let (next, actions) = current.on_event(event, &inner.policy);
                    state.selection = next;

                    let mut work = Vec::new();
                    let mut released = Vec::new();
                    for action in actions {
                        match action {
                            Action::Unsubscribe => {
                                for pump in state.pumps.drain(..) {
                                    pump.abort();
                                }
                                released.append(&mut state.handles);
                            }
                            Action::DiscardWindow => {
                                if let Some(window) = state.window.take() {
                                    state.typing.clear_chat(&window.chat_id());
                                }
                            }
                            Action::CancelResyncTimer => {
                                if let Some(timer) = state.resync_timer.take() {
                                    timer.abort();
                                }
                            }
                            Action::EmitEvent(event) => inner.emit(event),
                            Action::Subscribe { chat_id, .. } => {
                                let window = match state.window.take() {
                                    Some(window) if window.chat_id() == chat_id => window,
                                    _ => MessageStore::new(chat_id),
                                };
                                state.window = Some(window);
                                if let Some(window) = state.window.as_mut() {
                                    window.begin_sync();
                                }
                                work.push(action);
                            }
                            Action::FetchMessages { .. } | Action::StartResyncTimer { .. } => {
                                work.push(action)
                            }
                        }
                    }
                    inner.publish(&state);
                    (work, released)
                };

                inner.release(released).await;

                for action in work {
                    match action {
                        Action::Subscribe { chat_id, epoch } => {
                            if let Err(error) = inner.open_streams(chat_id, epoch).await {
                                queue.push_back(Event::LoadFailed { epoch, error });
                                break;
                            }
                        }
                        Action::FetchMessages { chat_id, epoch } => {
                            let event = match inner.load_window(chat_id, epoch).await {
                                Ok(()) => Event::LoadSucceeded { epoch },
                                Err(error) => Event::LoadFailed { epoch, error },
                            };
                            queue.push_back(event);
                        }
                        Action::StartResyncTimer { delay } => inner.arm_resync_timer(delay),
                        _ => {}
                    }
                }
            }
        }
        .boxed()
    }

    fn arm_resync_timer(self: &Arc<Self>, delay: Duration) {
        let mut state = self.lock();
        let Some(epoch) = state.selection.epoch() else {
            return;
        };
        debug!(delay_ms = delay.as_millis() as u64, "Resync timer armed");

        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach before dispatching so a new timer cannot abort this task
            drop(inner.lock().resync_timer.take());
            let next_epoch = inner.next_epoch();
            inner
                .dispatch(Some(epoch), Event::RetryTimer { next_epoch })
                .await;
        });
        if let Some(old) = state.resync_timer.replace(timer) {
            old.abort();
        }
    }

    /// Open message, reaction and typing streams and start their pumps.
    async fn open_streams(self: &Arc<Self>, chat_id: ChatId, epoch: u64) -> Result<(), SyncError> {
        let feed = self.collab.feed.clone();
        let buffer = self.config.feed.buffer;

        let messages = ChangeStream::<Message>::subscribe(
            feed.clone(),
            vec![Filter::eq("chat_id", chat_id)],
            buffer,
        )
        .await?;
        // Reaction rows carry no chat id; the window caps what it holds for unknown messages
        let reactions = match ChangeStream::<Reaction>::subscribe(feed.clone(), vec![], buffer).await
        {
            Ok(stream) => stream,
            Err(e) => {
                messages.unsubscribe().await;
                return Err(e);
            }
        };
        let typing = match ChangeStream::<TypingIndicator>::subscribe(
            feed,
            vec![Filter::eq("chat_id", chat_id)],
            buffer,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                messages.unsubscribe().await;
                reactions.unsubscribe().await;
                return Err(e);
            }
        };

        let stale = {
            let mut state = self.lock();
            if state.selection.epoch() == Some(epoch) {
                state
                    .handles
                    .extend([messages.handle(), reactions.handle(), typing.handle()]);
                state
                    .pumps
                    .push(tokio::spawn(pump_messages(self.clone(), messages, epoch)));
                state
                    .pumps
                    .push(tokio::spawn(pump_reactions(self.clone(), reactions, epoch)));
                state
                    .pumps
                    .push(tokio::spawn(pump_typing(self.clone(), typing, epoch)));
                None
            } else {
                Some((messages, reactions, typing))
            }
        };

        match stale {
            Some((messages, reactions, typing)) => {
                debug!(chat = %chat_id, epoch, "Selection moved on, closing new streams");
                messages.unsubscribe().await;
                reactions.unsubscribe().await;
                typing.unsubscribe().await;
            }
            None => debug!(chat = %chat_id, epoch, "Chat streams open"),
        }
        Ok(())
    }

    /// Fetch the message window, resolve authors and participants, and
    /// install the result if `epoch` is still current.
    async fn load_window(&self, chat_id: ChatId, epoch: u64) -> Result<(), SyncError> {
        if self.lock().selection.epoch() != Some(epoch) {
            return Ok(());
        }

        let backend = &self.collab.backend;
        let rows = backend
            .select(Table::Messages, &[Filter::eq("chat_id", chat_id)])
            .await
            .map_err(|e| fetch_failed(Table::Messages, e))?;
        let mut messages = decode_rows::<Message>(Table::Messages, rows);

        if !messages.is_empty() {
            let rows = backend
                .select(
                    Table::MessageReactions,
                    &[Filter::is_in("message_id", messages.iter().map(|m| m.id))],
                )
                .await
                .map_err(|e| fetch_failed(Table::MessageReactions, e))?;
            let index: HashMap<MessageId, usize> = messages
                .iter()
                .enumerate()
                .map(|(i, m)| (m.id, i))
                .collect();
            for reaction in decode_rows::<Reaction>(Table::MessageReactions, rows) {
                if let Some(&i) = index.get(&reaction.message_id) {
                    messages[i].add_reaction(reaction);
                }
            }
        }

        let mut people: BTreeSet<UserId> = messages.iter().map(|m| m.user_id).collect();
        {
            let state = self.lock();
            if let Some(chat) = state.roster.as_ref().and_then(|r| r.get(&chat_id)) {
                people.extend(chat.participants.iter().copied());
            }
        }
        self.identity.resolve(people).await;

        let count = messages.len();
        let installed = self.with_epoch(epoch, |state| {
            if let Some(window) = state.window.as_mut() {
                window.load(messages);
            }
        });
        if installed.is_some() {
            debug!(chat = %chat_id, count, "Message window loaded");
        }
        Ok(())
    }

    /// Report a dropped stream of the selection cycle `epoch`.
    fn stream_lost(self: &Arc<Self>, epoch: u64, table: Table, reason: String) {
        let error = SyncError::SubscriptionLost { table, reason };
        warn!(epoch, error = %error, "Change stream lost");
        let next_epoch = self.next_epoch();
        tokio::spawn(self.dispatch(
            Some(epoch),
            Event::SubscriptionLost {
                reason: error.to_string(),
                next_epoch,
            },
        ));
    }

    /// Send a draft whose optimistic entry is already in the window.
    async fn deliver(&self, pending: PendingId, draft: MessageDraft) -> Result<MessageId, SyncError> {
        let result = self
            .collab
            .backend
            .insert(Table::Messages, draft.insert_record())
            .await
            .map_err(|e| e.to_string())
            .and_then(|row| serde_json::from_value::<Message>(row).map_err(|e| e.to_string()));

        let outcome = match &result {
            Ok(message) => Ok(message.id),
            Err(reason) => {
                error!(pending = %pending, reason = %reason, "Message send failed");
                Err(SyncError::MutationFailed {
                    table: Table::Messages,
                    reason: reason.clone(),
                })
            }
        };

        let mut state = self.lock();
        if let Some(window) = state
            .window
            .as_mut()
            .filter(|window| window.chat_id() == draft.chat_id)
        {
            window.reconcile(pending, result);
        }
        self.publish(&state);
        outcome
    }

    async fn refresh_roster(&self) -> Result<(), SyncError> {
        let user_id = self.lock().user_id.ok_or(SyncError::NotAuthenticated)?;

        let rows = self
            .collab
            .backend
            .select(Table::Chats, &[Filter::contains("participants", user_id)])
            .await
            .map_err(|e| fetch_failed(Table::Chats, e))?;
        let chats = decode_rows::<Chat>(Table::Chats, rows);

        let mut people: BTreeSet<UserId> = chats
            .iter()
            .flat_map(|chat| chat.participants.iter().copied())
            .collect();
        people.insert(user_id);
        self.identity.resolve(people).await;

        let mut state = self.lock();
        if state.user_id == Some(user_id) {
            if let Some(roster) = state.roster.as_mut() {
                let count = roster.load(chats).len();
                debug!(user = %user_id, count, "Roster loaded");
            }
        }
        self.publish(&state);
        Ok(())
    }

    /// Subscribe to chat and profile changes, load the roster, then start
    /// the session pumps. Changes arriving during the load wait in the
    /// stream buffers and are applied on top of it.
    async fn start_session(self: &Arc<Self>, session: u64) -> Result<(), SyncError> {
        let feed = self.collab.feed.clone();
        let buffer = self.config.feed.buffer;

        let chats = ChangeStream::<Chat>::subscribe(feed.clone(), vec![], buffer).await?;
        let profiles = match ChangeStream::<Profile>::subscribe(feed, vec![], buffer).await {
            Ok(stream) => stream,
            Err(e) => {
                chats.unsubscribe().await;
                return Err(e);
            }
        };
        if let Err(e) = self.refresh_roster().await {
            chats.unsubscribe().await;
            profiles.unsubscribe().await;
            return Err(e);
        }

        let stale = {
            let mut state = self.lock();
            if state.session_epoch == session {
                state
                    .session_handles
                    .extend([chats.handle(), profiles.handle()]);
                state
                    .session_pumps
                    .push(tokio::spawn(pump_chats(self.clone(), chats, session)));
                state
                    .session_pumps
                    .push(tokio::spawn(pump_profiles(self.clone(), profiles, session)));
                None
            } else {
                Some((chats, profiles))
            }
        };
        if let Some((chats, profiles)) = stale {
            chats.unsubscribe().await;
            profiles.unsubscribe().await;
        }
        Ok(())
    }

    /// Reopen session streams after a loss, with backoff.
    ///
    /// Starts a new session generation, so a second loss report from the
    /// same generation is a no-op.
    fn recover_session(self: &Arc<Self>, lost: u64) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        async move {
            let (session, released) = {
                let mut state = inner.lock();
                if state.session_epoch != lost {
                    return;
                }
                state.session_epoch += 1;
                for pump in state.session_pumps.drain(..) {
                    pump.abort();
                }
                (state.session_epoch, std::mem::take(&mut state.session_handles))
            };
            inner.release(released).await;

            for attempt in 1..=inner.policy.max_attempts {
                if inner.lock().session_epoch != session {
                    return;
                }
                match inner.start_session(session).await {
                    Ok(()) => {
                        info!(attempt, "Session streams recovered");
                        return;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Session stream recovery failed");
                        tokio::time::sleep(inner.policy.backoff(attempt)).await;
                    }
                }
            }
            error!("Giving up on session streams");
        }
        .boxed()
    }
}

// =============================================================================
// Stream pumps
// =============================================================================

async fn pump_messages(inner: Arc<EngineInner>, mut stream: ChangeStream<Message>, epoch: u64) {
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Change(event) => {
                let author = event.entity().map(|m| m.user_id);
                let changed = inner.with_epoch(epoch, |state| {
                    state
                        .window
                        .as_mut()
                        .is_some_and(|window| window.apply_event(event))
                });
                match changed {
                    None => return,
                    Some(true) => {
                        if let Some(author) = author.filter(|a| !inner.identity.contains(a)) {
                            inner.identity.resolve([author]).await;
                            inner.with_epoch(epoch, |_| ());
                        }
                    }
                    Some(false) => {}
                }
            }
            StreamItem::Resync { reason } => {
                inner.stream_lost(epoch, Table::Messages, reason);
                return;
            }
        }
    }
}

async fn pump_reactions(inner: Arc<EngineInner>, mut stream: ChangeStream<Reaction>, epoch: u64) {
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Change(event) => {
                let applied = inner.with_epoch(epoch, |state| {
                    state
                        .window
                        .as_mut()
                        .is_some_and(|window| window.apply_reaction(event))
                });
                if applied.is_none() {
                    return;
                }
            }
            StreamItem::Resync { reason } => {
                inner.stream_lost(epoch, Table::MessageReactions, reason);
                return;
            }
        }
    }
}

/// Typing signals expire without any event, so an idle stream still
/// refreshes the snapshot once per window.
async fn pump_typing(
    inner: Arc<EngineInner>,
    mut stream: ChangeStream<TypingIndicator>,
    epoch: u64,
) {
    let window = inner.config.typing_window();
    loop {
        let item = match tokio::time::timeout(window, stream.next()).await {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(_) => {
                let swept = inner.with_epoch(epoch, |state| state.typing.sweep(Utc::now()));
                if swept.is_none() {
                    return;
                }
                continue;
            }
        };

        let applied = match item {
            StreamItem::Change(ChangeEvent::Insert(signal) | ChangeEvent::Update(signal)) => inner
                .with_epoch(epoch, |state| {
                    // Arrival time, so remote clock skew cannot extend the window
                    if Some(signal.user_id) != state.user_id {
                        state
                            .typing
                            .set_typing(signal.chat_id, signal.user_id, Utc::now());
                    }
                }),
            StreamItem::Change(ChangeEvent::Delete((chat_id, user_id))) => {
                inner.with_epoch(epoch, |state| {
                    state.typing.clear(&chat_id, &user_id);
                })
            }
            StreamItem::Resync { reason } => {
                inner.stream_lost(epoch, Table::TypingIndicators, reason);
                return;
            }
        };
        if applied.is_none() {
            return;
        }
    }
}

async fn pump_chats(inner: Arc<EngineInner>, mut stream: ChangeStream<Chat>, session: u64) {
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Change(event) => {
                let participants: Vec<UserId> = event
                    .entity()
                    .map(|chat| chat.participants.clone())
                    .unwrap_or_default();
                let changed = inner.with_session(session, |state| {
                    state
                        .roster
                        .as_mut()
                        .is_some_and(|roster| roster.apply_event(event))
                });
                match changed {
                    None => return,
                    Some(true) => {
                        let unknown: Vec<UserId> = participants
                            .into_iter()
                            .filter(|id| !inner.identity.contains(id))
                            .collect();
                        if !unknown.is_empty() {
                            inner.identity.resolve(unknown).await;
                            inner.with_session(session, |_| ());
                        }
                    }
                    Some(false) => {}
                }
            }
            StreamItem::Resync { reason } => {
                warn!(reason = %reason, "Roster stream lost");
                tokio::spawn(inner.recover_session(session));
                return;
            }
        }
    }
}

async fn pump_profiles(inner: Arc<EngineInner>, mut stream: ChangeStream<Profile>, session: u64) {
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Change(ChangeEvent::Insert(profile) | ChangeEvent::Update(profile)) => {
                let current = inner.with_session(session, |_| ());
                if current.is_none() {
                    return;
                }
                inner.identity.insert(profile);
                inner.republish();
            }
            StreamItem::Change(ChangeEvent::Delete(_)) => {}
            StreamItem::Resync { reason } => {
                warn!(reason = %reason, "Profile stream lost");
                tokio::spawn(inner.recover_session(session));
                return;
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fetch_failed(table: Table, error: BackendError) -> SyncError {
    SyncError::FetchFailed {
        table,
        reason: error.to_string(),
    }
}

fn mutation_failed(table: Table, error: BackendError) -> SyncError {
    warn!(table = %table, error = %error, "Mutation failed");
    SyncError::MutationFailed {
        table,
        reason: error.to_string(),
    }
}

/// Decode rows, skipping (and logging) any that do not fit `T`.
fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(table = %table, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn engine() -> (SyncEngine, MockBackend) {
        let mock = MockBackend::new();
        let engine = SyncEngine::new(Collaborators::single(mock.clone()), EngineConfig::default());
        (engine, mock)
    }

    #[test]
    fn attachment_extension() {
        assert_eq!(Attachment::new("cat.PNG", vec![], "image/png").extension(), "PNG");
        assert_eq!(Attachment::new("README", vec![], "text/plain").extension(), "bin");
        assert_eq!(Attachment::new("archive.tar.gz", vec![], "application/gzip").extension(), "gz");
    }

    #[test]
    fn attachment_debug_hides_bytes() {
        let debug = format!("{:?}", Attachment::new("a.txt", vec![0; 10], "text/plain"));
        assert!(debug.contains("[10 bytes]"));
    }

    #[tokio::test]
    async fn commands_need_a_session() {
        let (engine, _) = engine();

        assert_eq!(
            engine.select_chat(ChatId::new()).await,
            Err(SyncError::NotAuthenticated)
        );
        assert_eq!(
            engine.send_message("hi").await,
            Err(SyncError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn commands_need_a_selected_chat() {
        let (engine, _) = engine();
        engine.init(UserId::new()).await.unwrap();

        assert_eq!(engine.send_message("hi").await, Err(SyncError::NoChatSelected));
        assert_eq!(engine.set_typing().await, Err(SyncError::NoChatSelected));
        assert_eq!(
            engine.mark_read(MessageId::new()).await,
            Err(SyncError::NoChatSelected)
        );
    }

    #[tokio::test]
    async fn blank_message_is_rejected_before_anything_else() {
        let (engine, _) = engine();
        assert_eq!(engine.send_message("  \n\t").await, Err(SyncError::EmptyMessage));
    }

    #[tokio::test]
    async fn init_publishes_user() {
        let (engine, _) = engine();
        let user = UserId::new();

        engine.init(user).await.unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.user_id, Some(user));
        assert!(snapshot.chats.is_empty());
    }

    #[tokio::test]
    async fn teardown_closes_session_streams() {
        let (engine, mock) = engine();
        engine.init(UserId::new()).await.unwrap();
        assert_eq!(mock.active_subscriptions(), 2);

        engine.teardown().await;

        assert_eq!(mock.active_subscriptions(), 0);
        assert_eq!(engine.snapshot(), EngineSnapshot::default());
    }

    #[tokio::test]
    async fn discard_unknown_message_fails() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.discard_message(PendingId::new()),
            Err(SyncError::UnknownMessage(_))
        ));
    }
}
