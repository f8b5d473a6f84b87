//! # chatsync-client
//!
//! Client library for the chatsync realtime chat synchronization engine.
//!
//! This is the main library that applications use to show chats.
//!
//! ## Features
//!
//! - **Live Roster**: chats the user belongs to, kept current from change events
//! - **Live Message Window**: ordered, duplicate-free, with optimistic sends
//! - **Typing Presence**: time-windowed, bounded, never blocks the window
//! - **Resync**: dropped streams trigger a refetch with backoff
//! - **Collaborator Abstraction**: pluggable backend, change feed, storage and
//!   session (mock included)
//! - **Pure State Machine**: Uses chatsync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use chatsync_client::{Collaborators, EngineConfig, MockBackend, SyncEngine};
//!
//! let engine = SyncEngine::new(Collaborators::single(MockBackend::new()), EngineConfig::default());
//! engine.attach_session();
//!
//! // Open a chat and send into it
//! engine.select_chat(chat_id).await?;
//! engine.send_message("hello").await?;
//!
//! // Render from snapshots
//! let mut snapshots = engine.subscribe();
//! while snapshots.changed().await.is_ok() {
//!     render(&snapshots.borrow_and_update());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod identity;
pub mod observable;
pub mod stream;

pub use backend::{
    matches_all, Backend, BackendError, BlobStorage, ChangeFeed, Collaborators, FeedItem,
    FeedSubscription, Filter, MockBackend, SessionProvider, SubscriptionHandle,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Attachment, SyncEngine};
pub use identity::IdentityCache;
pub use observable::{ChatView, EngineSnapshot, Observable, SelectionStatus};
pub use stream::{ChangeStream, StreamItem};

// Re-exported so applications need only this crate
pub use chatsync_core::{DeliveryStatus, EngineEvent, StoredMessage};
