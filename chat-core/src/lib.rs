//! # chatsync-core
//!
//! Pure logic for chatsync (no I/O, instant tests).
//!
//! This crate implements the merge rules and the selection state machine
//! without any network access, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`MessageStore`] merges change events idempotently and keeps the window
//!   sorted by `(created_at, id)`
//! - [`ChatRoster`] keeps the membership-filtered chat list
//! - [`TypingTracker`] answers "who is typing" for a point in time
//! - [`SelectionState`] turns lifecycle events into actions
//!
//! The actual I/O is performed by `chatsync-client`, which interprets the
//! actions produced by the state machine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod roster;
pub mod state;
pub mod typing;

pub use messages::{DeliveryStatus, MessageStore, StoredMessage, HELD_EVENTS_CAPACITY};
pub use roster::{display_name, ChatRoster, GROUP_FALLBACK_NAME};
pub use state::{Action, EngineEvent, Event, ResyncPolicy, SelectionState};
pub use typing::{TypingTracker, DEFAULT_TYPING_CAPACITY, DEFAULT_TYPING_WINDOW};
