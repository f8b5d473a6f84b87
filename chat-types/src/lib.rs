//! # chatsync-types
//!
//! Data model for the chatsync realtime chat synchronization engine.
//!
//! This crate provides the foundational types used across all chatsync crates:
//! - [`UserId`], [`ChatId`], [`MessageId`], [`ReactionId`], [`PendingId`] - Identity types
//! - [`Profile`], [`Chat`], [`Message`], [`Reaction`], [`TypingIndicator`] - Entities
//! - [`ChangeEvent`] - Typed insert/update/delete notifications decoded from
//!   collaborator records
//! - [`SyncError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod change;
mod error;
mod ids;
mod model;

pub use change::{ChangeEvent, ChangeOp, Entity, Table};
pub use error::{ErrorKind, SyncError};
pub use ids::{ChatId, MessageId, PendingId, ReactionId, UserId};
pub use model::{Chat, Message, MessageDraft, Profile, Reaction, TypingIndicator};
