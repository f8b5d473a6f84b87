//! Collaborator abstraction for chatsync.
//!
//! The engine talks to four collaborators, each behind an async trait:
//! - [`Backend`] reads and writes rows
//! - [`ChangeFeed`] pushes row changes and relays broadcasts
//! - [`BlobStorage`] stores attachment files
//! - [`SessionProvider`] reports who is signed in
//!
//! Rows travel as untyped JSON (`serde_json::Value`) so the traits stay
//! independent of the hosted service; typed decoding happens in the engine.
//!
//! # Example
//!
//! ```ignore
//! let backend = MockBackend::new();
//! let rows = backend
//!     .select(Table::Messages, &[Filter::eq("chat_id", chat_id)])
//!     .await?;
//! ```

mod mock;

pub use mock::MockBackend;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use chatsync_types::{ChangeOp, Table, UserId};

/// Collaborator errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The request was rejected or could not be delivered.
    #[error("request failed: {0}")]
    Request(String),

    /// A row or object did not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The subscription or connection is closed.
    #[error("connection closed")]
    Closed,

    /// Request timeout.
    #[error("request timeout")]
    Timeout,
}

/// Row predicate understood by the collaborator.
///
/// The same predicate is re-checked client-side on change events, since a
/// server-side mask may be coarser than requested.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`.
    Eq {
        /// Column name.
        column: String,
        /// Expected value.
        value: Value,
    },
    /// `column in values`.
    In {
        /// Column name.
        column: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Array column contains `value`.
    Contains {
        /// Column name.
        column: String,
        /// Element that must be present.
        value: Value,
    },
}

fn to_json<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Filter {
    /// Equality filter.
    pub fn eq(column: &str, value: impl Serialize) -> Self {
        Filter::Eq {
            column: column.to_string(),
            value: to_json(value),
        }
    }

    /// Membership filter.
    pub fn is_in<T: Serialize>(column: &str, values: impl IntoIterator<Item = T>) -> Self {
        Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(to_json).collect(),
        }
    }

    /// Array containment filter.
    pub fn contains(column: &str, value: impl Serialize) -> Self {
        Filter::Contains {
            column: column.to_string(),
            value: to_json(value),
        }
    }

    /// Check a record against this filter.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Filter::Eq { column, value } => record.get(column) == Some(value),
            Filter::In { column, values } => record
                .get(column)
                .is_some_and(|field| values.contains(field)),
            Filter::Contains { column, value } => record
                .get(column)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Check a record against every filter.
pub fn matches_all(filters: &[Filter], record: &Value) -> bool {
    filters.iter().all(|f| f.matches(record))
}

/// Identifies one change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One item pushed by the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// A row changed (or a broadcast was relayed as an insert).
    Change {
        /// Kind of change.
        op: ChangeOp,
        /// Collection.
        table: Table,
        /// Full row, or at least its id for deletes.
        record: Value,
    },
    /// The transport dropped; no further items follow.
    Lost {
        /// Transport error message.
        reason: String,
    },
}

/// An open subscription: its handle plus the receiving end of the feed.
#[derive(Debug)]
pub struct FeedSubscription {
    /// Handle for `unsubscribe`.
    pub handle: SubscriptionHandle,
    /// Items in emission order.
    pub receiver: mpsc::Receiver<FeedItem>,
}

/// Row storage (select / insert / update).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch all rows of `table` matching every filter.
    async fn select(&self, table: Table, filters: &[Filter]) -> Result<Vec<Value>, BackendError>;

    /// Insert a row and return it as stored (with server-assigned id).
    async fn insert(&self, table: Table, record: Value) -> Result<Value, BackendError>;

    /// Merge `patch` into every matching row and return the updated rows.
    async fn update(
        &self,
        table: Table,
        filters: &[Filter],
        patch: Value,
    ) -> Result<Vec<Value>, BackendError>;

    /// Add `values` to the array column `column` of every matching row,
    /// skipping elements already present, and return the updated rows.
    ///
    /// The union happens in the store, so concurrent appends are all kept.
    async fn append_unique(
        &self,
        table: Table,
        filters: &[Filter],
        column: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Value>, BackendError>;
}

/// Realtime change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes of `table` matching every filter.
    ///
    /// `buffer` bounds the number of undelivered items.
    async fn subscribe(
        &self,
        table: Table,
        filters: &[Filter],
        buffer: usize,
    ) -> Result<FeedSubscription, BackendError>;

    /// Release a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError>;

    /// Relay an ephemeral record to other subscribers of `table`.
    ///
    /// Broadcasts are never persisted.
    async fn broadcast(&self, table: Table, record: Value) -> Result<(), BackendError>;
}

/// Attachment file storage.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` at `path` inside `bucket`.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError>;

    /// Public URL of a stored object.
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Authentication state.
pub trait SessionProvider: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<UserId>;

    /// Observe sign-in and sign-out.
    fn watch(&self) -> watch::Receiver<Option<UserId>>;
}

/// The set of collaborators an engine runs against.
#[derive(Clone)]
pub struct Collaborators {
    /// Row storage.
    pub backend: Arc<dyn Backend>,
    /// Change notifications.
    pub feed: Arc<dyn ChangeFeed>,
    /// Attachment storage.
    pub storage: Arc<dyn BlobStorage>,
    /// Authentication state.
    pub session: Arc<dyn SessionProvider>,
}

impl Collaborators {
    /// Use one object for all four roles.
    pub fn single<C>(collaborator: C) -> Self
    where
        C: Backend + ChangeFeed + BlobStorage + SessionProvider + 'static,
    {
        let shared = Arc::new(collaborator);
        Self {
            backend: shared.clone(),
            feed: shared.clone(),
            storage: shared.clone(),
            session: shared,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_types::ChatId;
    use serde_json::json;

    #[test]
    fn eq_filter_matches_serialized_id() {
        let chat_id = ChatId::new();
        let filter = Filter::eq("chat_id", chat_id);

        assert!(filter.matches(&json!({ "chat_id": chat_id.to_string() })));
        assert!(!filter.matches(&json!({ "chat_id": ChatId::new() })));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn in_filter_checks_membership() {
        let (a, b) = (UserId::new(), UserId::new());
        let filter = Filter::is_in("id", [a, b]);

        assert!(filter.matches(&json!({ "id": a })));
        assert!(!filter.matches(&json!({ "id": UserId::new() })));
    }

    #[test]
    fn contains_filter_needs_array() {
        let me = UserId::new();
        let filter = Filter::contains("participants", me);

        assert!(filter.matches(&json!({ "participants": [UserId::new(), me] })));
        assert!(!filter.matches(&json!({ "participants": me })));
        assert!(!filter.matches(&json!({ "participants": null })));
    }

    #[test]
    fn matches_all_requires_every_filter() {
        let filters = vec![Filter::eq("a", 1), Filter::eq("b", 2)];
        assert!(matches_all(&filters, &json!({ "a": 1, "b": 2 })));
        assert!(!matches_all(&filters, &json!({ "a": 1, "b": 3 })));
        assert!(matches_all(&[], &json!({})));
    }
}
