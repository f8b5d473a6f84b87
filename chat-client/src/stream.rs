//! Change stream adapter.
//!
//! Turns a raw collaborator subscription into a stream of typed change
//! events for one entity type. Items from one subscription arrive in
//! emission order. A dropped transport surfaces once as
//! [`StreamItem::Resync`]; after that the stream is exhausted and the
//! consumer is expected to refetch.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use chatsync_types::{ChangeEvent, ChangeOp, Entity, SyncError};

use crate::backend::{matches_all, ChangeFeed, FeedItem, Filter, SubscriptionHandle};

/// One item observed on a [`ChangeStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem<T: Entity> {
    /// A decoded change.
    Change(ChangeEvent<T>),
    /// The subscription was lost; a full fetch is needed.
    Resync {
        /// Transport error message.
        reason: String,
    },
}

/// Typed subscription to one collection.
pub struct ChangeStream<T: Entity> {
    feed: Arc<dyn ChangeFeed>,
    handle: SubscriptionHandle,
    receiver: mpsc::Receiver<FeedItem>,
    filters: Vec<Filter>,
    finished: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> ChangeStream<T> {
    /// Subscribe to changes of `T`'s collection matching every filter.
    pub async fn subscribe(
        feed: Arc<dyn ChangeFeed>,
        filters: Vec<Filter>,
        buffer: usize,
    ) -> Result<Self, SyncError> {
        let subscription = feed
            .subscribe(T::TABLE, &filters, buffer)
            .await
            .map_err(|e| SyncError::SubscriptionLost {
                table: T::TABLE,
                reason: e.to_string(),
            })?;

        debug!(table = %T::TABLE, handle = %subscription.handle, "Subscribed");
        Ok(Self {
            feed,
            handle: subscription.handle,
            receiver: subscription.receiver,
            filters,
            finished: false,
            _entity: PhantomData,
        })
    }

    /// The collaborator handle of this subscription.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the stream has reported `Resync`. Records that
    /// fail the filter re-check or do not decode are skipped.
    pub async fn next(&mut self) -> Option<StreamItem<T>> {
        if self.finished {
            return None;
        }

        loop {
            let item = match self.receiver.recv().await {
                Some(item) => item,
                None => {
                    self.finished = true;
                    return Some(StreamItem::Resync {
                        reason: "change feed closed".into(),
                    });
                }
            };

            match item {
                FeedItem::Lost { reason } => {
                    self.finished = true;
                    return Some(StreamItem::Resync { reason });
                }
                FeedItem::Change { op, table, record } => {
                    if table != T::TABLE {
                        continue;
                    }
                    // Deletes carry only the id and cannot be re-checked
                    if op != ChangeOp::Delete && !matches_all(&self.filters, &record) {
                        debug!(table = %table, "Dropping record outside subscription filter");
                        continue;
                    }
                    match ChangeEvent::decode(op, &record) {
                        Ok(event) => return Some(StreamItem::Change(event)),
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable change record");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Close the stream and release the collaborator handle.
    ///
    /// No item can be observed after this returns.
    pub async fn unsubscribe(mut self) {
        self.receiver.close();
        if let Err(e) = self.feed.unsubscribe(self.handle).await {
            debug!(handle = %self.handle, error = %e, "Unsubscribe failed");
        }
    }
}

impl<T: Entity> std::fmt::Debug for ChangeStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("table", &T::TABLE)
            .field("handle", &self.handle)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use chatsync_types::{ChatId, Message, Table, UserId};
    use chrono::Utc;
    use serde_json::{json, Value};

    fn message_record(chat_id: ChatId, content: &str) -> Value {
        json!({
            "id": chatsync_types::MessageId::new(),
            "chat_id": chat_id,
            "user_id": UserId::new(),
            "content": content,
            "created_at": Utc::now(),
        })
    }

    async fn message_stream(mock: &MockBackend, chat_id: ChatId) -> ChangeStream<Message> {
        ChangeStream::subscribe(
            Arc::new(mock.clone()),
            vec![Filter::eq("chat_id", chat_id)],
            16,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_in_emission_order() {
        let mock = MockBackend::new();
        let chat = ChatId::new();
        let mut stream = message_stream(&mock, chat).await;

        mock.remote_insert(Table::Messages, message_record(chat, "one"));
        mock.remote_insert(Table::Messages, message_record(chat, "two"));

        let mut contents = Vec::new();
        for _ in 0..2 {
            match stream.next().await {
                Some(StreamItem::Change(ChangeEvent::Insert(m))) => contents.push(m.content),
                other => panic!("unexpected item: {:?}", other),
            }
        }
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn rechecks_filter_client_side() {
        let mock = MockBackend::new();
        let chat = ChatId::new();
        let mut stream = message_stream(&mock, chat).await;

        // Bypasses the server-side mask
        mock.emit(ChangeOp::Insert, Table::Messages, message_record(ChatId::new(), "leak"));
        mock.emit(ChangeOp::Insert, Table::Messages, message_record(chat, "ok"));

        match stream.next().await {
            Some(StreamItem::Change(event)) => {
                assert_eq!(event.entity().unwrap().content, "ok");
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn skips_undecodable_records() {
        let mock = MockBackend::new();
        let chat = ChatId::new();
        let mut stream = message_stream(&mock, chat).await;

        mock.emit(ChangeOp::Insert, Table::Messages, json!({ "chat_id": chat }));
        mock.emit(ChangeOp::Delete, Table::Messages, json!({ "id": "not-a-uuid" }));
        let good = message_record(chat, "fine");
        mock.emit(ChangeOp::Insert, Table::Messages, good);

        assert!(matches!(stream.next().await, Some(StreamItem::Change(_))));
    }

    #[tokio::test]
    async fn loss_surfaces_once_as_resync() {
        let mock = MockBackend::new();
        let mut stream = message_stream(&mock, ChatId::new()).await;

        mock.drop_streams("network down");

        assert_eq!(
            stream.next().await,
            Some(StreamItem::Resync {
                reason: "network down".into()
            })
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn unsubscribe_releases_handle() {
        let mock = MockBackend::new();
        let stream = message_stream(&mock, ChatId::new()).await;
        assert_eq!(mock.active_subscriptions(), 1);

        stream.unsubscribe().await;
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_is_subscription_lost() {
        let mock = MockBackend::new();
        mock.fail_next_subscribe("refused");

        let result = ChangeStream::<Message>::subscribe(Arc::new(mock), vec![], 4).await;
        assert!(matches!(
            result,
            Err(SyncError::SubscriptionLost {
                table: Table::Messages,
                ..
            })
        ));
    }
}
