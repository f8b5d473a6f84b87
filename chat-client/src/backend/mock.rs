//! Mock collaborator for testing.
//!
//! Keeps rows in memory, fans changes out to subscribers, and allows
//! injecting failures, latency and dropped streams.

use super::{
    matches_all, Backend, BackendError, BlobStorage, ChangeFeed, FeedItem, FeedSubscription,
    Filter, SessionProvider, SubscriptionHandle,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use chatsync_types::{ChangeOp, Table, UserId};

/// Mock collaborator for testing.
///
/// Implements [`Backend`], [`ChangeFeed`], [`BlobStorage`] and
/// [`SessionProvider`] over shared in-memory state. Clones share state.
#[derive(Debug)]
pub struct MockBackend {
    inner: Arc<Mutex<MockBackendInner>>,
    session: Arc<watch::Sender<Option<UserId>>>,
}

#[derive(Debug)]
struct Subscriber {
    handle: SubscriptionHandle,
    table: Table,
    filters: Vec<Filter>,
    sender: mpsc::Sender<FeedItem>,
}

#[derive(Debug, Default)]
struct MockBackendInner {
    rows: HashMap<Table, Vec<Value>>,
    subscribers: Vec<Subscriber>,
    next_handle: u64,
    latency: Duration,
    select_log: Vec<(Table, Vec<Filter>)>,
    broadcasts: Vec<(Table, Value)>,
    uploads: Vec<(String, String, usize)>,
    fail_next_select: Option<String>,
    fail_next_insert: Option<String>,
    fail_next_update: Option<String>,
    fail_next_upload: Option<String>,
    fail_next_subscribe: Option<String>,
}

impl MockBackendInner {
    /// Push an item to every live subscriber of `table` whose filters match.
    ///
    /// Deletes only carry an id, so they skip the filter check.
    fn fan_out(&mut self, op: ChangeOp, table: Table, record: &Value) {
        self.subscribers.retain(|sub| !sub.sender.is_closed());
        for sub in &self.subscribers {
            if sub.table != table {
                continue;
            }
            if op != ChangeOp::Delete && !matches_all(&sub.filters, record) {
                continue;
            }
            let _ = sub.sender.try_send(FeedItem::Change {
                op,
                table,
                record: record.clone(),
            });
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(MockBackendInner::default())),
            session: Arc::new(session),
        }
    }
}

impl MockBackend {
    /// Create a new mock collaborator.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockBackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a row without notifying subscribers.
    pub fn seed(&self, table: Table, record: Value) {
        let mut inner = self.lock();
        inner.rows.entry(table).or_default().push(record);
    }

    /// Store a row and notify subscribers, as if another client wrote it.
    pub fn remote_insert(&self, table: Table, record: Value) {
        let mut inner = self.lock();
        inner.rows.entry(table).or_default().push(record.clone());
        inner.fan_out(ChangeOp::Insert, table, &record);
    }

    /// Replace a row by id and notify subscribers.
    pub fn remote_update(&self, table: Table, record: Value) {
        let mut inner = self.lock();
        let rows = inner.rows.entry(table).or_default();
        rows.retain(|row| row.get("id") != record.get("id"));
        rows.push(record.clone());
        inner.fan_out(ChangeOp::Update, table, &record);
    }

    /// Remove a row by id and notify subscribers with an id-only record.
    pub fn remote_delete(&self, table: Table, id: impl serde::Serialize) {
        let id = serde_json::to_value(id).unwrap_or(Value::Null);
        let mut inner = self.lock();
        if let Some(rows) = inner.rows.get_mut(&table) {
            rows.retain(|row| row.get("id") != Some(&id));
        }
        inner.fan_out(ChangeOp::Delete, table, &json!({ "id": id }));
    }

    /// Push a raw item to subscribers of `table` without touching rows.
    pub fn emit(&self, op: ChangeOp, table: Table, record: Value) {
        let mut inner = self.lock();
        inner.fan_out(op, table, &record);
    }

    /// Drop every open stream with the given reason.
    pub fn drop_streams(&self, reason: &str) {
        let mut inner = self.lock();
        for sub in inner.subscribers.drain(..) {
            let _ = sub.sender.try_send(FeedItem::Lost {
                reason: reason.to_string(),
            });
        }
    }

    /// Number of open subscriptions (closed receivers excluded).
    pub fn active_subscriptions(&self) -> usize {
        let inner = self.lock();
        inner
            .subscribers
            .iter()
            .filter(|sub| !sub.sender.is_closed())
            .count()
    }

    /// Number of `select` calls against a table.
    pub fn select_count(&self, table: Table) -> usize {
        let inner = self.lock();
        inner.select_log.iter().filter(|(t, _)| *t == table).count()
    }

    /// All `select` calls in order.
    pub fn select_log(&self) -> Vec<(Table, Vec<Filter>)> {
        let inner = self.lock();
        inner.select_log.clone()
    }

    /// All rows currently stored for a table.
    pub fn rows(&self, table: Table) -> Vec<Value> {
        let inner = self.lock();
        inner.rows.get(&table).cloned().unwrap_or_default()
    }

    /// All broadcasts relayed so far.
    pub fn broadcasts(&self) -> Vec<(Table, Value)> {
        let inner = self.lock();
        inner.broadcasts.clone()
    }

    /// All uploads as `(path, content_type, size)`.
    pub fn uploads(&self) -> Vec<(String, String, usize)> {
        let inner = self.lock();
        inner.uploads.clone()
    }

    /// Delay every `select`, `insert` and `upload` by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let mut inner = self.lock();
        inner.latency = latency;
    }

    /// Sign a user in or out.
    pub fn set_user(&self, user: Option<UserId>) {
        self.session.send_replace(user);
    }

    /// Cause the next select() to fail with the given error.
    pub fn fail_next_select(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_select = Some(error.to_string());
    }

    /// Cause the next insert() to fail with the given error.
    pub fn fail_next_insert(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_insert = Some(error.to_string());
    }

    /// Cause the next update() to fail with the given error.
    pub fn fail_next_update(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_update = Some(error.to_string());
    }

    /// Cause the next upload() to fail with the given error.
    pub fn fail_next_upload(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_upload = Some(error.to_string());
    }

    /// Cause the next subscribe() to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_subscribe = Some(error.to_string());
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Clone for MockBackend {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            session: Arc::clone(&self.session),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn select(&self, table: Table, filters: &[Filter]) -> Result<Vec<Value>, BackendError> {
        {
            let mut inner = self.lock();
            inner.select_log.push((table, filters.to_vec()));
        }
        self.delay().await;

        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_select.take() {
            return Err(BackendError::Request(error));
        }

        Ok(inner
            .rows
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(filters, row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, record: Value) -> Result<Value, BackendError> {
        self.delay().await;
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_insert.take() {
            return Err(BackendError::Request(error));
        }

        let mut record = record;
        match record.as_object_mut() {
            Some(map) => {
                map.entry("id")
                    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
            }
            None => return Err(BackendError::Request("record must be an object".into())),
        }

        inner.rows.entry(table).or_default().push(record.clone());
        inner.fan_out(ChangeOp::Insert, table, &record);
        Ok(record)
    }

    async fn update(
        &self,
        table: Table,
        filters: &[Filter],
        patch: Value,
    ) -> Result<Vec<Value>, BackendError> {
        self.delay().await;
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_update.take() {
            return Err(BackendError::Request(error));
        }

        let Some(patch) = patch.as_object() else {
            return Err(BackendError::Request("patch must be an object".into()));
        };

        let mut updated = Vec::new();
        if let Some(rows) = inner.rows.get_mut(&table) {
            for row in rows.iter_mut().filter(|row| matches_all(filters, row)) {
                if let Some(map) = row.as_object_mut() {
                    for (key, value) in patch {
                        map.insert(key.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            inner.fan_out(ChangeOp::Update, table, row);
        }
        Ok(updated)
    }

    async fn append_unique(
        &self,
        table: Table,
        filters: &[Filter],
        column: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Value>, BackendError> {
        self.delay().await;
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_update.take() {
            return Err(BackendError::Request(error));
        }

        let mut updated = Vec::new();
        if let Some(rows) = inner.rows.get_mut(&table) {
            for row in rows.iter_mut().filter(|row| matches_all(filters, row)) {
                let Some(map) = row.as_object_mut() else {
                    continue;
                };
                let field = map
                    .entry(column.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !field.is_array() {
                    *field = Value::Array(Vec::new());
                }
                if let Value::Array(items) = field {
                    for value in &values {
                        if !items.contains(value) {
                            items.push(value.clone());
                        }
                    }
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            inner.fan_out(ChangeOp::Update, table, row);
        }
        Ok(updated)
    }
}

#[async_trait]
impl ChangeFeed for MockBackend {
    async fn subscribe(
        &self,
        table: Table,
        filters: &[Filter],
        buffer: usize,
    ) -> Result<FeedSubscription, BackendError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(BackendError::Request(error));
        }

        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        inner.subscribers.push(Subscriber {
            handle,
            table,
            filters: filters.to_vec(),
            sender,
        });
        Ok(FeedSubscription { handle, receiver })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| sub.handle != handle);
        Ok(())
    }

    async fn broadcast(&self, table: Table, record: Value) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.broadcasts.push((table, record.clone()));
        inner.fan_out(ChangeOp::Insert, table, &record);
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for MockBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError> {
        self.delay().await;
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_upload.take() {
            return Err(BackendError::Request(error));
        }

        inner.uploads.push((
            format!("{}/{}", bucket, path),
            content_type.to_string(),
            bytes.len(),
        ));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://storage.mock/{}/{}", bucket, path)
    }
}

impl SessionProvider for MockBackend {
    fn current_user(&self) -> Option<UserId> {
        *self.session.borrow()
    }

    fn watch(&self) -> watch::Receiver<Option<UserId>> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_types::ChatId;

    // ===========================================
    // Backend Tests
    // ===========================================

    #[tokio::test]
    async fn select_filters_rows() {
        let mock = MockBackend::new();
        let chat = ChatId::new();
        mock.seed(Table::Messages, json!({ "id": 1, "chat_id": chat }));
        mock.seed(Table::Messages, json!({ "id": 2, "chat_id": ChatId::new() }));

        let rows = mock
            .select(Table::Messages, &[Filter::eq("chat_id", chat)])
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(mock.select_count(Table::Messages), 1);
    }

    #[tokio::test]
    async fn insert_assigns_id() {
        let mock = MockBackend::new();
        let stored = mock
            .insert(Table::Messages, json!({ "content": "hi" }))
            .await
            .unwrap();

        assert!(stored.get("id").is_some());
        assert_eq!(mock.rows(Table::Messages), vec![stored]);
    }

    #[tokio::test]
    async fn update_merges_patch() {
        let mock = MockBackend::new();
        mock.seed(Table::Messages, json!({ "id": "m1", "read_by": [] }));

        let rows = mock
            .update(
                Table::Messages,
                &[Filter::eq("id", "m1")],
                json!({ "read_by": ["u1"] }),
            )
            .await
            .unwrap();

        assert_eq!(rows, vec![json!({ "id": "m1", "read_by": ["u1"] })]);
    }

    #[tokio::test]
    async fn append_unique_keeps_existing_elements() {
        let mock = MockBackend::new();
        mock.seed(Table::Messages, json!({ "id": "m1", "read_by": ["u1"] }));
        mock.seed(Table::Messages, json!({ "id": "m2", "read_by": null }));

        let filter = [Filter::is_in("id", ["m1", "m2"])];
        mock.append_unique(Table::Messages, &filter, "read_by", vec![json!("u2")])
            .await
            .unwrap();
        let rows = mock
            .append_unique(Table::Messages, &filter, "read_by", vec![json!("u1")])
            .await
            .unwrap();

        assert_eq!(
            rows,
            vec![
                json!({ "id": "m1", "read_by": ["u1", "u2"] }),
                json!({ "id": "m2", "read_by": ["u2", "u1"] }),
            ]
        );
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn forced_select_failure() {
        let mock = MockBackend::new();
        mock.fail_next_select("offline");

        let result = mock.select(Table::Chats, &[]).await;
        assert!(matches!(result, Err(BackendError::Request(_))));

        // Next select should work
        assert!(mock.select(Table::Chats, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn forced_upload_failure_records_nothing() {
        let mock = MockBackend::new();
        mock.fail_next_upload("quota");

        let result = mock.upload("chat-files", "c/f.png", vec![1, 2], "image/png").await;
        assert!(result.is_err());
        assert!(mock.uploads().is_empty());
    }

    // ===========================================
    // Change Feed Tests
    // ===========================================

    #[tokio::test]
    async fn insert_is_pushed_to_matching_subscribers() {
        let mock = MockBackend::new();
        let chat = ChatId::new();
        let mut sub = mock
            .subscribe(Table::Messages, &[Filter::eq("chat_id", chat)], 8)
            .await
            .unwrap();

        mock.remote_insert(Table::Messages, json!({ "id": "other", "chat_id": ChatId::new() }));
        mock.remote_insert(Table::Messages, json!({ "id": "mine", "chat_id": chat }));

        match sub.receiver.recv().await.unwrap() {
            FeedItem::Change { op, record, .. } => {
                assert_eq!(op, ChangeOp::Insert);
                assert_eq!(record["id"], "mine");
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn drop_streams_sends_lost() {
        let mock = MockBackend::new();
        let mut sub = mock.subscribe(Table::Chats, &[], 8).await.unwrap();

        mock.drop_streams("socket closed");

        assert_eq!(
            sub.receiver.recv().await,
            Some(FeedItem::Lost {
                reason: "socket closed".into()
            })
        );
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_releases_handle() {
        let mock = MockBackend::new();
        let sub = mock.subscribe(Table::Chats, &[], 8).await.unwrap();
        assert_eq!(mock.active_subscriptions(), 1);

        mock.unsubscribe(sub.handle).await.unwrap();
        assert_eq!(mock.active_subscriptions(), 0);
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn clone_shares_state() {
        let mock1 = MockBackend::new();
        let mock2 = mock1.clone();
        let user = UserId::new();

        mock1.set_user(Some(user));
        mock1.insert(Table::Chats, json!({})).await.unwrap();

        assert_eq!(mock2.current_user(), Some(user));
        assert_eq!(mock2.rows(Table::Chats).len(), 1);
    }

    #[tokio::test]
    async fn session_watch_sees_sign_out() {
        let mock = MockBackend::new();
        mock.set_user(Some(UserId::new()));
        let mut rx = mock.watch();

        mock.set_user(None);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), None);
    }
}
