//! Identity cache: user id to profile, fetched lazily in batches.
//!
//! Concurrent `resolve` calls for overlapping id sets share one in-flight
//! fetch per id. Ids the fetch does not return come back as
//! [`Profile::unknown`] placeholders; placeholders are never cached, so a
//! later call can still resolve the id.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use chatsync_types::{Profile, SyncError, Table, UserId};

use crate::backend::{Backend, Filter};

type ProfileBatch = Arc<HashMap<UserId, Profile>>;
type ProfileFetch = Shared<BoxFuture<'static, ProfileBatch>>;

#[derive(Default)]
struct CacheInner {
    profiles: HashMap<UserId, Profile>,
    in_flight: HashMap<UserId, ProfileFetch>,
    /// Bumped by `clear`; batches started under an older one are not cached.
    generation: u64,
}

/// Session-scoped profile cache with fetch coalescing.
#[derive(Clone)]
pub struct IdentityCache {
    backend: Arc<dyn Backend>,
    inner: Arc<Mutex<CacheInner>>,
}

impl IdentityCache {
    /// Create an empty cache over a backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a set of ids to profiles.
    ///
    /// Cached profiles are returned without a fetch. Missing ids are fetched
    /// in one batch, unless another call is already fetching them. Never
    /// fails: unresolvable ids map to placeholders.
    pub async fn resolve(&self, ids: impl IntoIterator<Item = UserId>) -> HashMap<UserId, Profile> {
        let wanted: BTreeSet<UserId> = ids.into_iter().collect();
        let mut resolved = HashMap::with_capacity(wanted.len());
        let mut waits: Vec<ProfileFetch> = Vec::new();

        {
            let mut inner = self.lock();
            let mut missing = Vec::new();

            for id in &wanted {
                if let Some(profile) = inner.profiles.get(id) {
                    resolved.insert(*id, profile.clone());
                } else if let Some(fetch) = inner.in_flight.get(id) {
                    if !waits.iter().any(|w| w.ptr_eq(fetch)) {
                        waits.push(fetch.clone());
                    }
                } else {
                    missing.push(*id);
                }
            }

            if !missing.is_empty() {
                debug!(count = missing.len(), "Fetching profiles");
                let fetch = fetch_batch(
                    self.backend.clone(),
                    self.inner.clone(),
                    missing.clone(),
                    inner.generation,
                )
                .boxed()
                .shared();
                for id in missing {
                    inner.in_flight.insert(id, fetch.clone());
                }
                waits.push(fetch);
            }
        }

        for wait in waits {
            let batch = wait.await;
            for id in &wanted {
                if let Some(profile) = batch.get(id) {
                    resolved.insert(*id, profile.clone());
                }
            }
        }

        for id in wanted {
            resolved.entry(id).or_insert_with(|| {
                debug!(error = %SyncError::ResolutionGap(id), "Using placeholder profile");
                Profile::unknown(id)
            });
        }
        resolved
    }

    /// Check whether a profile is cached.
    pub fn contains(&self, id: &UserId) -> bool {
        self.lock().profiles.contains_key(id)
    }

    /// Cached profile, if any.
    pub fn get(&self, id: &UserId) -> Option<Profile> {
        self.lock().profiles.get(id).cloned()
    }

    /// All cached profiles.
    pub fn snapshot(&self) -> HashMap<UserId, Profile> {
        self.lock().profiles.clone()
    }

    /// Insert or replace a profile (from a profile change event).
    pub fn insert(&self, profile: Profile) {
        if profile.is_placeholder() {
            return;
        }
        self.lock().profiles.insert(profile.id, profile);
    }

    /// Forget everything (session teardown).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.profiles.clear();
        inner.in_flight.clear();
        inner.generation += 1;
    }

    /// Number of cached profiles.
    pub fn len(&self) -> usize {
        self.lock().profiles.len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.lock().profiles.is_empty()
    }
}

/// Fetch one batch and publish it into the cache.
///
/// Runs exactly once per batch no matter how many callers await it.
async fn fetch_batch(
    backend: Arc<dyn Backend>,
    cache: Arc<Mutex<CacheInner>>,
    ids: Vec<UserId>,
    generation: u64,
) -> ProfileBatch {
    let mut fetched = HashMap::new();

    match backend
        .select(Table::Profiles, &[Filter::is_in("id", ids.iter().copied())])
        .await
    {
        Ok(rows) => {
            for row in rows {
                match serde_json::from_value::<Profile>(row) {
                    Ok(profile) => {
                        fetched.insert(profile.id, profile);
                    }
                    Err(e) => warn!(error = %e, "Skipping undecodable profile row"),
                }
            }
        }
        Err(e) => warn!(error = %e, count = ids.len(), "Profile fetch failed, using placeholders"),
    }

    let mut inner = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if inner.generation != generation {
        debug!(count = fetched.len(), "Cache cleared during fetch, not caching batch");
        return Arc::new(fetched);
    }
    for id in &ids {
        inner.in_flight.remove(id);
    }
    for profile in fetched.values() {
        inner.profiles.insert(profile.id, profile.clone());
    }
    Arc::new(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn seed_profile(mock: &MockBackend, name: &str) -> UserId {
        let id = UserId::new();
        mock.seed(
            Table::Profiles,
            json!({ "id": id, "username": name, "created_at": Utc::now() }),
        );
        id
    }

    #[tokio::test]
    async fn resolves_and_caches() {
        let mock = MockBackend::new();
        let ann = seed_profile(&mock, "ann");
        let cache = IdentityCache::new(Arc::new(mock.clone()));

        let first = cache.resolve([ann]).await;
        let second = cache.resolve([ann]).await;

        assert_eq!(first[&ann].username, "ann");
        assert_eq!(second[&ann].username, "ann");
        assert_eq!(mock.select_count(Table::Profiles), 1);
    }

    #[tokio::test]
    async fn missing_ids_get_uncached_placeholders() {
        let mock = MockBackend::new();
        let ghost = UserId::new();
        let cache = IdentityCache::new(Arc::new(mock.clone()));

        let resolved = cache.resolve([ghost]).await;
        assert!(resolved[&ghost].is_placeholder());
        assert!(!cache.contains(&ghost));

        // The profile appears later and is picked up by the next call
        mock.seed(
            Table::Profiles,
            json!({ "id": ghost, "username": "late", "created_at": Utc::now() }),
        );
        let resolved = cache.resolve([ghost]).await;
        assert_eq!(resolved[&ghost].username, "late");
    }

    #[tokio::test]
    async fn failed_fetch_degrades_to_placeholders() {
        let mock = MockBackend::new();
        let ann = seed_profile(&mock, "ann");
        let cache = IdentityCache::new(Arc::new(mock.clone()));
        mock.fail_next_select("offline");

        let resolved = cache.resolve([ann]).await;
        assert!(resolved[&ann].is_placeholder());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_overlapping_resolves_fetch_each_id_once() {
        let mock = MockBackend::new();
        let a = seed_profile(&mock, "a");
        let b = seed_profile(&mock, "b");
        let c = seed_profile(&mock, "c");
        mock.set_latency(Duration::from_millis(50));
        let cache = IdentityCache::new(Arc::new(mock.clone()));

        let (left, right) = tokio::join!(cache.resolve([a, b]), cache.resolve([b, c]));

        assert_eq!(left[&b].username, "b");
        assert_eq!(right[&b].username, "b");
        assert_eq!(right[&c].username, "c");

        let mut fetched = Vec::new();
        for (table, filters) in mock.select_log() {
            assert_eq!(table, Table::Profiles);
            for filter in filters {
                if let Filter::In { values, .. } = filter {
                    fetched.extend(values);
                }
            }
        }
        assert_eq!(fetched.len(), 3, "each id fetched exactly once: {:?}", fetched);
    }

    #[tokio::test]
    async fn insert_ignores_placeholders() {
        let cache = IdentityCache::new(Arc::new(MockBackend::new()));
        let id = UserId::new();

        cache.insert(Profile::unknown(id));
        assert!(cache.get(&id).is_none());
    }

    #[tokio::test]
    async fn clear_forgets_profiles() {
        let mock = MockBackend::new();
        let ann = seed_profile(&mock, "ann");
        let cache = IdentityCache::new(Arc::new(mock));

        cache.resolve([ann]).await;
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn fetch_finishing_after_clear_is_not_cached() {
        let mock = MockBackend::new();
        let ann = seed_profile(&mock, "ann");
        mock.set_latency(Duration::from_millis(100));
        let cache = IdentityCache::new(Arc::new(mock));

        let resolving = tokio::spawn({
            let cache = cache.clone();
            async move { cache.resolve([ann]).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.clear();

        let resolved = resolving.await.unwrap();
        assert_eq!(resolved[&ann].username, "ann");
        assert!(cache.is_empty());
        assert!(cache.lock().in_flight.is_empty());
    }
}
