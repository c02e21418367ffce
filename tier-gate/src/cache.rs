//! Shared response cache.
//!
//! Entries are stored under `cache:{fingerprint}` with a server-side TTL and
//! carry their own timestamps, so a reader can tell how much of the TTL is left
//! and advertise no more than that to the client.
//!
//! Every entry is also listed in `cache:variants:{resource}`, one set per
//! normalized path, so that a write drops all methods, queries and negotiated
//! representations of the resource at once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::request::CACHE_CONTROL;
use crate::request::GateRequest;
use crate::request::GateResponse;
use crate::store::SharedStore;
use crate::tier::normalize_path;

/// Request headers that select between representations of one resource.
///
/// Only these take part in the fingerprint; in particular `authorization` and
/// `cookie` never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaryPolicy {
    headers: Vec<String>,
}

impl VaryPolicy {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.as_ref().to_ascii_lowercase())
            .collect();
        headers.sort();
        headers.dedup();
        Self { headers }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl Default for VaryPolicy {
    fn default() -> Self {
        Self::new(["accept", "accept-encoding", "accept-language"])
    }
}

/// Deterministic identity of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    digest: String,
    resource: String,
}

/// Feeds `field` to `hasher` behind its length, so that no two field lists
/// produce the same byte stream.
fn update_field(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field);
}

impl Fingerprint {
    /// SHA-256 over the method, normalized path, sorted query pairs and the
    /// headers named by `vary`.
    pub fn of(request: &GateRequest, vary: &VaryPolicy) -> Self {
        let path = normalize_path(&request.path);
        let mut query: Vec<(&str, &str)> = request
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.sort();

        let mut hasher = Sha256::new();
        update_field(&mut hasher, request.method.as_str().as_bytes());
        update_field(&mut hasher, path.as_bytes());
        hasher.update((query.len() as u64).to_le_bytes());
        for (key, value) in query {
            update_field(&mut hasher, key.as_bytes());
            update_field(&mut hasher, value.as_bytes());
        }
        for name in vary.headers() {
            update_field(&mut hasher, name.as_bytes());
            update_field(&mut hasher, request.header(name).unwrap_or_default().as_bytes());
        }

        Self {
            digest: hex::encode(hasher.finalize()),
            resource: resource_of(&path),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.digest
    }

    /// Digest of the normalized path, shared by every variant of the resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn key(&self) -> String {
        format!("cache:{}", self.digest)
    }
}

fn resource_of(normalized_path: &str) -> String {
    hex::encode(Sha256::digest(normalized_path.as_bytes()))
}

fn variants_key(resource: &str) -> String {
    format!("cache:variants:{resource}")
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

/// A stored response and when it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// Server-side time to live left at `now`.
    pub fn remaining(&self, now: Duration) -> Duration {
        let age = (now.as_millis() as u64).saturating_sub(self.stored_at_ms);
        Duration::from_millis(self.ttl_ms.saturating_sub(age))
    }

    pub fn is_fresh(&self, now: Duration) -> bool {
        !self.remaining(now).is_zero()
    }

    /// Rebuilds the response, advertising `max_age` seconds to the client.
    pub fn into_response(self, max_age: u64) -> GateResponse {
        let mut response = GateResponse::new(self.status, self.body);
        response.headers = self.headers;
        response.set_header(CACHE_CONTROL, format!("max-age={max_age}"));
        response
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

/// Response cache in the shared store.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    client_max_age: Duration,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        client_max_age: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            client_max_age,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reads the entry for `fingerprint`.
    ///
    /// An entry that cannot be decoded is deleted and reported as a miss, as is
    /// one whose TTL has run out but that the store has not expired yet.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Lookup, StoreError> {
        let key = fingerprint.key();
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(Lookup::Miss);
        };

        let entry: CacheEntry = match bincode::deserialize(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%fingerprint, error = %err, "corrupt cache entry, deleting");
                if let Err(err) = self.store.delete(&key).await {
                    warn!(%fingerprint, error = %err, "failed to delete corrupt cache entry");
                }
                return Ok(Lookup::Miss);
            }
        };

        if entry.is_fresh(self.clock.now()) {
            debug!(%fingerprint, "cache hit");
            Ok(Lookup::Hit(entry))
        } else {
            Ok(Lookup::Miss)
        }
    }

    /// Stores `response` under `fingerprint` for the configured TTL, replacing
    /// any existing entry.
    pub async fn put(
        &self,
        fingerprint: &Fingerprint,
        response: &GateResponse,
    ) -> Result<CacheEntry, StoreError> {
        let entry = CacheEntry {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at_ms: self.clock.now().as_millis() as u64,
            ttl_ms: self.ttl.as_millis() as u64,
        };
        let bytes = bincode::serialize(&entry)
            .map_err(|err| StoreError::Protocol(format!("cache entry encoding: {err}")))?;

        // Listed before it is written, so a concurrent write to the resource
        // cannot miss it.
        let key = fingerprint.key();
        self.store
            .index_add(&variants_key(fingerprint.resource()), &key, self.ttl)
            .await?;
        self.store.set_with_ttl(&key, &bytes, self.ttl).await?;
        debug!(%fingerprint, ttl = ?self.ttl, "cached response");
        Ok(entry)
    }

    /// Removes the entry for `fingerprint`, returning whether there was one.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let removed = self.store.delete(&fingerprint.key()).await?;
        debug!(%fingerprint, removed, "invalidated cache entry");
        Ok(removed)
    }

    /// Removes every cached variant of the resource `request` targets,
    /// whatever its method, query or negotiation headers. Returns how many
    /// entries were removed.
    pub async fn invalidate_resource(&self, request: &GateRequest) -> Result<u64, StoreError> {
        let resource = resource_of(&normalize_path(&request.path));
        let removed = self.store.delete_indexed(&variants_key(&resource)).await?;
        debug!(path = %request.path, removed, "invalidated cached resource");
        Ok(removed)
    }

    /// Seconds a client may reuse `entry`: the remaining server-side TTL rounded
    /// down, capped by the configured client max-age.
    pub fn max_age(&self, entry: &CacheEntry) -> u64 {
        entry
            .remaining(self.clock.now())
            .as_secs()
            .min(self.client_max_age.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_le;

    use super::*;
    use crate::clock::ManualClock;
    use crate::request::Method;
    use crate::store::MemoryStore;
    use crate::tier::Principal;

    fn cache(clock: &ManualClock, ttl: u64, client_max_age: u64) -> (Arc<MemoryStore>, ResponseCache) {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let cache = ResponseCache::new(
            store.clone(),
            clock,
            Duration::from_secs(ttl),
            Duration::from_secs(client_max_age),
        );
        (store, cache)
    }

    fn request(path: &str) -> GateRequest {
        GateRequest::get(path, Principal::anonymous("10.0.0.1"))
    }

    #[tokio::test]
    async fn it_expires_entries_after_their_ttl() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, cache) = cache(&clock, 30, 60);
        let fp = Fingerprint::of(&request("/api/v1/users"), &VaryPolicy::default());

        cache.put(&fp, &GateResponse::ok("users")).await.unwrap();

        clock.advance(Duration::from_secs(29));
        let entry = match cache.get(&fp).await.unwrap() {
            Lookup::Hit(entry) => entry,
            Lookup::Miss => panic!("expected a hit at 29s"),
        };
        assert_eq!(entry.body, b"users");
        assert_eq!(cache.max_age(&entry), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&fp).await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn max_age_never_grows_and_stays_within_the_ttl() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, cache) = cache(&clock, 30, 60);
        let fp = Fingerprint::of(&request("/"), &VaryPolicy::default());
        let entry = cache.put(&fp, &GateResponse::ok("root")).await.unwrap();

        let mut last = cache.max_age(&entry);
        assert_eq!(last, 30);
        for _ in 0..40 {
            clock.advance(Duration::from_millis(900));
            let max_age = cache.max_age(&entry);
            assert_le!(max_age, last);
            assert_le!(Duration::from_secs(max_age), entry.remaining(clock.now()));
            last = max_age;
        }
        assert_eq!(last, 0);
    }

    #[tokio::test]
    async fn client_max_age_caps_the_directive() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, cache) = cache(&clock, 300, 60);
        let fp = Fingerprint::of(&request("/"), &VaryPolicy::default());
        let entry = cache.put(&fp, &GateResponse::ok("root")).await.unwrap();

        assert_eq!(cache.max_age(&entry), 60);
        let response = entry.into_response(60);
        assert_eq!(response.header(CACHE_CONTROL), Some("max-age=60"));
    }

    #[tokio::test]
    async fn corrupt_entries_are_deleted_and_missed() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (store, cache) = cache(&clock, 30, 60);
        let fp = Fingerprint::of(&request("/"), &VaryPolicy::default());

        store
            .set_with_ttl(&fp.key(), b"\xff", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(cache.get(&fp).await.unwrap(), Lookup::Miss);
        assert_eq!(store.get(&fp.key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_removes_the_entry() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, cache) = cache(&clock, 30, 60);
        let fp = Fingerprint::of(&request("/items"), &VaryPolicy::default());

        cache.put(&fp, &GateResponse::ok("items")).await.unwrap();
        assert!(cache.invalidate(&fp).await.unwrap());
        assert!(!cache.invalidate(&fp).await.unwrap());
        assert_eq!(cache.get(&fp).await.unwrap(), Lookup::Miss);
    }

    #[test]
    fn authorization_does_not_affect_the_fingerprint() {
        let vary = VaryPolicy::default();
        let alice = request("/items").with_header("Authorization", "Bearer alice");
        let bob = request("/items")
            .with_header("Authorization", "Bearer bob")
            .with_header("Cookie", "session=1");
        assert_eq!(Fingerprint::of(&alice, &vary), Fingerprint::of(&bob, &vary));
    }

    #[test]
    fn negotiation_headers_vary_the_fingerprint() {
        let vary = VaryPolicy::default();
        let json = request("/items").with_header("Accept", "application/json");
        let xml = request("/items").with_header("Accept", "application/xml");
        assert_ne!(Fingerprint::of(&json, &vary), Fingerprint::of(&xml, &vary));
    }

    #[test]
    fn query_order_and_path_shape_do_not_matter() {
        let vary = VaryPolicy::default();
        let a = request("/items/").with_query("page", "2").with_query("sort", "name");
        let b = request("//items").with_query("sort", "name").with_query("page", "2");
        assert_eq!(Fingerprint::of(&a, &vary), Fingerprint::of(&b, &vary));

        let c = request("/items").with_query("page", "3");
        assert_ne!(Fingerprint::of(&a, &vary), Fingerprint::of(&c, &vary));
    }

    #[test]
    fn fields_cannot_bleed_into_each_other() {
        let vary = VaryPolicy::new(Vec::<String>::new());
        let a = request("/items").with_query("a=b", "");
        let b = request("/items").with_query("a", "b=");
        assert_ne!(Fingerprint::of(&a, &vary), Fingerprint::of(&b, &vary));
    }

    #[test]
    fn variants_share_a_resource() {
        let vary = VaryPolicy::default();
        let get = request("/items/").with_query("page", "2");
        let mut head = request("//items").with_header("Accept", "application/json");
        head.method = Method::Head;

        let get = Fingerprint::of(&get, &vary);
        let head = Fingerprint::of(&head, &vary);
        assert_ne!(get, head);
        assert_eq!(get.resource(), head.resource());
        assert_ne!(
            get.resource(),
            Fingerprint::of(&request("/users"), &vary).resource()
        );
    }

    #[tokio::test]
    async fn invalidate_resource_drops_every_variant() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, cache) = cache(&clock, 30, 60);
        let vary = VaryPolicy::default();

        let get = request("/items");
        let json = request("/items").with_header("Accept", "application/json");
        let mut head = request("/items");
        head.method = Method::Head;
        let other = request("/users");

        let fingerprints: Vec<Fingerprint> = [&get, &json, &head, &other]
            .into_iter()
            .map(|r| Fingerprint::of(r, &vary))
            .collect();
        for fp in &fingerprints {
            cache.put(fp, &GateResponse::ok("body")).await.unwrap();
        }

        let mut write = request("/items/").with_query("page", "9");
        write.method = Method::Post;
        assert_eq!(cache.invalidate_resource(&write).await.unwrap(), 3);

        for fp in &fingerprints[..3] {
            assert_eq!(cache.get(fp).await.unwrap(), Lookup::Miss);
        }
        assert!(matches!(
            cache.get(&fingerprints[3]).await.unwrap(),
            Lookup::Hit(_)
        ));
        assert_eq!(cache.invalidate_resource(&write).await.unwrap(), 0);
    }
}
