//! Redis-backed shared store.
//!
//! ## Key layout
//!
//! Every key carries the configured prefix.
//!
//! - Window counters and cache entries: plain string keys with a millisecond TTL.
//! - Indexes: sets whose members are unprefixed key names. The set's TTL is only
//!   ever extended, so it outlives every key it lists.
//! - A queue `q` uses four keys: `q:ready` (list of ids), `q:items` (hash of id to
//!   payload), `q:inflight` (sorted set of id scored by visibility deadline in ms)
//!   and `q:leases` (hash of id to the lease currently owning it).
//!
//! ## Atomicity
//!
//! Every read-modify-write runs as a Lua script, so a counter is never incremented
//! without its expiry, and a queue item is never in two places at once.
//!
//! ## Time
//!
//! Visibility deadlines are computed from the injected [`Clock`] rather than the
//! server's clock, so that the memory and Redis backends behave the same under test.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Client;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::ItemState;
use super::SharedStore;
use super::WindowCount;
use super::WindowIncrement;
use crate::clock::Clock;
use crate::error::StoreError;

const WINDOW_SCRIPT: &str = r"
local limit = tonumber(ARGV[1])
local weight = tonumber(ARGV[3])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local previous = 0
if #KEYS > 1 then
  previous = tonumber(redis.call('GET', KEYS[2]) or '0')
end
if math.floor(previous * weight) + current >= limit then
  return {current, previous, 0}
end
current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {current, previous, 1}
";

const POP_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[4], id)
  redis.call('RPUSH', KEYS[1], id)
end
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local payload = redis.call('HGET', KEYS[3], id)
  if payload then
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    redis.call('HSET', KEYS[4], id, ARGV[3])
    return {id, payload}
  end
end
";

const ACK_SCRIPT: &str = r"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
";

const MOVE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[6], ARGV[1], ARGV[3])
redis.call('RPUSH', KEYS[5], ARGV[1])
return 1
";

const INDEX_ADD_SCRIPT: &str = r"
redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if redis.call('PTTL', KEYS[1]) < ttl then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
";

const DELETE_INDEXED_SCRIPT: &str = r"
local removed = 0
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  removed = removed + redis.call('DEL', ARGV[1] .. member)
end
redis.call('DEL', KEYS[1])
return removed
";

struct Scripts {
    window: Script,
    pop: Script,
    ack: Script,
    relocate: Script,
    index_add: Script,
    delete_indexed: Script,
}

/// Keys backing one queue.
struct QueueKeys {
    ready: String,
    inflight: String,
    items: String,
    leases: String,
}

/// Shared store on Redis (or any server speaking its protocol).
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    scripts: Arc<Scripts>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379/0`) and checks the
    /// connection with a `PING`.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the server cannot be reached.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        debug!(url, "connected to shared store");

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            clock,
            scripts: Arc::new(Scripts {
                window: Script::new(WINDOW_SCRIPT),
                pop: Script::new(POP_SCRIPT),
                ack: Script::new(ACK_SCRIPT),
                relocate: Script::new(MOVE_SCRIPT),
                index_add: Script::new(INDEX_ADD_SCRIPT),
                delete_indexed: Script::new(DELETE_INDEXED_SCRIPT),
            }),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn queue_keys(&self, queue: &str) -> QueueKeys {
        QueueKeys {
            ready: self.key(&format!("{queue}:ready")),
            inflight: self.key(&format!("{queue}:inflight")),
            items: self.key(&format!("{queue}:items")),
            leases: self.key(&format!("{queue}:leases")),
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now().as_millis() as u64
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn increment_window(
        &self,
        window: WindowIncrement<'_>,
    ) -> Result<WindowCount, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.window.prepare_invoke();
        invocation.key(self.key(window.key));

        let weight = match window.previous {
            Some((previous, weight)) => {
                invocation.key(self.key(previous));
                weight
            }
            None => 0.0,
        };

        let (current, previous, admitted): (u64, u64, u8) = invocation
            .arg(window.limit)
            .arg(window.ttl.as_millis() as u64)
            .arg(weight)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowCount {
            current,
            previous,
            admitted: admitted == 1,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(self.key(key)).await?)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let millis = (ttl.as_millis() as u64).max(1);
        conn.pset_ex::<_, _, ()>(self.key(key), value, millis)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.scripts
            .index_add
            .key(self.key(index))
            .arg(member)
            .arg((ttl.as_millis() as u64).max(1))
            .invoke_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_indexed(&self, index: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        Ok(self
            .scripts
            .delete_indexed
            .key(self.key(index))
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn queue_push(
        &self,
        queue: &str,
        id: &str,
        payload: &[u8],
    ) -> Result<u64, StoreError> {
        let keys = self.queue_keys(queue);
        let mut conn = self.connection.clone();
        let (_, ready, inflight): (u64, u64, u64) = redis::pipe()
            .atomic()
            .hset(&keys.items, id, payload)
            .rpush(&keys.ready, id)
            .zcard(&keys.inflight)
            .query_async(&mut conn)
            .await?;
        Ok(ready + inflight)
    }

    async fn queue_pop(
        &self,
        queue: &str,
        lease: &str,
        visibility: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let keys = self.queue_keys(queue);
        let now = self.now_millis();
        let deadline = now + visibility.as_millis() as u64;

        let mut conn = self.connection.clone();
        Ok(self
            .scripts
            .pop
            .key(&keys.ready)
            .key(&keys.inflight)
            .key(&keys.items)
            .key(&keys.leases)
            .arg(now)
            .arg(deadline)
            .arg(lease)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn queue_ack(&self, queue: &str, id: &str, lease: &str) -> Result<bool, StoreError> {
        let keys = self.queue_keys(queue);
        let mut conn = self.connection.clone();
        let acked: u8 = self
            .scripts
            .ack
            .key(&keys.ready)
            .key(&keys.inflight)
            .key(&keys.items)
            .key(&keys.leases)
            .arg(id)
            .arg(lease)
            .invoke_async(&mut conn)
            .await?;
        Ok(acked == 1)
    }

    async fn queue_move(
        &self,
        from: &str,
        to: &str,
        id: &str,
        lease: &str,
        payload: &[u8],
    ) -> Result<bool, StoreError> {
        let source = self.queue_keys(from);
        let target = self.queue_keys(to);
        let mut conn = self.connection.clone();
        let moved: u8 = self
            .scripts
            .relocate
            .key(&source.ready)
            .key(&source.inflight)
            .key(&source.items)
            .key(&source.leases)
            .key(&target.ready)
            .key(&target.items)
            .arg(id)
            .arg(lease)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn queue_len(&self, queue: &str) -> Result<u64, StoreError> {
        let keys = self.queue_keys(queue);
        let mut conn = self.connection.clone();
        let (ready, inflight): (u64, u64) = redis::pipe()
            .llen(&keys.ready)
            .zcard(&keys.inflight)
            .query_async(&mut conn)
            .await?;
        Ok(ready + inflight)
    }

    async fn queue_locate(&self, queue: &str, id: &str) -> Result<Option<ItemState>, StoreError> {
        let keys = self.queue_keys(queue);
        let mut conn = self.connection.clone();
        let (stored, deadline): (bool, Option<f64>) = redis::pipe()
            .atomic()
            .hexists(&keys.items, id)
            .zscore(&keys.inflight, id)
            .query_async(&mut conn)
            .await?;
        if !stored {
            return Ok(None);
        }
        Ok(Some(match deadline {
            Some(deadline) if deadline > self.now_millis() as f64 => ItemState::InFlight,
            _ => ItemState::Ready,
        }))
    }
}

#[cfg(test)]
mod tests {
    //! These tests require a Redis instance at `redis://127.0.0.1/`.
    //! Run with `cargo test -p tier-gate -- --ignored`.

    use super::*;
    use crate::clock::ManualClock;

    async fn connect(test: &str) -> Option<(ManualClock, RedisStore)> {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let prefix = format!("tier-gate-test:{test}:{:x}:", rand::random::<u64>());
        match RedisStore::connect("redis://127.0.0.1/", prefix, Arc::new(clock.clone())).await {
            Ok(store) => Some((clock, store)),
            Err(err) => {
                eprintln!("Skipping test: Redis not available ({err})");
                None
            }
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn window_script_caps_the_counter() {
        let Some((_, store)) = connect("window").await else {
            return;
        };
        let window = WindowIncrement {
            key: "k",
            limit: 2,
            ttl: Duration::from_secs(60),
            previous: None,
        };

        assert!(store.increment_window(window).await.unwrap().admitted);
        assert!(store.increment_window(window).await.unwrap().admitted);
        let denied = store.increment_window(window).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.current, 2);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn queue_scripts_lease_and_reclaim() {
        let Some((clock, store)) = connect("queue").await else {
            return;
        };
        let visibility = Duration::from_secs(30);
        store.queue_push("q", "1", b"one").await.unwrap();

        let (id, payload) = store.queue_pop("q", "l1", visibility).await.unwrap().unwrap();
        assert_eq!((id.as_str(), payload.as_slice()), ("1", b"one".as_slice()));
        assert!(store.queue_pop("q", "l2", visibility).await.unwrap().is_none());

        clock.advance(visibility);
        assert!(store.queue_pop("q", "l2", visibility).await.unwrap().is_some());
        assert!(!store.queue_ack("q", "1", "l1").await.unwrap());
        assert!(store.queue_ack("q", "1", "l2").await.unwrap());
        assert_eq!(store.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn locate_reads_lease_deadlines() {
        let Some((clock, store)) = connect("locate").await else {
            return;
        };
        let visibility = Duration::from_secs(30);
        store.queue_push("q", "1", b"one").await.unwrap();
        assert_eq!(
            store.queue_locate("q", "1").await.unwrap(),
            Some(ItemState::Ready)
        );

        store.queue_pop("q", "l1", visibility).await.unwrap();
        assert_eq!(
            store.queue_locate("q", "1").await.unwrap(),
            Some(ItemState::InFlight)
        );
        clock.advance(visibility);
        assert_eq!(
            store.queue_locate("q", "1").await.unwrap(),
            Some(ItemState::Ready)
        );
        assert_eq!(store.queue_locate("q", "2").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn delete_indexed_strips_the_prefix_once() {
        let Some((_, store)) = connect("index").await else {
            return;
        };
        let ttl = Duration::from_secs(60);
        for key in ["a", "b"] {
            store.set_with_ttl(key, b"body", ttl).await.unwrap();
            store.index_add("idx", key, ttl).await.unwrap();
        }
        store.set_with_ttl("c", b"body", ttl).await.unwrap();

        assert_eq!(store.delete_indexed("idx").await.unwrap(), 2);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some(b"body".to_vec()));
        assert_eq!(store.delete_indexed("idx").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn values_round_trip_with_ttl() {
        let Some((_, store)) = connect("values").await else {
            return;
        };
        store
            .set_with_ttl("k", b"body", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"body".to_vec()));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
