use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::ItemState;
use super::SharedStore;
use super::WindowCount;
use super::WindowIncrement;
use super::window_estimate;
use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Debug)]
enum Value {
    Counter(u64),
    Bytes(Vec<u8>),
    Members(BTreeSet<String>),
}

/// How often, in store time, expired slots are swept out.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Duration>,
}

#[derive(Debug)]
struct InFlight {
    lease: String,
    deadline: Duration,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<String>,
    items: HashMap<String, Vec<u8>>,
    inflight: HashMap<String, InFlight>,
}

impl MemoryQueue {
    /// Returns in-flight items whose visibility deadline passed to the ready list,
    /// oldest deadline first.
    fn reclaim(&mut self, now: Duration) {
        let mut expired: Vec<(Duration, String)> = self
            .inflight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, lease)| (lease.deadline, id.clone()))
            .collect();
        expired.sort();

        for (_, id) in expired {
            self.inflight.remove(&id);
            self.ready.push_back(id);
        }
    }

    fn settle(&mut self, id: &str, lease: &str) -> Option<Vec<u8>> {
        if self
            .inflight
            .get(id)
            .is_some_and(|owner| owner.lease == lease)
        {
            self.inflight.remove(id);
            self.items.remove(id)
        } else {
            None
        }
    }

    fn depth(&self) -> u64 {
        (self.ready.len() + self.inflight.len()) as u64
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, Slot>,
    queues: HashMap<String, MemoryQueue>,
    next_sweep: Duration,
}

impl MemoryState {
    /// Drops every expired slot, at most once per [`SWEEP_INTERVAL`].
    ///
    /// Window buckets and cache variants are written once and never read after
    /// they expire, so lazy expiry on read alone would let them pile up.
    fn sweep(&mut self, now: Duration) {
        if now < self.next_sweep {
            return;
        }
        self.values
            .retain(|_, slot| slot.expires_at.is_none_or(|at| at > now));
        self.next_sweep = now + SWEEP_INTERVAL;
    }

    /// Looks up `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Duration) -> Option<&Slot> {
        if self
            .values
            .get(key)
            .is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= now))
        {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn counter(&mut self, key: &str, now: Duration) -> Result<u64, StoreError> {
        match self.live(key, now) {
            None => Ok(0),
            Some(Slot {
                value: Value::Counter(count),
                ..
            }) => Ok(*count),
            Some(_) => Err(StoreError::Protocol(format!(
                "{key} does not hold a counter"
            ))),
        }
    }
}

/// In-process store with the same semantics as the Redis backend.
///
/// Every operation takes one lock over the whole state, which makes each of them
/// atomic. Expiry is evaluated lazily against the injected [`Clock`].
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn increment_window(
        &self,
        window: WindowIncrement<'_>,
    ) -> Result<WindowCount, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);

        let (previous, weight) = match window.previous {
            Some((key, weight)) => (state.counter(key, now)?, weight),
            None => (0, 0.0),
        };
        let current = state.counter(window.key, now)?;

        if window_estimate(current, previous, weight) >= window.limit {
            return Ok(WindowCount {
                current,
                previous,
                admitted: false,
            });
        }

        let slot = state
            .values
            .entry(window.key.to_string())
            .or_insert_with(|| Slot {
                value: Value::Counter(0),
                expires_at: Some(now + window.ttl),
            });
        let current = match &mut slot.value {
            Value::Counter(count) => {
                *count += 1;
                *count
            }
            // `counter` above rejected any other kind of value.
            Value::Bytes(_) | Value::Members(_) => current,
        };

        Ok(WindowCount {
            current,
            previous,
            admitted: true,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.live(key, now).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::Counter(count)) => Ok(Some(count.to_string().into_bytes())),
            Some(Value::Members(_)) => Err(StoreError::Protocol(format!("{key} holds a set"))),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);
        state.values.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let existed = state.live(key, now).is_some();
        state.values.remove(key);
        Ok(existed)
    }

    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.sweep(now);

        // Drops an expired set so the entry below starts a fresh one.
        state.live(index, now);
        let slot = state.values.entry(index.to_string()).or_insert_with(|| Slot {
            value: Value::Members(BTreeSet::new()),
            expires_at: None,
        });
        let Value::Members(members) = &mut slot.value else {
            return Err(StoreError::Protocol(format!("{index} does not hold a set")));
        };
        members.insert(member.to_string());
        // Never shorten the life of the set below that of an earlier member.
        let expires_at = now + ttl;
        slot.expires_at = Some(slot.expires_at.map_or(expires_at, |at| at.max(expires_at)));
        Ok(())
    }

    async fn delete_indexed(&self, index: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let members = match state.live(index, now) {
            None => return Ok(0),
            Some(Slot {
                value: Value::Members(members),
                ..
            }) => members.clone(),
            Some(_) => {
                return Err(StoreError::Protocol(format!("{index} does not hold a set")));
            }
        };
        state.values.remove(index);

        let mut removed = 0;
        for member in members {
            if state.live(&member, now).is_some() {
                state.values.remove(&member);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn queue_push(
        &self,
        queue: &str,
        id: &str,
        payload: &[u8],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let queue = state.queues.entry(queue.to_string()).or_default();
        queue.items.insert(id.to_string(), payload.to_vec());
        queue.ready.push_back(id.to_string());
        Ok(queue.depth())
    }

    async fn queue_pop(
        &self,
        queue: &str,
        lease: &str,
        visibility: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let queue = state.queues.entry(queue.to_string()).or_default();
        queue.reclaim(now);

        while let Some(id) = queue.ready.pop_front() {
            if let Some(payload) = queue.items.get(&id).cloned() {
                queue.inflight.insert(
                    id.clone(),
                    InFlight {
                        lease: lease.to_string(),
                        deadline: now + visibility,
                    },
                );
                return Ok(Some((id, payload)));
            }
        }
        Ok(None)
    }

    async fn queue_ack(&self, queue: &str, id: &str, lease: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(queue)
            .and_then(|queue| queue.settle(id, lease))
            .is_some())
    }

    async fn queue_move(
        &self,
        from: &str,
        to: &str,
        id: &str,
        lease: &str,
        payload: &[u8],
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let settled = state
            .queues
            .get_mut(from)
            .and_then(|queue| queue.settle(id, lease))
            .is_some();
        if !settled {
            return Ok(false);
        }

        let target = state.queues.entry(to.to_string()).or_default();
        target.items.insert(id.to_string(), payload.to_vec());
        target.ready.push_back(id.to_string());
        Ok(true)
    }

    async fn queue_len(&self, queue: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.queues.get(queue).map_or(0, MemoryQueue::depth))
    }

    async fn queue_locate(&self, queue: &str, id: &str) -> Result<Option<ItemState>, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let Some(queue) = state.queues.get(queue) else {
            return Ok(None);
        };
        if !queue.items.contains_key(id) {
            return Ok(None);
        }
        Ok(Some(match queue.inflight.get(id) {
            Some(lease) if lease.deadline > now => ItemState::InFlight,
            _ => ItemState::Ready,
        }))
    }
}
