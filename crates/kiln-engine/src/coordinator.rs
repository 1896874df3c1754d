//! Cache coordinator: an in-memory LRU in front of the artifact store, plus
//! the fingerprint lock table that gives single-flight execution per key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use kiln_util::CancelToken;

use crate::error::EngineError;
use crate::rulekey::RuleKey;
use crate::scheduler::ActionFailure;
use crate::store::{ArtifactStore, CacheEntry, EntryMetadata, EvictionReport, ManifestEntry, OutputFile};

const LOCK_SHARDS: usize = 16;
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// How a leader's flight ended, as seen by its followers.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    /// Outputs are in the cache.
    Succeeded,
    /// The leader's action failed; followers share its diagnostics.
    Failed(Arc<ActionFailure>),
    /// The leader stopped because the invocation was cancelled.
    Cancelled,
    /// The leader went away without reporting.
    Abandoned,
}

/// Maps a leader's result onto what followers should observe.
pub trait FlightResult {
    fn flight_outcome(&self) -> FlightOutcome;
}

/// Result of [`CacheCoordinator::with_fingerprint_lock`].
#[derive(Debug)]
pub enum LockResult<T> {
    /// This caller ran the closure.
    Leader(T),
    /// Another caller ran it; this is how it ended.
    Follower(FlightOutcome),
}

#[derive(Debug, Default)]
struct Flight {
    outcome: Mutex<Option<FlightOutcome>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, outcome: FlightOutcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            slot.get_or_insert(outcome);
        }
        self.done.notify_all();
    }

    /// Block until the flight completes or `cancel` fires.
    fn wait(&self, cancel: &CancelToken) -> FlightOutcome {
        let Ok(mut slot) = self.outcome.lock() else {
            return FlightOutcome::Abandoned;
        };
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            if cancel.is_cancelled() {
                return FlightOutcome::Cancelled;
            }
            slot = match self.done.wait_timeout(slot, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(_) => return FlightOutcome::Abandoned,
            };
        }
    }
}

/// Completes the flight on every exit path, including unwinding.
struct LeaderGuard<'a> {
    coordinator: &'a CacheCoordinator,
    key: RuleKey,
    flight: Arc<Flight>,
    outcome: Option<FlightOutcome>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(&self.key);
        self.flight
            .complete(self.outcome.take().unwrap_or(FlightOutcome::Abandoned));
    }
}

/// Fixed-capacity least-recently-used map of manifests.
#[derive(Debug)]
struct Lru {
    capacity: usize,
    tick: u64,
    entries: HashMap<RuleKey, (Arc<[ManifestEntry]>, u64)>,
    order: BTreeMap<u64, RuleKey>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn get(&mut self, key: &RuleKey) -> Option<Arc<[ManifestEntry]>> {
        self.tick += 1;
        let tick = self.tick;
        let (outputs, last) = self.entries.get_mut(key)?;
        self.order.remove(last);
        *last = tick;
        self.order.insert(tick, *key);
        Some(Arc::clone(outputs))
    }

    fn put(&mut self, key: RuleKey, outputs: Arc<[ManifestEntry]>) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        if let Some((_, last)) = self.entries.insert(key, (outputs, self.tick)) {
            self.order.remove(&last);
        }
        self.order.insert(self.tick, key);
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &RuleKey) {
        if let Some((_, last)) = self.entries.remove(key) {
            self.order.remove(&last);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Front door to the cache for the scheduler.
pub struct CacheCoordinator {
    store: ArtifactStore,
    lru: Mutex<Lru>,
    locks: [Mutex<HashMap<RuleKey, Arc<Flight>>>; LOCK_SHARDS],
    max_bytes: Option<u64>,
}

impl CacheCoordinator {
    pub fn new(store: ArtifactStore, lru_capacity: usize, max_bytes: Option<u64>) -> Self {
        Self {
            store,
            lru: Mutex::new(Lru::new(lru_capacity)),
            locks: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            max_bytes,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Number of manifests held in memory.
    pub fn lru_len(&self) -> usize {
        self.lru.lock().map(|lru| lru.len()).unwrap_or(0)
    }

    /// Find a leased entry for `key`, checking memory before disk.
    ///
    /// Store errors are logged and reported as a miss.
    pub fn lookup(&self, key: &RuleKey) -> Option<CacheEntry> {
        let remembered = self.lru.lock().ok().and_then(|mut lru| lru.get(key));
        if let Some(outputs) = remembered {
            match self.store.reacquire(key, outputs) {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {
                    // Evicted from disk behind our back.
                    if let Ok(mut lru) = self.lru.lock() {
                        lru.remove(key);
                    }
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "cache lookup failed; treating as miss"),
            }
        }

        match self.store.lookup(key) {
            Ok(Some(entry)) => {
                if let Ok(mut lru) = self.lru.lock() {
                    lru.put(*key, entry.shared_outputs());
                }
                if tracing::enabled!(tracing::Level::DEBUG) {
                    if let Ok(meta) = self.store.read_metadata(key) {
                        tracing::debug!(
                            key = %key,
                            target = %meta.target,
                            built_on = %meta.host,
                            duration_ms = meta.duration_ms,
                            kiln_version = %meta.kiln_version,
                            "cache hit"
                        );
                    }
                }
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache lookup failed; treating as miss");
                None
            }
        }
    }

    /// Store outputs under `key` and return a leased entry for them.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub fn insert(
        &self,
        key: &RuleKey,
        outputs: &[OutputFile],
        metadata: &EntryMetadata,
    ) -> Result<CacheEntry, EngineError> {
        let stored = self.store.store(key, outputs, metadata)?;
        if let Ok(mut lru) = self.lru.lock() {
            lru.put(*key, Arc::clone(&stored));
        }
        self.store
            .reacquire(key, stored)?
            .ok_or_else(|| EngineError::CacheEntryMissing { key: key.to_hex() })
    }

    /// Run `f` as the only holder of `key`'s fingerprint lock.
    ///
    /// Concurrent callers for the same key wait for the leader and receive
    /// its [`FlightOutcome`]. If the leader was cancelled or abandoned and
    /// this invocation is still live, a waiter takes over as leader.
    pub fn with_fingerprint_lock<T: FlightResult>(
        &self,
        key: &RuleKey,
        cancel: &CancelToken,
        f: impl FnOnce() -> T,
    ) -> LockResult<T> {
        let mut f = Some(f);
        loop {
            let (flight, leader) = match self.shard(key).lock() {
                Ok(mut flights) => match flights.get(key) {
                    Some(existing) => (Arc::clone(existing), false),
                    None => {
                        let flight = Arc::new(Flight::default());
                        flights.insert(*key, Arc::clone(&flight));
                        (flight, true)
                    }
                },
                Err(_) => return LockResult::Follower(FlightOutcome::Abandoned),
            };

            if leader {
                let Some(run) = f.take() else {
                    return LockResult::Follower(FlightOutcome::Abandoned);
                };
                let mut guard = LeaderGuard {
                    coordinator: self,
                    key: *key,
                    flight,
                    outcome: None,
                };
                let result = run();
                guard.outcome = Some(result.flight_outcome());
                drop(guard);
                return LockResult::Leader(result);
            }

            tracing::debug!(key = %key, "waiting on in-flight build");
            match flight.wait(cancel) {
                FlightOutcome::Cancelled | FlightOutcome::Abandoned if !cancel.is_cancelled() => {
                    tracing::debug!(key = %key, "leader gave up; retrying");
                }
                outcome => return LockResult::Follower(outcome),
            }
        }
    }

    #[allow(clippy::indexing_slicing)] // reduced modulo LOCK_SHARDS
    fn shard(&self, key: &RuleKey) -> &Mutex<HashMap<RuleKey, Arc<Flight>>> {
        let [first, ..] = *key.digest().as_bytes();
        &self.locks[usize::from(first) % LOCK_SHARDS]
    }

    fn release(&self, key: &RuleKey) {
        if let Ok(mut flights) = self.shard(key).lock() {
            flights.remove(key);
        }
    }

    /// Evict down to the configured size limit, if any.
    ///
    /// # Errors
    /// Returns an error if eviction fails.
    pub fn enforce_limit(&self) -> Result<Option<EvictionReport>, EngineError> {
        let Some(max) = self.max_bytes else {
            return Ok(None);
        };
        self.store.evict_to_size(max).map(Some)
    }
}
