// Copyright 2026 lapse Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    borrow::Cow,
    fmt::Debug,
    hash::Hash,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::RandomState;
use equivalent::Equivalent;

use crate::{
    code::{HashBuilder, Key, Value},
    error::Result,
    event::{Event, EventListener},
    metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, BoxedRegistry, RegistryOps},
    slot::Slot,
    store::Store,
    sweeper::Sweeper,
};

/// The memoized function.
///
/// The function is handed a reference to the key and produces the value to
/// cache for it, or an error. Errors are not cached: the failing key is
/// dropped so the next call retries the computation.
pub trait Compute<K, V>: Fn(&K) -> anyhow::Result<V> + Send + Sync + 'static {}
impl<K, V, T> Compute<K, V> for T where T: Fn(&K) -> anyhow::Result<V> + Send + Sync + 'static {}

/// Builder of the memoization cache.
pub struct MemoizerBuilder<K, V, S = RandomState>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    name: Cow<'static, str>,
    period: Duration,
    shards: usize,
    hash_builder: S,
    event_listener: Option<Arc<dyn EventListener<Key = K, Value = V>>>,
    registry: BoxedRegistry,
}

impl<K, V> MemoizerBuilder<K, V>
where
    K: Key,
    V: Value,
{
    /// Create a builder with the given expiry period.
    ///
    /// The period is both the cadence of the background sweep and the
    /// staleness timeout: an entry that is not read for a full period is
    /// dropped at the following sweep, with one period of grace after
    /// creation.
    pub fn new(period: Duration) -> Self {
        Self {
            name: "lapse".into(),
            period,
            shards: 8,
            hash_builder: RandomState::default(),
            event_listener: None,
            registry: Box::new(NoopMetricsRegistry),
        }
    }
}

impl<K, V, S> MemoizerBuilder<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Set the name of the memoizer, used in metrics labels and the sweeper
    /// thread name.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the shard count of the slot store. Entries are distributed over
    /// the shards by their hash, and operations on different shards can be
    /// parallelized.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the hash builder.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> MemoizerBuilder<K, V, OS>
    where
        OS: HashBuilder,
    {
        MemoizerBuilder {
            name: self.name,
            period: self.period,
            shards: self.shards,
            hash_builder,
            event_listener: self.event_listener,
            registry: self.registry,
        }
    }

    /// Set the event listener.
    pub fn with_event_listener(mut self, event_listener: Arc<dyn EventListener<Key = K, Value = V>>) -> Self {
        self.event_listener = Some(event_listener);
        self
    }

    /// Set the metrics registry.
    ///
    /// Metrics are recorded against the noop registry unless one is given.
    pub fn with_metrics_registry(mut self, registry: impl RegistryOps) -> Self {
        self.registry = Box::new(registry);
        self
    }

    /// Build the memoizer over the given function and start its sweeper.
    ///
    /// # Panics
    ///
    /// Panics if the shard count or the period is zero.
    pub fn build<F, E>(self, compute: F) -> Memoizer<K, V, S>
    where
        F: Fn(&K) -> std::result::Result<V, E> + Send + Sync + 'static,
        E: Into<anyhow::Error>,
    {
        let compute: Arc<dyn Compute<K, V>> =
            Arc::new(move |key: &K| -> anyhow::Result<V> { compute(key).map_err(Into::into) });

        let metrics = Arc::new(Metrics::new(self.name.clone(), self.registry.as_ref()));
        let store = Arc::new(Store::new(self.shards));
        let sweeper = Sweeper::spawn(
            &self.name,
            self.period,
            store.clone(),
            metrics.clone(),
            self.event_listener.clone(),
        );

        Memoizer {
            inner: Arc::new(MemoizerInner {
                name: self.name,
                period: self.period,
                hash_builder: self.hash_builder,
                compute,
                store,
                sweeper,
                metrics,
                event_listener: self.event_listener,
            }),
        }
    }
}

struct MemoizerInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    name: Cow<'static, str>,
    period: Duration,

    hash_builder: S,
    compute: Arc<dyn Compute<K, V>>,
    store: Arc<Store<K, V>>,

    sweeper: Sweeper,

    metrics: Arc<Metrics>,
    event_listener: Option<Arc<dyn EventListener<Key = K, Value = V>>>,
}

/// Time-expiring, compute-once memoization cache.
///
/// [`Memoizer::apply`] maps a key to the value produced by the memoized
/// function. The function runs at most once per key no matter how many
/// callers race on it, and entries that are not read for a full period are
/// expired by a background sweep without any per-entry timestamps.
///
/// The memoizer is cheaply cloneable; all clones share the same cache.
pub struct Memoizer<K, V, S = RandomState>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    inner: Arc<MemoizerInner<K, V, S>>,
}

impl<K, V, S> Debug for Memoizer<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoizer").field("name", &self.inner.name).finish()
    }
}

impl<K, V, S> Clone for Memoizer<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, S> Memoizer<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// The value for the key, computing it on this thread if absent.
    ///
    /// Exactly one of the callers racing on an absent key runs the memoized
    /// function; the others block until it settles and share the outcome. A
    /// successful read counts as an access and defers expiry by a period.
    ///
    /// On a settled failure every waiter receives a clone of the error (the
    /// original cause is available via [`crate::error::Error::downcast_ref`])
    /// and the key is dropped from the cache, so the next call retries the
    /// computation.
    pub fn apply<Q>(&self, key: &Q) -> Result<MemoEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized + ToOwned<Owned = K>,
    {
        let hash = self.inner.hash_builder.hash_one(key);

        if let Some(slot) = self.inner.store.get(hash, key) {
            return self.resolve(slot, false);
        }

        let (slot, installed) = self
            .inner
            .store
            .insert_if_absent(Arc::new(Slot::new(key.to_owned(), hash)));

        if installed {
            self.inner.metrics.usage.absolute(self.inner.store.len() as u64);
            tracing::trace!("[memoizer]: compute entry (hash: {hash})");
            self.inner.metrics.compute.increase(1);
            if let Some(listener) = self.inner.event_listener.as_ref() {
                listener.on_compute(slot.key());
            }

            let start = Instant::now();
            slot.run_once(|| (self.inner.compute)(slot.key()));
            self.inner.metrics.compute_duration.record(start.elapsed().as_secs_f64());
        }

        self.resolve(slot, installed)
    }

    /// The value for the key if its computation has already settled
    /// successfully; never computes and never blocks.
    ///
    /// A returned value counts as an access and defers expiry by a period.
    pub fn get<Q>(&self, key: &Q) -> Option<MemoEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.hash_builder.hash_one(key);
        let slot = self.inner.store.get(hash, key)?;
        slot.value()?;

        slot.touch();
        self.inner.metrics.hit.increase(1);
        tracing::trace!("[memoizer]: serve entry (hash: {}) from cache", slot.hash());
        if let Some(listener) = self.inner.event_listener.as_ref() {
            listener.on_serve(slot.key());
        }

        Some(MemoEntry { slot })
    }

    /// Whether an entry for the key is resident. Does not count as an access.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.hash_builder.hash_one(key);
        self.inner.store.get(hash, key).is_some()
    }

    /// Remove the entry for the key.
    ///
    /// Returns the removed entry if its computation had settled successfully.
    pub fn remove<Q>(&self, key: &Q) -> Option<MemoEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.hash_builder.hash_one(key);
        let removed = self.inner.store.remove(hash, key)?;

        self.inner.metrics.remove.increase(1);
        self.inner.metrics.usage.absolute(self.inner.store.len() as u64);
        tracing::debug!("[memoizer]: remove entry (hash: {hash})");
        if let Some(listener) = self.inner.event_listener.as_ref() {
            listener.on_leave(Event::Remove, removed.key(), removed.value());
        }

        removed.value()?;
        Some(MemoEntry { slot: removed })
    }

    /// Drop all resident entries.
    pub fn clear(&self) {
        let drained = self.inner.store.clear();

        self.inner.metrics.remove.increase(drained.len() as u64);
        self.inner.metrics.usage.absolute(0);
        tracing::debug!("[memoizer]: clear {} entries", drained.len());
        if let Some(listener) = self.inner.event_listener.as_ref() {
            for slot in drained.iter() {
                listener.on_leave(Event::Clear, slot.key(), slot.value());
            }
        }
    }

    /// Stop the background sweeper and wait for it to exit. Idempotent.
    ///
    /// The cache keeps serving afterwards, but entries no longer expire.
    /// Dropping the last clone of the memoizer stops the sweeper as well.
    pub fn shutdown(&self) {
        self.inner.sweeper.stop();
    }

    /// Count of resident entries.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Name of the memoizer.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The sweep period.
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Shard count of the slot store.
    pub fn shards(&self) -> usize {
        self.inner.store.shards()
    }

    /// Metrics of the memoizer.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    fn resolve(&self, slot: Arc<Slot<K, V>>, computed: bool) -> Result<MemoEntry<K, V>> {
        let coalesced = !computed && !slot.is_settled();

        if let Err(e) = slot.wait() {
            let e = e.clone();
            // Drop the failed entry so the next call retries the computation.
            if let Some(removed) = self.inner.store.remove(slot.hash(), slot.key()) {
                tracing::debug!("[memoizer]: drop failed entry (hash: {})", removed.hash());
                self.inner.metrics.remove.increase(1);
                self.inner.metrics.usage.absolute(self.inner.store.len() as u64);
                if let Some(listener) = self.inner.event_listener.as_ref() {
                    listener.on_leave(Event::Remove, removed.key(), removed.value());
                }
            }
            return Err(e);
        }

        slot.touch();
        if !computed {
            if coalesced {
                self.inner.metrics.queue.increase(1);
            } else {
                self.inner.metrics.hit.increase(1);
            }
            tracing::trace!("[memoizer]: serve entry (hash: {}) from cache", slot.hash());
            if let Some(listener) = self.inner.event_listener.as_ref() {
                listener.on_serve(slot.key());
            }
        }

        Ok(MemoEntry { slot })
    }
}

/// Handle to a successfully computed cache entry.
///
/// The handle keeps the value alive independently of the cache, so it stays
/// usable even after the entry expires or is removed.
pub struct MemoEntry<K, V>
where
    K: Key,
    V: Value,
{
    slot: Arc<Slot<K, V>>,
}

impl<K, V> Debug for MemoEntry<K, V>
where
    K: Key,
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoEntry")
            .field("hash", &self.slot.hash())
            .field("hits", &self.slot.hits())
            .finish()
    }
}

impl<K, V> Clone for MemoEntry<K, V>
where
    K: Key,
    V: Value,
{
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<K, V> Deref for MemoEntry<K, V>
where
    K: Key,
    V: Value,
{
    type Target = V;

    fn deref(&self) -> &Self::Target {
        self.value()
    }
}

impl<K, V> MemoEntry<K, V>
where
    K: Key,
    V: Value,
{
    /// Key of the entry.
    pub fn key(&self) -> &K {
        self.slot.key()
    }

    /// Value of the entry.
    pub fn value(&self) -> &V {
        match self.slot.value() {
            Some(value) => value,
            None => unreachable!("entry handles are only created for successfully settled slots"),
        }
    }

    /// Hash of the entry key.
    pub fn hash(&self) -> u64 {
        self.slot.hash()
    }

    /// Reads recorded for the entry since creation or the last sweep re-arm.
    pub fn hits(&self) -> u64 {
        self.slot.hits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Barrier,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::error::ErrorKind;

    const LONG: Duration = Duration::from_secs(3600);

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Memoizer<u64, u64>>();
        is_send_sync_static::<Memoizer<String, Vec<u8>>>();
        is_send_sync_static::<MemoEntry<u64, u64>>();
    }

    #[test_log::test]
    fn test_apply_computes_once_per_key() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let memo: Memoizer<u64, u64> = MemoizerBuilder::new(LONG).build({
            let invocations = invocations.clone();
            move |key: &u64| {
                invocations.fetch_add(1, Ordering::Relaxed);
                Ok::<_, std::convert::Infallible>(key * 2)
            }
        });

        assert_eq!(*memo.apply(&21).unwrap(), 42);
        assert_eq!(*memo.apply(&21).unwrap(), 42);
        assert_eq!(*memo.apply(&7).unwrap(), 14);
        assert_eq!(invocations.load(Ordering::Relaxed), 2);
        assert_eq!(memo.len(), 2);

        memo.shutdown();
    }

    #[test_log::test]
    fn test_concurrent_apply_coalesces() {
        const CALLERS: usize = 8;

        let invocations = Arc::new(AtomicUsize::new(0));
        let memo: Memoizer<u64, u64> = MemoizerBuilder::new(LONG).build({
            let invocations = invocations.clone();
            move |key: &u64| {
                invocations.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(50));
                Ok::<_, std::convert::Infallible>(key + 1)
            }
        });

        let barrier = Arc::new(Barrier::new(CALLERS));
        let handles = (0..CALLERS)
            .map(|_| {
                let memo = memo.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    *memo.apply(&1).unwrap()
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 2);
        }
        assert_eq!(invocations.load(Ordering::Relaxed), 1);

        memo.shutdown();
    }

    #[test_log::test]
    fn test_failed_computation_is_retried() {
        #[derive(Debug, Clone, PartialEq, Eq)]
        struct Boom;

        impl std::fmt::Display for Boom {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "boom")
            }
        }

        impl std::error::Error for Boom {}

        let invocations = Arc::new(AtomicUsize::new(0));
        let memo: Memoizer<u64, u64> = MemoizerBuilder::new(LONG).build({
            let invocations = invocations.clone();
            move |key: &u64| {
                if invocations.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(Boom)
                } else {
                    Ok(key + 1)
                }
            }
        });

        let err = memo.apply(&1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert_eq!(err.downcast_ref::<Boom>(), Some(&Boom));
        // The failed entry is gone, the next call recomputes.
        assert!(!memo.contains(&1));

        assert_eq!(*memo.apply(&1).unwrap(), 2);
        assert_eq!(invocations.load(Ordering::Relaxed), 2);

        memo.shutdown();
    }

    #[test_log::test]
    fn test_get_never_computes() {
        let memo: Memoizer<u64, u64> = MemoizerBuilder::new(LONG)
            .build(|key: &u64| Ok::<_, std::convert::Infallible>(key + 1));

        assert!(memo.get(&1).is_none());
        assert!(memo.is_empty());

        memo.apply(&1).unwrap();
        let entry = memo.get(&1).unwrap();
        assert_eq!(*entry, 2);
        assert_eq!(entry.hits(), 2);

        memo.shutdown();
    }

    #[test_log::test]
    fn test_remove_and_clear() {
        let memo: Memoizer<u64, u64> = MemoizerBuilder::new(LONG)
            .build(|key: &u64| Ok::<_, std::convert::Infallible>(key + 1));

        for key in 0..8 {
            memo.apply(&key).unwrap();
        }
        assert_eq!(memo.len(), 8);

        let removed = memo.remove(&0).unwrap();
        assert_eq!(*removed, 1);
        assert!(!memo.contains(&0));
        assert!(memo.remove(&0).is_none());

        memo.clear();
        assert!(memo.is_empty());

        memo.shutdown();
    }

    #[test_log::test]
    fn test_entry_survives_removal() {
        let memo: Memoizer<u64, String> = MemoizerBuilder::new(LONG)
            .build(|key: &u64| Ok::<_, std::convert::Infallible>(key.to_string()));

        let entry = memo.apply(&1).unwrap();
        memo.clear();
        assert_eq!(entry.value(), "1");
        assert_eq!(entry.key(), &1);

        memo.shutdown();
    }

    #[test_log::test]
    fn test_listener_observes_lifecycle() {
        #[derive(Debug, Default)]
        struct Recorder {
            computed: Mutex<Vec<u64>>,
            served: Mutex<Vec<u64>>,
            left: Mutex<Vec<(Event, u64)>>,
        }

        impl EventListener for Recorder {
            type Key = u64;
            type Value = u64;

            fn on_leave(&self, reason: Event, key: &Self::Key, _: Option<&Self::Value>) {
                self.left.lock().push((reason, *key));
            }

            fn on_compute(&self, key: &Self::Key) {
                self.computed.lock().push(*key);
            }

            fn on_serve(&self, key: &Self::Key) {
                self.served.lock().push(*key);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let memo: Memoizer<u64, u64> = MemoizerBuilder::new(LONG)
            .with_event_listener(recorder.clone())
            .build(|key: &u64| Ok::<_, std::convert::Infallible>(key + 1));

        memo.apply(&1).unwrap();
        memo.apply(&1).unwrap();
        memo.remove(&1);
        memo.apply(&2).unwrap();
        memo.clear();

        assert_eq!(recorder.computed.lock().as_slice(), &[1, 2]);
        assert_eq!(recorder.served.lock().as_slice(), &[1]);
        assert_eq!(
            recorder.left.lock().as_slice(),
            &[(Event::Remove, 1), (Event::Clear, 2)]
        );

        memo.shutdown();
    }

    #[test_log::test]
    fn test_builder_knobs() {
        let memo: Memoizer<String, usize, RandomState> = MemoizerBuilder::new(LONG)
            .with_name("test")
            .with_shards(4)
            .with_hash_builder(RandomState::default())
            .with_metrics_registry(NoopMetricsRegistry)
            .build(|key: &String| Ok::<_, std::convert::Infallible>(key.len()));

        assert_eq!(memo.name(), "test");
        assert_eq!(memo.shards(), 4);
        assert_eq!(memo.period(), LONG);

        // Borrowed key forms work through `Equivalent`.
        assert_eq!(*memo.apply("hello").unwrap(), 5);
        assert!(memo.contains("hello"));

        memo.shutdown();
        memo.shutdown();
    }
}
