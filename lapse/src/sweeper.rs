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

use std::{fmt::Debug, sync::Arc, thread::JoinHandle, time::Duration};

use parking_lot::Mutex;

use crate::{
    code::{Key, Value},
    event::{Event, EventListener},
    metrics::model::Metrics,
    slot::IDLE_HITS,
    store::Store,
};

/// Handle of the background thread that expires stale entries.
///
/// The thread wakes once per period and runs one [`sweep`] pass. It is owned
/// by the memoizer and stopped either explicitly or when the handle drops,
/// so teardown never leaks the thread.
pub struct Sweeper {
    tx: flume::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper").finish()
    }
}

impl Sweeper {
    /// Spawn the sweeper thread with the given period.
    pub fn spawn<K, V>(
        name: &str,
        period: Duration,
        store: Arc<Store<K, V>>,
        metrics: Arc<Metrics>,
        listener: Option<Arc<dyn EventListener<Key = K, Value = V>>>,
    ) -> Self
    where
        K: Key,
        V: Value,
    {
        assert!(!period.is_zero(), "sweep period must be non-zero.");

        let (tx, rx) = flume::bounded(1);

        let handle = std::thread::Builder::new()
            .name(format!("{name}-sweeper"))
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(flume::RecvTimeoutError::Timeout) => sweep(&store, &metrics, listener.as_deref()),
                    Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => return,
                }
            })
            .unwrap();

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the sweeper and wait for the thread to exit. Idempotent.
    ///
    /// An in-flight pass finishes before the thread exits; no new pass
    /// starts afterwards.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One expiry pass over the store.
///
/// For every slot in a point-in-time snapshot:
///
/// - A slot whose hit counter still holds the idle baseline has not been
///   read since the previous pass re-armed it, and is dropped.
/// - Any other slot is kept and its counter re-armed to the baseline,
///   unless a read raced in after the snapshot, in which case the higher
///   count wins and the read is not lost.
///
/// A freshly created slot that has not been read at all (counter zero) fails
/// the baseline check and is merely re-armed, so every entry survives at
/// least one full period before it becomes eligible. The re-arm also means
/// an entry that is never read still counts as "accessed" once; it is
/// dropped one period later. A lost race anywhere in the pass is a normal
/// outcome, never an error.
pub fn sweep<K, V>(store: &Store<K, V>, metrics: &Metrics, listener: Option<&dyn EventListener<Key = K, Value = V>>)
where
    K: Key,
    V: Value,
{
    let slots = store.snapshot();
    tracing::trace!("[sweeper]: sweep {} entries", slots.len());

    for slot in slots {
        let observed = slot.hits();
        match store.remove_if_hits(slot.hash(), slot.key(), IDLE_HITS) {
            Some(removed) => {
                metrics.evict.increase(1);
                tracing::debug!(
                    "[sweeper]: evict entry (hash: {}), not accessed since the last sweep",
                    removed.hash()
                );
                if let Some(listener) = listener {
                    listener.on_leave(Event::Evict, removed.key(), removed.value());
                }
            }
            None => {
                metrics.retain.increase(1);
                tracing::trace!("[sweeper]: retain entry (hash: {}) hits: {}", slot.hash(), observed);
                slot.rearm_hits(observed);
                if let Some(listener) = listener {
                    listener.on_retain(slot.key());
                }
            }
        }
    }

    metrics.usage.absolute(store.len() as u64);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::slot::Slot;

    #[derive(Debug, Default)]
    struct Recorder {
        evicted: Mutex<Vec<u64>>,
        retained: Mutex<Vec<u64>>,
    }

    impl EventListener for Recorder {
        type Key = u64;
        type Value = u64;

        fn on_leave(&self, _: Event, key: &Self::Key, _: Option<&Self::Value>) {
            self.evicted.lock().push(*key);
        }

        fn on_retain(&self, key: &Self::Key) {
            self.retained.lock().push(*key);
        }
    }

    fn store_with_slot(key: u64, hits: u64) -> (Store<u64, u64>, Arc<Slot<u64, u64>>) {
        let store = Store::new(4);
        let slot = Arc::new(Slot::new(key, key));
        let (slot, installed) = store.insert_if_absent(slot);
        assert!(installed);
        slot.run_once(|| Ok(key));
        for _ in 0..hits {
            slot.touch();
        }
        (store, slot)
    }

    #[test_log::test]
    fn test_unread_slot_survives_one_pass() {
        let store: Store<u64, u64> = Store::new(4);
        let (slot, _) = store.insert_if_absent(Arc::new(Slot::new(1, 1)));
        assert_eq!(slot.hits(), 0);

        let metrics = Metrics::noop();
        sweep(&store, &metrics, None);
        assert_eq!(store.len(), 1);
        assert_eq!(slot.hits(), IDLE_HITS);

        sweep(&store, &metrics, None);
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_once_read_slot_is_dropped_at_first_pass() {
        let (store, _slot) = store_with_slot(1, 1);

        sweep(&store, &Metrics::noop(), None);
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_read_slot_survives_until_idle() {
        let (store, slot) = store_with_slot(1, 3);

        let metrics = Metrics::noop();
        sweep(&store, &metrics, None);
        assert_eq!(store.len(), 1);
        assert_eq!(slot.hits(), IDLE_HITS);

        // Read again within the period, survives the next pass as well.
        slot.touch();
        sweep(&store, &metrics, None);
        assert_eq!(store.len(), 1);

        // Untouched for a full period now, dropped.
        sweep(&store, &metrics, None);
        assert!(store.is_empty());
    }

    #[test_log::test]
    fn test_listener_observes_evictions_and_retains() {
        let (store, slot) = store_with_slot(1, 2);
        let recorder = Recorder::default();

        sweep(&store, &Metrics::noop(), Some(&recorder));
        assert_eq!(recorder.retained.lock().as_slice(), &[1]);
        assert!(recorder.evicted.lock().is_empty());

        sweep(&store, &Metrics::noop(), Some(&recorder));
        assert_eq!(recorder.evicted.lock().as_slice(), &[1]);
        assert_eq!(slot.hits(), IDLE_HITS);
    }

    #[test_log::test]
    fn test_sweeper_thread_expires_entries() {
        let store: Arc<Store<u64, u64>> = Arc::new(Store::new(4));
        let sweeper = Sweeper::spawn(
            "test",
            Duration::from_millis(10),
            store.clone(),
            Arc::new(Metrics::noop()),
            None,
        );

        let (slot, _) = store.insert_if_absent(Arc::new(Slot::new(1, 1)));
        slot.run_once(|| Ok(1));
        slot.touch();

        std::thread::sleep(Duration::from_millis(100));
        assert!(store.is_empty());

        sweeper.stop();
        sweeper.stop();

        // No pass runs after the sweeper stopped.
        let (slot, _) = store.insert_if_absent(Arc::new(Slot::new(2, 2)));
        slot.run_once(|| Ok(2));
        slot.touch();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.len(), 1);
    }
}
