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
    cell::UnsafeCell,
    fmt::Debug,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    assert::OptionExt,
    code::{Key, Value},
    error::{Error, ErrorKind, Result},
    strict_assert,
};

/// Hit count a sweep leaves behind on a retained slot.
///
/// A slot whose counter still holds this value when the next sweep arrives
/// has not been read for a full period and is dropped. A freshly created
/// slot starts below it, which grants one full period of grace before the
/// slot becomes eligible.
pub const IDLE_HITS: u64 = 1;

/// [`Slot`] holds one key's in-flight or settled computation result.
///
/// The result is settled exactly once by the caller that installed the slot
/// into the store; every other holder blocks in [`Slot::wait`] until then.
/// The hit counter is the only state the sweeper ever inspects.
pub struct Slot<K, V>
where
    K: Key,
    V: Value,
{
    key: K,
    hash: u64,

    hits: AtomicU64,

    settled: AtomicBool,
    result: UnsafeCell<Option<Result<V>>>,
    lock: Mutex<()>,
    cv: Condvar,
}

unsafe impl<K, V> Send for Slot<K, V>
where
    K: Key,
    V: Value,
{
}
unsafe impl<K, V> Sync for Slot<K, V>
where
    K: Key,
    V: Value,
{
}

impl<K, V> Debug for Slot<K, V>
where
    K: Key,
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("hash", &self.hash)
            .field("hits", &self.hits())
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<K, V> Slot<K, V>
where
    K: Key,
    V: Value,
{
    /// Create an unsettled slot with a zero hit counter.
    pub fn new(key: K, hash: u64) -> Self {
        Self {
            key,
            hash,
            hits: AtomicU64::new(0),
            settled: AtomicBool::new(false),
            result: UnsafeCell::new(None),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Acquire)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Run the computation and settle the slot with its outcome, waking all
    /// waiters. Must only be called by the caller that installed this slot.
    ///
    /// If the computation unwinds, the slot is settled with an
    /// [`ErrorKind::Interrupted`] error before the panic propagates, so
    /// waiters are never stranded on a slot that can no longer settle.
    pub fn run_once<F>(&self, f: F)
    where
        F: FnOnce() -> std::result::Result<V, anyhow::Error>,
    {
        struct Abandon<'a, K, V>
        where
            K: Key,
            V: Value,
        {
            slot: &'a Slot<K, V>,
            armed: bool,
        }

        impl<K, V> Drop for Abandon<'_, K, V>
        where
            K: Key,
            V: Value,
        {
            fn drop(&mut self) {
                if self.armed {
                    self.slot.settle(Err(Error::new(
                        ErrorKind::Interrupted,
                        "computation abandoned before settling",
                    )));
                }
            }
        }

        let mut abandon = Abandon { slot: self, armed: true };
        let result = f().map_err(|e| Error::new(ErrorKind::Compute, "memoized computation failed").with_source(e));
        abandon.armed = false;

        self.settle(result);
    }

    /// Block the calling thread until the slot settles.
    ///
    /// Returns immediately on an already settled slot.
    pub fn wait(&self) -> &Result<V> {
        if !self.settled.load(Ordering::Acquire) {
            let mut guard = self.lock.lock();
            while !self.settled.load(Ordering::Acquire) {
                self.cv.wait(&mut guard);
            }
        }

        // Safety: `settled` is stored with release ordering after the result
        // is written, and the result is never written again.
        unsafe { (*self.result.get()).as_ref().strict_unwrap_unchecked() }
    }

    /// Non-blocking view of the settled result.
    pub fn peek(&self) -> Option<&Result<V>> {
        if !self.settled.load(Ordering::Acquire) {
            return None;
        }

        // Safety: same as `wait`.
        Some(unsafe { (*self.result.get()).as_ref().strict_unwrap_unchecked() })
    }

    /// The settled value, if the computation succeeded.
    pub fn value(&self) -> Option<&V> {
        self.peek().and_then(|res| res.as_ref().ok())
    }

    /// Record one successful read.
    pub fn touch(&self) -> u64 {
        let hits = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!("[slot]: touch slot (hash: {}) hits: {}", self.hash, hits);
        hits
    }

    /// Re-arm the hit counter to [`IDLE_HITS`] unless a read raced past the
    /// `observed` count in the meantime; a raced read is never lost.
    ///
    /// Returns whether the counter was re-armed.
    pub fn rearm_hits(&self, observed: u64) -> bool {
        self.hits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current > observed {
                    None
                } else {
                    Some(IDLE_HITS)
                }
            })
            .is_ok()
    }

    fn settle(&self, result: Result<V>) {
        let guard = self.lock.lock();
        strict_assert!(!self.settled.load(Ordering::Relaxed), "slot must settle exactly once");
        // Safety: the single-writer discipline above guarantees this is the
        // only write, and it happens before the release store publishing it.
        unsafe { *self.result.get() = Some(result) };
        self.settled.store(true, Ordering::Release);
        drop(guard);

        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        time::Duration,
    };

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Slot<u64, u64>>();
        is_send_sync_static::<Slot<String, Vec<u8>>>();
    }

    #[test_log::test]
    fn test_run_once_settles_and_wakes_waiters() {
        let slot = Arc::new(Slot::new(1u64, 1));
        let barrier = Arc::new(Barrier::new(5));

        let waiters = (0..4)
            .map(|_| {
                let slot = slot.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let value = *slot.wait().as_ref().unwrap();
                    slot.touch();
                    value
                })
            })
            .collect::<Vec<_>>();

        barrier.wait();
        std::thread::sleep(Duration::from_millis(10));
        slot.run_once(|| Ok(42u64));
        slot.touch();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 42);
        }
        assert_eq!(slot.hits(), 5);
        assert!(slot.is_settled());
    }

    #[test_log::test]
    fn test_wait_on_settled_slot_does_not_block() {
        let slot = Slot::new(1u64, 1);
        slot.run_once(|| Ok(7u64));

        assert_eq!(*slot.wait().as_ref().unwrap(), 7);
        assert_eq!(slot.value(), Some(&7));
    }

    #[test_log::test]
    fn test_failed_computation_is_shared() {
        let slot: Slot<u64, u64> = Slot::new(1, 1);
        slot.run_once(|| Err(anyhow::anyhow!("boom")));

        let e1 = slot.wait().as_ref().unwrap_err().clone();
        let e2 = slot.wait().as_ref().unwrap_err().clone();
        assert_eq!(e1.kind(), ErrorKind::Compute);
        assert_eq!(e2.kind(), ErrorKind::Compute);
        assert_eq!(slot.hits(), 0);
    }

    #[test_log::test]
    fn test_panicked_computation_interrupts_waiters() {
        let slot: Arc<Slot<u64, u64>> = Arc::new(Slot::new(1, 1));

        let s = slot.clone();
        let waiter = std::thread::spawn(move || s.wait().as_ref().unwrap_err().kind());

        let s = slot.clone();
        let runner = std::thread::spawn(move || s.run_once(|| panic!("kaboom")));
        assert!(runner.join().is_err());

        assert_eq!(waiter.join().unwrap(), ErrorKind::Interrupted);
    }

    #[test_log::test]
    fn test_rearm_hits_keeps_raced_reads() {
        let slot: Slot<u64, u64> = Slot::new(1, 1);
        slot.run_once(|| Ok(0));

        slot.touch();
        slot.touch();
        let observed = slot.hits();
        assert_eq!(observed, 2);

        // A read arrives between the observation and the re-arm attempt.
        slot.touch();
        assert!(!slot.rearm_hits(observed));
        assert_eq!(slot.hits(), 3);

        // No raced read, the counter drops back to the idle baseline.
        assert!(slot.rearm_hits(slot.hits()));
        assert_eq!(slot.hits(), IDLE_HITS);
    }
}
