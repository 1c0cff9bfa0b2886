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

/// Event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Sweeper eviction of an entry that was not accessed for a full period.
    Evict,
    /// Cache remove, either explicit or after a failed computation.
    Remove,
    /// Cache clear.
    Clear,
}

/// Trait for the customized event listener.
///
/// All methods default to no-ops, so an implementation only overrides the
/// events it cares about. The cache itself depends on no logging framework;
/// this trait is the seam to plug one in.
pub trait EventListener: Send + Sync + 'static {
    /// Associated key type.
    type Key;
    /// Associated value type.
    type Value;

    /// Called when an entry leaves the cache with the reason.
    ///
    /// `value` is `None` when the entry left before its computation settled
    /// successfully, e.g. a failed computation or an in-flight entry swept
    /// after outliving its grace period.
    #[expect(unused_variables)]
    fn on_leave(&self, reason: Event, key: &Self::Key, value: Option<&Self::Value>) {}

    /// Called when a sweep keeps an entry and re-arms its access counter.
    #[expect(unused_variables)]
    fn on_retain(&self, key: &Self::Key) {}

    /// Called when the memoized function is about to run for a key.
    #[expect(unused_variables)]
    fn on_compute(&self, key: &Self::Key) {}

    /// Called when a key is served from the cache instead of being recomputed.
    #[expect(unused_variables)]
    fn on_serve(&self, key: &Self::Key) {}
}
