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

//! lapse is a time-expiring, compute-once memoization cache.
//!
//! [`Memoizer::apply`] maps a key to the value produced by an expensive
//! function. The function runs at most once per key no matter how many
//! threads race on it: one caller computes, the rest block and share the
//! outcome. A background sweep expires entries that have not been read for
//! a full period, tracked with a per-entry access counter instead of
//! timestamps.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use lapse::{Memoizer, MemoizerBuilder};
//!
//! let memo: Memoizer<u64, u64> = MemoizerBuilder::new(Duration::from_secs(60))
//!     .build(|key: &u64| Ok::<_, std::convert::Infallible>(key * 2));
//!
//! assert_eq!(*memo.apply(&21).unwrap(), 42);
//! // Served from the cache, the function does not run again.
//! assert_eq!(*memo.apply(&21).unwrap(), 42);
//!
//! memo.shutdown();
//! ```

mod cache;
mod slot;
mod store;
mod sweeper;

/// Strict assertion utilities.
pub mod assert;
/// Key, value and hash builder traits.
pub mod code;
/// Error types.
pub mod error;
/// Event listener for cache lifecycle diagnostics.
pub mod event;
/// Pluggable metrics.
pub mod metrics;
/// Re-exports of the most commonly used types.
pub mod prelude;
/// Shared small utilities.
pub mod utils;

pub use crate::cache::{Compute, MemoEntry, Memoizer, MemoizerBuilder};
