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

use std::borrow::Cow;

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

/// Metrics model of the memoization cache.
#[derive(Debug)]
pub struct Metrics {
    /// Memoized function invocations.
    pub compute: BoxedCounter,
    /// Lookups served from an already settled entry.
    pub hit: BoxedCounter,
    /// Callers coalesced onto an in-flight computation.
    pub queue: BoxedCounter,
    /// Entries removed, either explicitly or after a failed computation.
    pub remove: BoxedCounter,
    /// Entries evicted by the sweeper.
    pub evict: BoxedCounter,
    /// Entries kept by a sweep with their access counter re-armed.
    pub retain: BoxedCounter,

    /// Resident entries.
    pub usage: BoxedGauge,

    /// Memoized function latency in seconds.
    pub compute_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a metrics model with the given cache name against the registry.
    pub fn new<R>(name: impl Into<Cow<'static, str>>, registry: &R) -> Self
    where
        R: RegistryOps + ?Sized,
    {
        let name = name.into();

        let lapse_memo_op_total = registry.register_counter_vec(
            "lapse_memo_op_total".into(),
            "lapse memoization cache operations".into(),
            &["name", "op"],
        );
        let lapse_memo_usage = registry.register_gauge_vec(
            "lapse_memo_usage".into(),
            "lapse memoization cache resident entries".into(),
            &["name"],
        );
        let lapse_memo_compute_duration = registry.register_histogram_vec(
            "lapse_memo_compute_duration".into(),
            "lapse memoized function durations".into(),
            &["name"],
        );

        let compute = lapse_memo_op_total.counter(&[name.clone(), "compute".into()]);
        let hit = lapse_memo_op_total.counter(&[name.clone(), "hit".into()]);
        let queue = lapse_memo_op_total.counter(&[name.clone(), "queue".into()]);
        let remove = lapse_memo_op_total.counter(&[name.clone(), "remove".into()]);
        let evict = lapse_memo_op_total.counter(&[name.clone(), "evict".into()]);
        let retain = lapse_memo_op_total.counter(&[name.clone(), "retain".into()]);

        let usage = lapse_memo_usage.gauge(&[name.clone()]);

        let compute_duration = lapse_memo_compute_duration.histogram(&[name]);

        Self {
            compute,
            hit,
            queue,
            remove,
            evict,
            retain,
            usage,
            compute_duration,
        }
    }

    /// Create a metrics model that records nothing, for tests and defaults.
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("noop", &NoopMetricsRegistry)
    }
}
