//! Metering hooks.
//!
//! The sync core reports through an injected [`Metrics`] sink. Calls are
//! side effects only; swapping the sink never changes core behavior.
//! [`NoopMetrics`] is the default, [`CountingMetrics`] keeps in-process
//! totals for diagnostics and tests.

use crate::message::MessageKind;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Counter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meter {
    /// Items delivered by the downloader for a data kind.
    In(MessageKind),
    /// Deliveries rejected by the downloader.
    Drop(MessageKind),
    /// Requests that hit their deadline.
    Timeout(MessageKind),
    /// Transport packets received.
    PacketsIn(MessageKind),
    /// Transport packets sent.
    PacketsOut(MessageKind),
    /// Transport bytes received.
    TrafficIn(MessageKind),
    /// Transport bytes sent.
    TrafficOut(MessageKind),
    /// Fetcher: announcements accepted.
    AnnounceIn,
    /// Fetcher: announcements dropped (duplicate, distance, expiry).
    AnnounceDrop,
    /// Fetcher: announcements dropped for exceeding the peer budget.
    AnnounceDos,
    /// Fetcher: block broadcasts accepted.
    BroadcastIn,
    /// Fetcher: block broadcasts dropped.
    BroadcastDrop,
    /// Fetcher: block broadcasts over the peer budget.
    BroadcastDos,
    /// Fetcher: header fetches issued.
    HeaderFetch,
    /// Fetcher: body fetches issued.
    BodyFetch,
    /// Fetcher: headers delivered to the filter.
    FilterHeadersIn,
    /// Fetcher: headers passed through the filter.
    FilterHeadersOut,
    /// Fetcher: bodies delivered to the filter.
    FilterBodiesIn,
    /// Fetcher: bodies passed through the filter.
    FilterBodiesOut,
}

impl Meter {
    /// Metric key.
    pub fn name(&self) -> String {
        match self {
            Self::In(k) => format!("ec/downloader/{}/in", k),
            Self::Drop(k) => format!("ec/downloader/{}/drop", k),
            Self::Timeout(k) => format!("ec/downloader/{}/timeout", k),
            Self::PacketsIn(k) => format!("ec/req/{}/in/packets", k),
            Self::PacketsOut(k) => format!("ec/req/{}/out/packets", k),
            Self::TrafficIn(k) => format!("ec/req/{}/in/traffic", k),
            Self::TrafficOut(k) => format!("ec/req/{}/out/traffic", k),
            Self::AnnounceIn => "ec/fetcher/prop/announces/in".into(),
            Self::AnnounceDrop => "ec/fetcher/prop/announces/drop".into(),
            Self::AnnounceDos => "ec/fetcher/prop/announces/dos".into(),
            Self::BroadcastIn => "ec/fetcher/prop/broadcasts/in".into(),
            Self::BroadcastDrop => "ec/fetcher/prop/broadcasts/drop".into(),
            Self::BroadcastDos => "ec/fetcher/prop/broadcasts/dos".into(),
            Self::HeaderFetch => "ec/fetcher/fetch/headers".into(),
            Self::BodyFetch => "ec/fetcher/fetch/bodies".into(),
            Self::FilterHeadersIn => "ec/fetcher/filter/headers/in".into(),
            Self::FilterHeadersOut => "ec/fetcher/filter/headers/out".into(),
            Self::FilterBodiesIn => "ec/fetcher/filter/bodies/in".into(),
            Self::FilterBodiesOut => "ec/fetcher/filter/bodies/out".into(),
        }
    }
}

/// Timer identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Round trip of a request for a data kind.
    Request(MessageKind),
    /// Announcement to import latency.
    AnnounceOut,
    /// Broadcast to import latency.
    BroadcastOut,
}

impl Timer {
    /// Metric key.
    pub fn name(&self) -> String {
        match self {
            Self::Request(k) => format!("ec/downloader/{}/req", k),
            Self::AnnounceOut => "ec/fetcher/prop/announces/out".into(),
            Self::BroadcastOut => "ec/fetcher/prop/broadcasts/out".into(),
        }
    }
}

/// Metrics sink.
pub trait Metrics: Send + Sync {
    /// Add `count` to a counter.
    fn mark(&self, meter: Meter, count: u64);

    /// Record a duration sample.
    fn observe(&self, timer: Timer, elapsed: Duration);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn mark(&self, _meter: Meter, _count: u64) {}

    fn observe(&self, _timer: Timer, _elapsed: Duration) {}
}

/// Shared no-op sink.
pub fn noop() -> Arc<dyn Metrics> {
    Arc::new(NoopMetrics)
}

/// Sink that keeps running totals.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    meters: DashMap<Meter, u64>,
    timers: DashMap<Timer, (u64, Duration)>,
}

impl CountingMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value.
    pub fn get(&self, meter: Meter) -> u64 {
        self.meters.get(&meter).map(|v| *v).unwrap_or(0)
    }

    /// Number of samples recorded for a timer.
    pub fn samples(&self, timer: Timer) -> u64 {
        self.timers.get(&timer).map(|v| v.0).unwrap_or(0)
    }

    /// Snapshot of all counters by metric key.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<_> = self
            .meters
            .iter()
            .map(|e| (e.key().name(), *e.value()))
            .collect();
        out.sort();
        out
    }
}

impl Metrics for CountingMetrics {
    fn mark(&self, meter: Meter, count: u64) {
        *self.meters.entry(meter).or_insert(0) += count;
    }

    fn observe(&self, timer: Timer, elapsed: Duration) {
        let mut entry = self.timers.entry(timer).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
    }
}
