//! Per-node metrics: a fixed registry of counters, latencies and
//! gauges, a periodic tracker that logs a JSON summary, and an optional
//! StatsD-compatible UDP push.

mod statsd;

pub use statsd::StatsdSink;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Metric names known at startup. `add` on anything else is a
// programmer error.
pub const GET_COUNT: &str = "get.n";
pub const GET_LATENCY: &str = "get.ns";
pub const GET_BPS: &str = "get.bps";
pub const PUT_COUNT: &str = "put.n";
pub const PUT_LATENCY: &str = "put.ns";
pub const ERR_COUNT: &str = "err.n";
pub const ERR_CKSUM_COUNT: &str = "err.cksum.n";
pub const LRU_EVICT_COUNT: &str = "lru.evict.n";
pub const LRU_EVICT_BYTES: &str = "lru.evict.bytes";
pub const EC_ENCODE_COUNT: &str = "ec.encode.n";
pub const EC_RESTORE_COUNT: &str = "ec.restore.n";
pub const EC_RESTORE_LATENCY: &str = "ec.restore.ns";
pub const TX_COUNT: &str = "tx.n";
pub const TX_BYTES: &str = "tx.bytes";
pub const RX_COUNT: &str = "rx.n";
pub const RX_BYTES: &str = "rx.bytes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Monotonic counter.
    Counter,
    /// Cumulative nanoseconds plus a sample count; each log tick emits
    /// the mean since the previous tick and resets.
    Latency,
    /// Last-value gauge (throughput, queue length).
    Gauge,
}

struct Metric {
    kind: Kind,
    value: AtomicI64,
    // Sample count; latency metrics only.
    count: AtomicI64,
}

/// Fixed-at-startup metrics table. All mutation is atomic; the table
/// itself is immutable after construction.
pub struct Registry {
    metrics: HashMap<&'static str, Metric>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            metrics: HashMap::new(),
        }
    }

    /// The registry with every core target metric pre-registered.
    pub fn standard() -> Arc<Registry> {
        let mut b = Registry::builder();
        for name in [
            GET_COUNT,
            PUT_COUNT,
            ERR_COUNT,
            ERR_CKSUM_COUNT,
            LRU_EVICT_COUNT,
            LRU_EVICT_BYTES,
            EC_ENCODE_COUNT,
            EC_RESTORE_COUNT,
            TX_COUNT,
            TX_BYTES,
            RX_COUNT,
            RX_BYTES,
        ] {
            b = b.register(name, Kind::Counter);
        }
        for name in [GET_LATENCY, PUT_LATENCY, EC_RESTORE_LATENCY] {
            b = b.register(name, Kind::Latency);
        }
        b = b.register(GET_BPS, Kind::Gauge);
        b.build()
    }

    fn get(&self, name: &str) -> Option<&Metric> {
        let m = self.metrics.get(name);
        if m.is_none() {
            debug_assert!(false, "metric {name} was never registered");
            tracing::error!(name, "add to unregistered metric");
        }
        m
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, val: i64) {
        if let Some(m) = self.get(name) {
            match m.kind {
                Kind::Counter | Kind::Latency => {
                    m.value.fetch_add(val, Ordering::Relaxed);
                    if m.kind == Kind::Latency {
                        m.count.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Kind::Gauge => m.value.store(val, Ordering::Relaxed),
            }
        }
    }

    pub fn add_latency(&self, name: &str, took: Duration) {
        self.add(name, took.as_nanos() as i64);
    }

    pub fn value(&self, name: &str) -> i64 {
        self.metrics
            .get(name)
            .map_or(0, |m| m.value.load(Ordering::Relaxed))
    }

    /// Snapshot all metrics for one log tick. Latency metrics report
    /// the mean over the interval and reset their accumulators.
    pub fn snapshot_and_reset(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        for (name, m) in &self.metrics {
            let val = match m.kind {
                Kind::Counter | Kind::Gauge => m.value.load(Ordering::Relaxed),
                Kind::Latency => {
                    let total = m.value.swap(0, Ordering::Relaxed);
                    let count = m.count.swap(0, Ordering::Relaxed);
                    if count == 0 {
                        continue; // nothing measured this interval
                    }
                    total / count
                }
            };
            out.insert(name.to_string(), serde_json::Value::from(val));
        }
        out
    }

    fn iter_for_push(&self) -> impl Iterator<Item = (&'static str, Kind, i64, i64)> + '_ {
        self.metrics.iter().map(|(name, m)| {
            (
                *name,
                m.kind,
                m.value.load(Ordering::Relaxed),
                m.count.load(Ordering::Relaxed),
            )
        })
    }
}

pub struct RegistryBuilder {
    metrics: HashMap<&'static str, Metric>,
}

impl RegistryBuilder {
    pub fn register(mut self, name: &'static str, kind: Kind) -> RegistryBuilder {
        self.metrics.insert(
            name,
            Metric {
                kind,
                value: AtomicI64::new(0),
                count: AtomicI64::new(0),
            },
        );
        self
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            metrics: self.metrics,
        })
    }
}

/// Periodic stats logger. Runs until the stop signal resolves.
pub async fn track(
    registry: Arc<Registry>,
    period: Duration,
    sink: Option<StatsdSink>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(sink) = &sink {
                    sink.push(&registry).await;
                }
                let snap = registry.snapshot_and_reset();
                if !snap.is_empty() {
                    tracing::info!(stats = %serde_json::Value::Object(snap), "periodic stats");
                }
            }
            _ = stop.changed() => {
                tracing::debug!("stats tracker stopping");
                return;
            }
        }
    }
}
