use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// Upper bounds in milliseconds. Lock requests block while contended, so the
// upper buckets are wide.
const BUCKET_BOUNDS_MS: [f64; 8] = [1.0, 5.0, 10.0, 50.0, 100.0, 1_000.0, 10_000.0, f64::INFINITY];

#[derive(Default)]
pub struct EndpointMetrics {
    count: AtomicU64,
    total_duration_ms: AtomicU64,
    errors: AtomicU64,
    max_ms: AtomicU64,
    buckets: [AtomicU64; 8],
}

#[derive(Debug)]
pub struct EndpointSnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub errors: u64,
    pub max_ms: u64,
}

impl EndpointMetrics {
    pub fn record(&self, duration_ms: f64, is_error: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms as u64, Ordering::Relaxed);
        self.max_ms.fetch_max(duration_ms as u64, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| duration_ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len() - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_duration_ms.load(Ordering::Relaxed);
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();

        EndpointSnapshot {
            count,
            avg_ms: if count > 0 { total as f64 / count as f64 } else { 0.0 },
            p50_ms: percentile(&counts, count, 0.50),
            p99_ms: percentile(&counts, count, 0.99),
            errors: self.errors.load(Ordering::Relaxed),
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Counters for the lock service: HTTP endpoints plus lock-protocol events.
pub struct Metrics {
    pub start_time: Instant,
    pub lock: EndpointMetrics,
    pub release: EndpointMetrics,
    pub status: EndpointMetrics,
    pub total_requests: AtomicU64,
    pub acquisitions: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub wakeups: AtomicU64,
    pub releases: AtomicU64,
    pub release_failures: AtomicU64,
    pub removal_events: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            lock: EndpointMetrics::default(),
            release: EndpointMetrics::default(),
            status: EndpointMetrics::default(),
            total_requests: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            release_failures: AtomicU64::new(0),
            removal_events: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, endpoint: &str, duration_ms: f64, is_error: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let endpoint_metrics = match endpoint {
            "lock" => &self.lock,
            "release" => &self.release,
            "status" => &self.status,
            _ => return,
        };
        endpoint_metrics.record(duration_ms, is_error);
    }

    pub fn record_lock_event(&self, event: LockEvent) {
        let counter = match event {
            LockEvent::Acquired => &self.acquisitions,
            LockEvent::FailedAttempt => &self.failed_attempts,
            LockEvent::Wakeup => &self.wakeups,
            LockEvent::Released => &self.releases,
            LockEvent::ReleaseFailed => &self.release_failures,
            LockEvent::RemovalObserved => &self.removal_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let uptime = self.start_time.elapsed().as_secs();

        json!({
            "uptime_seconds": uptime,
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "endpoints": {
                "lock": endpoint_to_json(&self.lock.snapshot()),
                "release": endpoint_to_json(&self.release.snapshot()),
                "status": endpoint_to_json(&self.status.snapshot()),
            },
            "locks": {
                "acquisitions": self.acquisitions.load(Ordering::Relaxed),
                "failed_attempts": self.failed_attempts.load(Ordering::Relaxed),
                "wakeups": self.wakeups.load(Ordering::Relaxed),
                "releases": self.releases.load(Ordering::Relaxed),
                "release_failures": self.release_failures.load(Ordering::Relaxed),
                "removal_events": self.removal_events.load(Ordering::Relaxed),
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    FailedAttempt,
    Wakeup,
    Released,
    ReleaseFailed,
    RemovalObserved,
}

fn endpoint_to_json(snapshot: &EndpointSnapshot) -> Value {
    json!({
        "count": snapshot.count,
        "avg_ms": format!("{:.1}", snapshot.avg_ms),
        "p50_ms": snapshot.p50_ms,
        "p99_ms": snapshot.p99_ms,
        "errors": snapshot.errors,
        "max_ms": snapshot.max_ms,
    })
}

fn percentile(bucket_counts: &[u64], total: u64, quantile: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let target = ((total as f64 * quantile).ceil() as u64).max(1);
    let mut cumulative = 0;
    for (i, count) in bucket_counts.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_BOUNDS_MS[i];
        }
    }
    BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1]
}
