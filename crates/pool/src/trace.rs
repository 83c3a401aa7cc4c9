//! Time-bounded latency tracing.
//!
//! A [`TraceSession`] is an ephemeral observer: the dispatch loop records
//! how long each request waited between submission and hand-off, the
//! session stops accepting samples once its window elapses, and a
//! [`TraceReport`] summarizes what was seen. Tracing never affects
//! dispatch decisions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::clock::Micros;

/// Most recent samples kept per session; older ones are evicted.
const SAMPLE_CAPACITY: usize = 8_192;

// ── Samples ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Sample {
    label: &'static str,
    wait_micros: Micros,
}

/// Fixed-capacity sample buffer backed by `VecDeque`.
#[derive(Debug)]
struct SampleBuffer {
    buf: VecDeque<Sample>,
    capacity: usize,
}

impl SampleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(sample);
    }
}

// ── Session ──────────────────────────────────────────────────────────

struct Inner {
    id: Uuid,
    started: Instant,
    window: Duration,
    samples: Mutex<SampleBuffer>,
}

/// A clonable handle to one tracing session.
///
/// The dispatch loop holds one clone and records into it; any other clone
/// can pull a [`TraceReport`] at any time, including after expiry.
#[derive(Clone)]
pub struct TraceSession {
    inner: Arc<Inner>,
}

impl TraceSession {
    /// Start a session that accepts samples for `window`.
    pub fn start(window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                started: Instant::now(),
                window,
                samples: Mutex::new(SampleBuffer::new(SAMPLE_CAPACITY)),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether the observation window has elapsed.
    pub fn is_expired(&self) -> bool {
        self.inner.started.elapsed() >= self.inner.window
    }

    /// Record one request's queue-wait time.
    ///
    /// Returns `false` once the window has elapsed; the recorder should
    /// detach the session at that point.
    pub fn record(&self, label: &'static str, wait_micros: Micros) -> bool {
        if self.is_expired() {
            return false;
        }
        let mut samples = self.inner.samples.lock().expect("trace sample lock poisoned");
        samples.push(Sample { label, wait_micros });
        true
    }

    /// Summarize the recorded samples per label.
    pub fn report(&self) -> TraceReport {
        let samples = self.inner.samples.lock().expect("trace sample lock poisoned");

        let mut labels: HashMap<String, LabelStats> = HashMap::new();
        for sample in samples.buf.iter() {
            let stats = labels.entry(sample.label.to_string()).or_default();
            stats.observe(sample.wait_micros);
        }
        for stats in labels.values_mut() {
            stats.finish();
        }

        TraceReport {
            session: self.inner.id,
            elapsed_secs: self.inner.started.elapsed().as_secs_f64(),
            labels,
        }
    }
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("id", &self.inner.id)
            .field("window", &self.inner.window)
            .field("expired", &self.is_expired())
            .finish()
    }
}

// ── Report ───────────────────────────────────────────────────────────

/// Per-label wait-time statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LabelStats {
    pub count: u64,
    pub min_micros: Micros,
    pub max_micros: Micros,
    pub mean_micros: f64,
    #[serde(skip)]
    sum_micros: i128,
}

impl LabelStats {
    fn observe(&mut self, wait: Micros) {
        if self.count == 0 {
            self.min_micros = wait;
            self.max_micros = wait;
        } else {
            self.min_micros = self.min_micros.min(wait);
            self.max_micros = self.max_micros.max(wait);
        }
        self.count += 1;
        self.sum_micros += wait as i128;
    }

    fn finish(&mut self) {
        if self.count > 0 {
            self.mean_micros = self.sum_micros as f64 / self.count as f64;
        }
    }
}

/// Point-in-time summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub session: Uuid,
    pub elapsed_secs: f64,
    pub labels: HashMap<String, LabelStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reports_per_label() {
        let session = TraceSession::start(Duration::from_secs(60));
        assert!(session.record("call", 100));
        assert!(session.record("call", 300));
        assert!(session.record("cast", 50));

        let report = session.report();
        let call = &report.labels["call"];
        assert_eq!(call.count, 2);
        assert_eq!(call.min_micros, 100);
        assert_eq!(call.max_micros, 300);
        assert_eq!(call.mean_micros, 200.0);
        assert_eq!(report.labels["cast"].count, 1);
    }

    #[test]
    fn expired_session_rejects_samples() {
        let session = TraceSession::start(Duration::from_millis(0));
        assert!(session.is_expired());
        assert!(!session.record("call", 10));
        assert!(session.report().labels.is_empty());
    }

    #[test]
    fn sample_buffer_evicts_oldest() {
        let mut buf = SampleBuffer::new(2);
        for wait in [1, 2, 3] {
            buf.push(Sample {
                label: "call",
                wait_micros: wait,
            });
        }
        let waits: Vec<_> = buf.buf.iter().map(|s| s.wait_micros).collect();
        assert_eq!(waits, vec![2, 3]);
    }

    #[test]
    fn report_serializes_to_json() {
        let session = TraceSession::start(Duration::from_secs(60));
        session.record("sync_event", 42);
        let json = serde_json::to_value(session.report()).unwrap();
        assert_eq!(json["labels"]["sync_event"]["count"], 1);
    }

    #[test]
    fn clones_share_samples() {
        let session = TraceSession::start(Duration::from_secs(60));
        let recorder = session.clone();
        recorder.record("event", 7);
        assert_eq!(session.report().labels["event"].count, 1);
        assert_eq!(session.id(), recorder.id());
    }
}
