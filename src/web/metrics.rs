use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::db::CacheStats;

/// Process counters, constructed once in `main` and shared by reference.
pub struct BridgeMetrics {
    started_at: Instant,
    webhooks_received: AtomicU64,
    rejected_signature: AtomicU64,
    rejected_decode: AtomicU64,
    events_routed: AtomicU64,
    events_ignored: AtomicU64,
    viber_forward_failures: AtomicU64,
    matrix_forwarded: AtomicU64,
    matrix_forward_failures: AtomicU64,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            webhooks_received: AtomicU64::new(0),
            rejected_signature: AtomicU64::new(0),
            rejected_decode: AtomicU64::new(0),
            events_routed: AtomicU64::new(0),
            events_ignored: AtomicU64::new(0),
            viber_forward_failures: AtomicU64::new(0),
            matrix_forwarded: AtomicU64::new(0),
            matrix_forward_failures: AtomicU64::new(0),
        }
    }

    pub fn webhook_received(&self) {
        bump(&self.webhooks_received);
    }

    pub fn webhook_rejected_signature(&self) {
        bump(&self.rejected_signature);
    }

    pub fn webhook_rejected_decode(&self) {
        bump(&self.rejected_decode);
    }

    pub fn event_routed(&self) {
        bump(&self.events_routed);
    }

    pub fn event_ignored(&self) {
        bump(&self.events_ignored);
    }

    pub fn viber_forward_failed(&self) {
        bump(&self.viber_forward_failures);
    }

    pub fn matrix_forwarded(&self) {
        bump(&self.matrix_forwarded);
    }

    pub fn matrix_forward_failed(&self) {
        bump(&self.matrix_forward_failures);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            webhooks_received: load(&self.webhooks_received),
            rejected_signature: load(&self.rejected_signature),
            rejected_decode: load(&self.rejected_decode),
            events_routed: load(&self.events_routed),
            events_ignored: load(&self.events_ignored),
            viber_forward_failures: load(&self.viber_forward_failures),
            matrix_forwarded: load(&self.matrix_forwarded),
            matrix_forward_failures: load(&self.matrix_forward_failures),
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self, cache: Option<CacheStats>) -> String {
        let s = self.snapshot();
        let cache = cache.unwrap_or_default();
        let mut out = String::new();

        let mut family = |name: &str, kind: &str, help: &str, samples: &[(&str, u64)]| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for (labels, value) in samples {
                let _ = writeln!(out, "{name}{labels} {value}");
            }
        };

        family(
            "viber_webhooks_received_total",
            "counter",
            "Webhook requests received from Viber",
            &[("", s.webhooks_received)],
        );
        family(
            "viber_webhooks_rejected_total",
            "counter",
            "Webhook requests rejected before dispatch",
            &[
                ("{reason=\"signature\"}", s.rejected_signature),
                ("{reason=\"decode\"}", s.rejected_decode),
            ],
        );
        family(
            "viber_events_routed_total",
            "counter",
            "Viber events forwarded to Matrix",
            &[("", s.events_routed)],
        );
        family(
            "viber_events_ignored_total",
            "counter",
            "Viber events acknowledged without forwarding",
            &[("", s.events_ignored)],
        );
        family(
            "viber_forward_failures_total",
            "counter",
            "Viber events that failed to reach Matrix",
            &[("", s.viber_forward_failures)],
        );
        family(
            "matrix_events_forwarded_total",
            "counter",
            "Matrix messages sent to Viber",
            &[("", s.matrix_forwarded)],
        );
        family(
            "matrix_forward_failures_total",
            "counter",
            "Matrix messages that failed to reach Viber",
            &[("", s.matrix_forward_failures)],
        );
        family(
            "mapping_cache_hits_total",
            "counter",
            "Room mapping cache hits",
            &[("", cache.hits)],
        );
        family(
            "mapping_cache_misses_total",
            "counter",
            "Room mapping cache misses",
            &[("", cache.misses)],
        );
        family(
            "bridge_uptime_seconds",
            "gauge",
            "Number of seconds the bridge has been running",
            &[("", self.uptime_seconds())],
        );
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub webhooks_received: u64,
    pub rejected_signature: u64,
    pub rejected_decode: u64,
    pub events_routed: u64,
    pub events_ignored: u64,
    pub viber_forward_failures: u64,
    pub matrix_forwarded: u64,
    pub matrix_forward_failures: u64,
}
