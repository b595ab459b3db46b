use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Ring of recent latency samples kept per tool.
const LATENCY_WINDOW: usize = 256;

struct ToolStats {
    calls: AtomicU64,
    errors: AtomicU64,
    latencies_us: Mutex<VecDeque<u64>>,
}

impl ToolStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies_us: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    fn lock_latencies(&self) -> MutexGuard<'_, VecDeque<u64>> {
        match self.latencies_us.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-tool operation counters: call count, error count, and latency
/// percentiles over a sliding window. Recording is cheap and lock-free on
/// the counter path; disabled recording is a no-op.
pub struct Metrics {
    tools: DashMap<String, ToolStats>,
    enabled: bool,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            tools: DashMap::new(),
            enabled,
        }
    }

    pub fn record(&self, tool: &str, elapsed: Duration, ok: bool) {
        if !self.enabled {
            return;
        }
        let stats = self.tools.entry(tool.to_string()).or_insert_with(ToolStats::new);
        stats.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = stats.lock_latencies();
        if latencies.len() >= LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(elapsed.as_micros() as u64);
    }

    /// Per-tool `{count, errors, error_rate, p50_ms, p95_ms}`.
    pub fn snapshot(&self) -> Value {
        let mut tools = serde_json::Map::new();
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();

        for name in names {
            let Some(stats) = self.tools.get(&name) else {
                continue;
            };
            let calls = stats.calls.load(Ordering::Relaxed);
            let errors = stats.errors.load(Ordering::Relaxed);
            let mut samples: Vec<u64> = stats.lock_latencies().iter().copied().collect();
            samples.sort_unstable();

            tools.insert(
                name,
                json!({
                    "count": calls,
                    "errors": errors,
                    "error_rate": if calls > 0 { errors as f64 / calls as f64 } else { 0.0 },
                    "p50_ms": percentile(&samples, 0.50) as f64 / 1000.0,
                    "p95_ms": percentile(&samples, 0.95) as f64 / 1000.0,
                }),
            );
        }

        Value::Object(tools)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
