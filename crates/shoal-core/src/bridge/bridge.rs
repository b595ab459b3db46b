use crate::error::ShoalError;
use crate::notify::hub::SessionEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    failed: AtomicU64,
}

/// Cross-process event delivery for split deployments: the RPC process
/// posts each change event to the push process, which feeds its own hub.
///
/// Strictly best-effort. Failures are logged and counted but never reach
/// the caller that appended the message.
pub struct BroadcastBridge {
    client: reqwest::Client,
    base_url: String,
    counters: Arc<Counters>,
}

impl BroadcastBridge {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ShoalError> {
        let client = reqwest::Client::builder()
            .timeout(BRIDGE_TIMEOUT)
            .build()
            .map_err(|e| ShoalError::Config(format!("broadcast bridge client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Fire-and-forget `POST /broadcast/{session_id}`.
    pub fn forward(&self, event: SessionEvent) {
        let client = self.client.clone();
        let counters = Arc::clone(&self.counters);
        let url = format!(
            "{}/broadcast/{}",
            self.base_url.trim_end_matches('/'),
            event.session_id
        );
        tokio::spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(response) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        status = %response.status(),
                        session_id = %event.session_id,
                        "broadcast bridge rejected event"
                    );
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        session_id = %event.session_id,
                        "broadcast bridge unreachable"
                    );
                }
            }
        });
    }

    /// `(forwarded, failed)` counters for the telemetry surface.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.counters.forwarded.load(Ordering::Relaxed),
            self.counters.failed.load(Ordering::Relaxed),
        )
    }
}
