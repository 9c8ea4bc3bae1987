//! CI backpressure: wait for the shared build farm's queue to drain.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::ThrottleConfig;
use crate::traits::{CollaboratorError, CollaboratorResult, LoadSignal};

/// Blocks batch progress while the external queue is above threshold.
///
/// The wait is unbounded and does not back off: the queue is assumed to
/// always drain eventually. An unreachable signal does not block.
pub struct Throttle<S: LoadSignal> {
    signal: S,
    threshold: u64,
    interval: Duration,
}

impl<S: LoadSignal> Throttle<S> {
    pub fn new(signal: S) -> Self {
        Self {
            signal,
            threshold: 2,
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Polls until the queue depth is at or below threshold.
    ///
    /// Returns the number of times it slept.
    #[instrument(skip(self))]
    pub async fn wait_for_capacity(&self) -> u32 {
        let mut waits = 0;
        loop {
            match self.signal.queue_depth().await {
                Ok(depth) if depth <= self.threshold => return waits,
                Ok(depth) => {
                    info!(
                        depth,
                        threshold = self.threshold,
                        wait_secs = self.interval.as_secs(),
                        "Build farm busy, waiting"
                    );
                    tokio::time::sleep(self.interval).await;
                    waits += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Queue depth unavailable, proceeding");
                    return waits;
                }
            }
        }
    }
}

/// Queue depth read from a JSON document over HTTP.
pub struct HttpLoadSignal {
    client: reqwest::Client,
    url: String,
    pointer: String,
}

impl HttpLoadSignal {
    pub fn new(client: reqwest::Client, config: &ThrottleConfig) -> Self {
        Self {
            client,
            url: config.signal_url.clone(),
            pointer: config.signal_pointer.clone(),
        }
    }
}

#[async_trait]
impl LoadSignal for HttpLoadSignal {
    async fn queue_depth(&self) -> CollaboratorResult<u64> {
        let body: serde_json::Value = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        body.pointer(&self.pointer)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                CollaboratorError::UnexpectedOutput(format!(
                    "no unsigned integer at {} in {}",
                    self.pointer, self.url
                ))
            })
    }
}
