//! Best-effort HTTP delivery of recognition events.
//!
//! Each debounced recognition is POSTed once as JSON. Failures are logged
//! and dropped; nothing here ever blocks or fails the frame pipeline.

use rollcall_core::RecognitionEvent;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Deliveries allowed in flight before new events are dropped.
const MAX_IN_FLIGHT: usize = 8;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint answered {0}")]
    Status(u16),
}

#[derive(Clone)]
pub struct EventSink {
    client: reqwest::Client,
    endpoint: String,
    inflight: Arc<Semaphore>,
}

impl EventSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            inflight: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
        })
    }

    /// Deliver `event` in the background. Must be called within a Tokio runtime.
    pub fn dispatch(&self, event: RecognitionEvent) {
        let Ok(permit) = Arc::clone(&self.inflight).try_acquire_owned() else {
            tracing::warn!(name = %event.name, "event sink saturated; dropping event");
            return;
        };
        let sink = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match sink.deliver(&event).await {
                Ok(()) => tracing::debug!(name = %event.name, "event delivered"),
                Err(e) => tracing::warn!(name = %event.name, error = %e, "event delivery failed"),
            }
        });
    }

    /// POST `event` once. Any 2xx status is success.
    pub async fn deliver(&self, event: &RecognitionEvent) -> Result<(), SinkError> {
        let response = self.client.post(&self.endpoint).json(event).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status(status.as_u16()))
        }
    }
}
