mod mqtt;
pub mod pubnub;
pub mod thethings;

pub use mqtt::{MqttSink, MqttSinkSettings, MqttTls};
pub use pubnub::PubNubSink;
pub use thethings::TheThingsSink;

use crate::error::TransmissionError;
use crate::policy::{PolicyScope, ScopedPolicy, SendPolicy};
use crate::reading::Reading;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

/// A cloud destination able to take readings.
#[async_trait]
pub trait CloudSink: Send + Sync {
    /// Identity recorded next to stored readings this sink accepted.
    fn name(&self) -> &str;

    async fn transmit(&self, reading: &Reading, device_name: &str)
        -> Result<(), TransmissionError>;

    async fn close(&self) {}
}

/// A cloud destination paired with its send policy.
pub struct SinkAdapter {
    sink: Box<dyn CloudSink>,
    policy: Mutex<ScopedPolicy>,
}

impl SinkAdapter {
    pub fn new(sink: Box<dyn CloudSink>, policy: SendPolicy, scope: PolicyScope) -> Self {
        Self {
            sink,
            policy: Mutex::new(ScopedPolicy::new(policy, scope)),
        }
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    /// Transmits the reading if the policy allows it, returning this sink's
    /// identity when it did.
    pub async fn insert(
        &self,
        reading: &Reading,
        device_name: &str,
    ) -> Result<Option<&str>, TransmissionError> {
        let accepted = {
            let mut policy = self.policy.lock().unwrap_or_else(PoisonError::into_inner);
            policy.decide_at(reading, device_name, Instant::now())
        };
        if !accepted {
            tracing::debug!(sink = self.name(), device = device_name, "policy held back reading");
            return Ok(None);
        }
        self.sink.transmit(reading, device_name).await?;
        Ok(Some(self.sink.name()))
    }

    pub async fn close(&self) {
        self.sink.close().await;
    }
}

impl std::fmt::Debug for SinkAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkAdapter")
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}
