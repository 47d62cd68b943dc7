mod coap;
mod mote;
mod sim;

pub use mote::{MoteDevice, MoteSettings};
pub use sim::SimDevice;

use crate::error::DeviceReadError;
use crate::reading::Reading;
use async_trait::async_trait;

/// A pollable sensor.
#[async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    async fn get_data(&self) -> Result<Reading, DeviceReadError>;

    /// Releases the device connection. Safe to call more than once.
    async fn close(&self) -> Result<(), DeviceReadError> {
        Ok(())
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
