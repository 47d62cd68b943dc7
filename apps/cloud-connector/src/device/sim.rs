use super::{round2, Device};
use crate::error::DeviceReadError;
use crate::reading::Reading;
use async_trait::async_trait;
use rand::Rng;

/// Simulated environment sensor.
#[derive(Debug, Clone)]
pub struct SimDevice {
    name: String,
}

impl SimDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Device for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_data(&self) -> Result<Reading, DeviceReadError> {
        let (temperature, humidity) = {
            let mut rng = rand::thread_rng();
            (
                round2(rng.gen_range(20.0..25.0)),
                round2(rng.gen_range(0.4..0.6)),
            )
        };
        tracing::trace!(device = %self.name, temperature, humidity, "simulated reading");
        Ok(Reading::new()
            .with("temperature", temperature)
            .with("humidity", humidity))
    }
}
