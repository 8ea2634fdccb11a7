//! Humidity readings recorded at the start and end of a scan.
//!
//! Decoding the sensor's line protocol happens elsewhere; the decoder pushes
//! its latest reading into a [`SharedHumidity`] and the scan reads it back.

use parking_lot::RwLock;
use std::sync::Arc;

pub trait HumiditySource: Send + Sync {
    /// Latest relative humidity in percent, if a sensor has reported one
    fn current_humidity(&self) -> Option<f64>;
}

/// Last reported value, shared between the sensor decoder and the scan
#[derive(Debug, Clone, Default)]
pub struct SharedHumidity(Arc<RwLock<Option<f64>>>);

impl SharedHumidity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, humidity: f64) {
        *self.0.write() = Some(humidity);
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }
}

impl HumiditySource for SharedHumidity {
    fn current_humidity(&self) -> Option<f64> {
        *self.0.read()
    }
}

/// Used when no sensor is attached
pub struct NoHumiditySensor;

impl HumiditySource for NoHumiditySensor {
    fn current_humidity(&self) -> Option<f64> {
        None
    }
}
