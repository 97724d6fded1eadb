use crate::types::{Orientation, PixelRect};
use common::env_parse;
use std::time::Duration;

pub use common::Environment;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub environment: Environment,
    /// Frames the distributor may hold in flight at once.
    pub pool_capacity: usize,
    /// How long an unpaired frame or metadata bundle may wait for its
    /// counterpart.
    pub pairing_window: Duration,
    /// Watchdog deadline for a focus scan.
    pub scan_timeout: Duration,
    /// Deadline for correlating a still capture's frame with its metadata.
    pub capture_window: Duration,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub sensor_orientation: Orientation,
    pub device_orientation: Orientation,
    /// Exposure cadence of the synthetic device.
    pub frame_interval: Duration,
}

impl PipelineConfig {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        Self {
            environment: Environment::from_env(),
            pool_capacity: env_parse("CAPTURE_POOL_CAPACITY", 10),
            pairing_window: Duration::from_millis(env_parse("CAPTURE_PAIRING_WINDOW_MS", 500)),
            scan_timeout: Duration::from_millis(env_parse("CAPTURE_SCAN_TIMEOUT_MS", 3_000)),
            capture_window: Duration::from_millis(env_parse("CAPTURE_CAPTURE_WINDOW_MS", 1_000)),
            sensor_width: env_parse("CAPTURE_SENSOR_WIDTH", 4_000),
            sensor_height: env_parse("CAPTURE_SENSOR_HEIGHT", 3_000),
            sensor_orientation: Orientation::from_degrees(env_parse(
                "CAPTURE_SENSOR_ORIENTATION",
                90,
            )),
            device_orientation: Orientation::from_degrees(env_parse(
                "CAPTURE_DEVICE_ORIENTATION",
                0,
            )),
            frame_interval: Duration::from_millis(env_parse("CAPTURE_FRAME_INTERVAL_MS", 33)),
        }
    }

    /// Full active pixel array of the sensor.
    pub fn active_array(&self) -> PixelRect {
        PixelRect::full(self.sensor_width, self.sensor_height)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            pool_capacity: 10,
            pairing_window: Duration::from_millis(500),
            scan_timeout: Duration::from_millis(3_000),
            capture_window: Duration::from_millis(1_000),
            sensor_width: 4_000,
            sensor_height: 3_000,
            sensor_orientation: Orientation::Deg90,
            device_orientation: Orientation::Deg0,
            frame_interval: Duration::from_millis(33),
        }
    }
}
