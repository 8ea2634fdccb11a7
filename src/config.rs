use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::acquisition::AcquisitionClient;
use crate::axis::{Axis, AxisSettings, CommandTimeouts};
use crate::error::AcqError;
use crate::scan::ScanPlan;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub axes: AxesConfig,
    pub motion: MotionConfig,
    pub acquisition: AcquisitionEndpointConfig,
    pub scan: ScanPlan,
    pub output: OutputConfig,
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.axes.x.validate("axes.x")?;
        self.axes.y.validate("axes.y")?;
        self.motion.validate()?;
        self.acquisition.validate()?;
        self.scan
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid scan section: {e}")))?;

        log::LevelFilter::from_str(&self.console.verbosity).map_err(|_| {
            ConfigError::Message(format!(
                "console.verbosity must be one of off, error, warn, info, debug, trace (got {})",
                self.console.verbosity
            ))
        })?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AxesConfig {
    pub x: AxisConfig,
    pub y: AxisConfig,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            x: AxisConfig::from(AxisSettings::x()),
            y: AxisConfig::from(AxisSettings::y()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AxisConfig {
    /// Serial port of the axis controller; the axis stays disconnected when unset
    pub port: Option<String>,
    pub stage_id: u8,
    pub pulses_per_mm: u32,
    pub max_travel_mm: f64,
}

impl From<AxisSettings> for AxisConfig {
    fn from(settings: AxisSettings) -> Self {
        Self {
            port: None,
            stage_id: settings.stage_id,
            pulses_per_mm: settings.pulses_per_mm,
            max_travel_mm: settings.max_travel_mm,
        }
    }
}

impl AxisConfig {
    pub fn settings(&self, axis: Axis) -> AxisSettings {
        AxisSettings {
            axis,
            stage_id: self.stage_id,
            pulses_per_mm: self.pulses_per_mm,
            max_travel_mm: self.max_travel_mm,
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.pulses_per_mm == 0 {
            return Err(ConfigError::Message(format!(
                "{section}.pulses_per_mm must be greater than zero"
            )));
        }
        if !self.max_travel_mm.is_finite() || self.max_travel_mm <= 0.0 {
            return Err(ConfigError::Message(format!(
                "{section}.max_travel_mm must be positive, got: {}",
                self.max_travel_mm
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionConfig {
    pub step_timeout_ms: u64,
    pub execute_timeout_secs: u64,
    pub homing_timeout_secs: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 1000,
            execute_timeout_secs: 180,
            homing_timeout_secs: 180,
        }
    }
}

impl MotionConfig {
    pub fn timeouts(&self) -> CommandTimeouts {
        CommandTimeouts {
            step: Duration::from_millis(self.step_timeout_ms),
            execute: Duration::from_secs(self.execute_timeout_secs),
            homing: Duration::from_secs(self.homing_timeout_secs),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.step_timeout_ms == 0 || self.execute_timeout_secs == 0 || self.homing_timeout_secs == 0
        {
            return Err(ConfigError::Message(
                "motion timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcquisitionEndpointConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for AcquisitionEndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            connect_timeout_ms: 2000,
            response_timeout_ms: 2000,
        }
    }
}

impl AcquisitionEndpointConfig {
    pub fn client(&self) -> Result<AcquisitionClient, AcqError> {
        AcquisitionClient::builder()
            .host(&self.host)
            .port(self.port)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .response_timeout(Duration::from_millis(self.response_timeout_ms))
            .build()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "acquisition timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub directory: String,
    /// Also write peak and peak-to-peak PNGs next to each saved scan
    pub export_png: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "./data".to_string(),
            export_png: true,
        }
    }
}

impl OutputConfig {
    pub fn directory(&self) -> PathBuf {
        PathBuf::from(&self.directory)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["config.toml", "thz_scan.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Environment overrides, e.g. THZ_SCAN__AXES__X__PORT=/dev/ttyUSB0
    builder = builder.add_source(
        Environment::with_prefix("THZ_SCAN")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({e}), using defaults");
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();

        assert_eq!(config.axes.x.stage_id, 2);
        assert_eq!(config.axes.y.stage_id, 1);
        assert_eq!(config.acquisition.port, 8001);
        assert_eq!(config.scan, ScanPlan::default());
        assert_eq!(config.motion.timeouts().step, Duration::from_secs(1));
    }

    #[test]
    fn test_file_overrides_layer_on_defaults() {
        let file = write_config(
            r#"
            [axes.x]
            port = "/dev/ttyUSB1"

            [acquisition]
            port = 9001

            [scan]
            width = 20.0
            wait_time_secs = 0.25
            "#,
        );

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.axes.x.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.axes.x.pulses_per_mm, 2000);
        assert!(config.axes.y.port.is_none());
        assert_eq!(config.acquisition.port, 9001);
        assert_eq!(config.acquisition.host, "127.0.0.1");
        assert_eq!(config.scan.width, 20.0);
        assert_eq!(config.scan.height, 10.0);
        assert_eq!(config.scan.wait_time_secs, 0.25);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let file = write_config(
            r#"
            [axes.y]
            pulses_per_mm = 0
            "#,
        );
        assert!(load_config(Some(file.path())).is_err());

        let mut config = AppConfig::default();
        config.scan.step_x = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.console.verbosity = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = Path::new("/nonexistent/thz_scan.toml");
        assert!(load_config(Some(path)).is_err());

        let config = load_config_or_default(Some(path));
        assert_eq!(config.output.directory, "./data");
    }

    #[test]
    fn test_axis_settings_carry_axis() {
        let config = AppConfig::default();
        let settings = config.axes.y.settings(Axis::Y);
        assert_eq!(settings.axis, Axis::Y);
        assert_eq!(settings.stage_id, 1);
    }
}
