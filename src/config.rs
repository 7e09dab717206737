//! Configuration loading for the console.
//!
//! Strongly-typed settings loaded from:
//! 1. a TOML file (`scope_console.toml` by default)
//! 2. environment variables prefixed with `SCOPE_` (double underscore
//!    separates nesting, e.g. `SCOPE_APPLICATION__LOG_LEVEL=debug`)
//!
//! Values that pass parsing are still run through [`Settings::validate`] to
//! catch semantically invalid configurations (zero-sized sensors, negative
//! exposures) before any hardware is touched.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file next to the binary.
pub const DEFAULT_CONFIG_PATH: &str = "scope_console.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Simulated camera settings for the demo device core.
    #[serde(default)]
    pub camera: CameraSettings,
    /// Preview display settings.
    #[serde(default)]
    pub display: DisplaySettings,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name, used in window titles and logs.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Settings for the simulated camera behind the demo commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Camera device name, used in frame tags and channel names.
    #[serde(default = "default_camera_name")]
    pub name: String,
    /// Number of simultaneous camera channels.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Sensor width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Sensor height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,
    /// Exposure time in milliseconds.
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: f64,
    /// Active channel configuration preset (empty for none).
    #[serde(default)]
    pub config_name: String,
}

/// Settings for the headless preview display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaySettings {
    /// Simulated time to paint one image, in milliseconds.
    #[serde(default = "default_render_time_ms")]
    pub render_time_ms: u64,
}

fn default_app_name() -> String {
    "Microscope Console".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_camera_name() -> String {
    "MockCam".to_string()
}

fn default_channels() -> usize {
    1
}

fn default_width() -> u32 {
    512
}

fn default_height() -> u32 {
    512
}

fn default_exposure_ms() -> f64 {
    10.0
}

fn default_render_time_ms() -> u64 {
    15
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            name: default_camera_name(),
            channels: default_channels(),
            width: default_width(),
            height: default_height(),
            exposure_ms: default_exposure_ms(),
            config_name: String::new(),
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            render_time_ms: default_render_time_ms(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            camera: CameraSettings::default(),
            display: DisplaySettings::default(),
        }
    }
}

impl Settings {
    /// Load from the default file location plus environment overrides.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCOPE_").split("__"))
            .extract()
    }

    /// Validate values that parse but make no physical sense.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.camera.channels == 0 {
            return Err("camera.channels must be at least 1".to_string());
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err("camera resolution must be non-zero".to_string());
        }
        if self.camera.exposure_ms <= 0.0 {
            return Err(format!(
                "camera.exposure_ms must be positive, got {}",
                self.camera.exposure_ms
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.camera.channels, 1);
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
                [application]
                log_level = "debug"

                [camera]
                name = "PrimeBSI"
                channels = 2
                exposure_ms = 33.0
            "#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.camera.name, "PrimeBSI");
        assert_eq!(settings.camera.channels, 2);
        // Unspecified values fall back to defaults.
        assert_eq!(settings.camera.width, 512);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load_from("/nonexistent/scope_console.toml").unwrap();
        assert_eq!(settings.camera.name, "MockCam");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_exposure() {
        let mut settings = Settings::default();
        settings.camera.exposure_ms = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_channels() {
        let settings: Settings = toml::from_str(
            r#"
                [camera]
                channels = 0
            "#,
        )
        .unwrap();
        assert!(settings.validate().is_err());
    }
}
