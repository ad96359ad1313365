use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::fan::FanConfig;
use crate::sht3x::MeasurementMode;

const TOPIC: &str = "thermostat";

pub const TEMP_SAMPLES_DEFAULT: usize = 150;
pub const TEMP_HYSTERESIS_DEFAULT: f64 = 0.2778;
pub const FAN_PWM_DUTY_DEFAULT: u8 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("temp-samples must be at least 1")]
    NoSamples,
    #[error("relay-address {0:#04x} is not a 7-bit i2c address")]
    RelayAddress(u16),
}

/// Static process configuration, parsed once at startup. Key names match
/// the JSON configuration file (kebab-case sections and keys).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub thermostat: ThermostatConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommonConfig {
    pub topic_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThermostatConfig {
    /// Sensor character device name under /dev.
    pub sht3x_device: String,
    #[serde(default)]
    pub sht3x_mode: MeasurementMode,
    /// I2C bus character device name under /dev.
    pub i2c_device: String,
    pub relay_address: u16,
    pub fan_pwr_gpio: u32,
    pub fan_rpm_gpio: Option<u32>,
    pub fan_pwm_channel: Option<u32>,
    pub fan_pwm_period: Option<u64>,
    #[serde(default = "default_fan_pwm_duty")]
    pub fan_pwm_duty: u8,
    pub settings_file: PathBuf,
    #[serde(default = "default_temp_samples")]
    pub temp_samples: usize,
    #[serde(default = "default_temp_hysteresis")]
    pub temp_hysteresis: f64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.thermostat.temp_samples < 1 {
            return Err(ConfigError::NoSamples);
        }
        if self.thermostat.relay_address > 0x7F {
            return Err(ConfigError::RelayAddress(self.thermostat.relay_address));
        }
        Ok(())
    }

    /// Status/command topic, prefixed with the optional shared topic root.
    pub fn topic(&self) -> String {
        match &self.common.topic_root {
            Some(root) => format!("{root}/{TOPIC}"),
            None => TOPIC.to_string(),
        }
    }
}

impl ThermostatConfig {
    pub fn fan(&self) -> FanConfig {
        FanConfig {
            power_gpio: self.fan_pwr_gpio,
            tach_gpio: self.fan_rpm_gpio,
            pwm_channel: self.fan_pwm_channel,
            pwm_period_ns: self.fan_pwm_period,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "thermostat".to_string()
}

fn default_fan_pwm_duty() -> u8 {
    FAN_PWM_DUTY_DEFAULT
}

fn default_temp_samples() -> usize {
    TEMP_SAMPLES_DEFAULT
}

fn default_temp_hysteresis() -> f64 {
    TEMP_HYSTERESIS_DEFAULT
}
