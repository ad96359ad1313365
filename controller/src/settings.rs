//! Persistent thermostat settings and the MQTT command surface.
//!
//! Mode and setpoints survive restarts in a small JSON file; the blower
//! override is deliberately volatile and reverts to auto on restart.
//! Commands arrive on the `<topic>/action` subtopic as a `{"cmd", "result"}`
//! envelope and replies go out on the status topic in the same shape.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use thermostat_common::{BlowerMode, ThermostatMode};

use crate::control::ControlHandle;
use crate::mqtt::Mqtt;

/// Minimum cool-over-heat setpoint separation required in auto mode (2 °F).
pub const AUTO_SETPOINT_DELTA: f64 = 1.111;

const CMD_GET_SETTINGS: &str = "get-settings";
const CMD_PUT_SETTINGS: &str = "put-settings";
const CMD_GET_FAN: &str = "get-fan";
const CMD_PUT_FAN: &str = "put-fan";

const RESULT_OK: &str = "OK";
const RESULT_FAIL: &str = "FAIL";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(
        "auto mode requires the cool setpoint to sit at least \
         {AUTO_SETPOINT_DELTA}C above the heat setpoint"
    )]
    SetpointDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoints {
    pub heat: f64,
    pub cool: f64,
}

/// The durable half of the settings: everything except the blower override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredSettings {
    pub mode: ThermostatMode,
    pub setpoint: Setpoints,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            mode: ThermostatMode::Off,
            setpoint: Setpoints {
                heat: 22.22,
                cool: 23.889,
            },
        }
    }
}

impl StoredSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.mode == ThermostatMode::Auto
            && self.setpoint.cool - AUTO_SETPOINT_DELTA <= self.setpoint.heat
        {
            return Err(SettingsError::SetpointDelta);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    cmd: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FanSetting {
    fan: BlowerMode,
}

struct State {
    stored: StoredSettings,
    fan: BlowerMode,
}

pub struct Settings {
    mqtt: Mqtt,
    control: ControlHandle,
    action_topic: String,
    file: PathBuf,
    state: Mutex<State>,
}

impl Settings {
    /// Loads persisted settings (falling back to defaults on any problem)
    /// and pushes the initial values into the control loop.
    pub fn new(mqtt: Mqtt, control: ControlHandle, file: PathBuf) -> Self {
        let stored = match Self::load_file(&file) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(
                    "could not load settings from {}, using defaults: {err}",
                    file.display()
                );
                StoredSettings::default()
            }
        };

        let action_topic = format!("{}/action", mqtt.topic());
        let settings = Self {
            mqtt,
            control,
            action_topic,
            file,
            state: Mutex::new(State {
                stored,
                fan: BlowerMode::Auto,
            }),
        };
        settings.push_to_control();
        settings
    }

    fn load_file(file: &Path) -> anyhow::Result<StoredSettings> {
        let raw = fs::read(file)?;
        let stored: StoredSettings = serde_json::from_slice(&raw)?;
        stored.validate()?;
        Ok(stored)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_to_control(&self) {
        let state = self.lock();
        self.control.set_mode(state.stored.mode);
        self.control.set_heat(state.stored.setpoint.heat);
        self.control.set_cool(state.stored.setpoint.cool);
        self.control.set_blower(state.fan);
    }

    /// Called by the event loop on every (re)connect; subscriptions do not
    /// survive a broker session teardown.
    pub fn on_connect(&self) {
        info!("subscribing to {}", self.action_topic);
        self.mqtt.subscribe(&self.action_topic);
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.action_topic {
            return;
        }
        debug!("action message: {}", String::from_utf8_lossy(payload));

        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("discarding malformed action message: {err}");
                return;
            }
        };

        match envelope.cmd.as_str() {
            CMD_GET_SETTINGS => self.get_settings(),
            CMD_PUT_SETTINGS => self.put_settings(envelope.result),
            CMD_GET_FAN => self.get_fan(),
            CMD_PUT_FAN => self.put_fan(envelope.result),
            other => warn!("unknown action command {other:?}"),
        }
    }

    fn get_settings(&self) {
        let stored = self.lock().stored;
        self.reply(CMD_GET_SETTINGS, json!(stored));
    }

    fn put_settings(&self, result: serde_json::Value) {
        let stored: StoredSettings = match serde_json::from_value(result) {
            Ok(stored) => stored,
            Err(err) => {
                warn!("rejecting settings: {err}");
                return self.reply(CMD_PUT_SETTINGS, json!(RESULT_FAIL));
            }
        };
        if let Err(err) = stored.validate() {
            warn!("rejecting settings: {err}");
            return self.reply(CMD_PUT_SETTINGS, json!(RESULT_FAIL));
        }

        self.lock().stored = stored;
        self.push_to_control();
        self.save_file(&stored);
        info!(
            "settings changed: mode {}, heat {:.3}C, cool {:.3}C",
            stored.mode.as_str(),
            stored.setpoint.heat,
            stored.setpoint.cool
        );
        self.reply(CMD_PUT_SETTINGS, json!(RESULT_OK));
    }

    fn get_fan(&self) {
        let fan = self.lock().fan;
        self.reply(CMD_GET_FAN, json!(fan));
    }

    fn put_fan(&self, result: serde_json::Value) {
        let setting: FanSetting = match serde_json::from_value(result) {
            Ok(setting) => setting,
            Err(err) => {
                warn!("rejecting fan setting: {err}");
                return self.reply(CMD_PUT_FAN, json!(RESULT_FAIL));
            }
        };

        self.lock().fan = setting.fan;
        self.control.set_blower(setting.fan);
        info!("blower changed to {}", setting.fan.as_str());
        self.reply(CMD_PUT_FAN, json!(RESULT_OK));
    }

    fn save_file(&self, stored: &StoredSettings) {
        let result = serde_json::to_vec_pretty(stored)
            .map_err(anyhow::Error::from)
            .and_then(|encoded| fs::write(&self.file, encoded).map_err(anyhow::Error::from));
        if let Err(err) = result {
            warn!(
                "could not persist settings to {}: {err}",
                self.file.display()
            );
        }
    }

    fn reply(&self, cmd: &str, result: serde_json::Value) {
        self.mqtt.publish_value(&json!({ "cmd": cmd, "result": result }));
    }
}
