use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Desired operating mode, supplied over the settings interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatMode {
    Off,
    Auto,
    Heat,
    Cool,
}

impl ThermostatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::Heat => "heat",
            Self::Cool => "cool",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown mode value '{0}'")]
pub struct ParseModeError(pub String);

impl FromStr for ThermostatMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            "heat" => Ok(Self::Heat),
            "cool" => Ok(Self::Cool),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Fan demand independent of heating/cooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlowerMode {
    Auto,
    On,
}

impl BlowerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::On => "on",
        }
    }
}

impl FromStr for BlowerMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "on" => Ok(Self::On),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Control state carried from tick to tick. Wire strings match the
/// published payload (`idle`/`heat`/`cool`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermostatState {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "heat")]
    Heating,
    #[serde(rename = "cool")]
    Cooling,
}

impl ThermostatState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Heating => "heat",
            Self::Cooling => "cool",
        }
    }
}

/// One of the three controllable outputs. The discriminant is the slot
/// index in the 4-byte relay vector; slot 0 is the reset-status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayId {
    Fan = 1,
    Heat = 2,
    Cool = 3,
}

impl RelayId {
    pub fn slot(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fan => "fan",
            Self::Heat => "heat",
            Self::Cool => "cool",
        }
    }
}

/// Status reported back by the relay controller. `Locked` is a
/// hardware-imposed minimum-off-time interlock; it is never commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Off,
    On,
    Locked,
}

impl RelayStatus {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::Locked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Locked => "locked",
        }
    }
}

/// Reset-cause bitmask from the relay microcontroller's MCUSR register.
/// Non-zero means the controller restarted and lost its interlock memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetFlags(pub u8);

impl ResetFlags {
    pub const POWER_ON: u8 = 0x01;
    pub const EXTERNAL: u8 = 0x02;
    pub const BROWN_OUT: u8 = 0x04;
    pub const WATCHDOG: u8 = 0x08;

    pub fn is_clear(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResetFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clear() {
            return write!(f, "none");
        }
        let mut causes = Vec::new();
        if self.0 & Self::POWER_ON != 0 {
            causes.push("power-on");
        }
        if self.0 & Self::EXTERNAL != 0 {
            causes.push("external");
        }
        if self.0 & Self::BROWN_OUT != 0 {
            causes.push("brown-out");
        }
        if self.0 & Self::WATCHDOG != 0 {
            causes.push("watchdog");
        }
        write!(f, "{}", causes.join("+"))
    }
}

/// Parsed 4-byte status vector from the relay controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub reset: ResetFlags,
    pub fan: RelayStatus,
    pub heat: RelayStatus,
    pub cool: RelayStatus,
}

impl RelaySnapshot {
    pub fn status_of(&self, relay: RelayId) -> RelayStatus {
        match relay {
            RelayId::Fan => self.fan,
            RelayId::Heat => self.heat,
            RelayId::Cool => self.cool,
        }
    }
}

/// Published status object. A new payload goes out only when it differs
/// field-wise from the last published one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub temperature: f64,
    pub humidity: f64,
    pub state: ThermostatState,
    pub output: RelayStatus,
    pub fan: BlowerMode,
    #[serde(rename = "fan-state")]
    pub fan_state: RelayStatus,
}

/// Payload published in place of a status object when required inputs are
/// unavailable; doubles as the MQTT last-will payload.
pub const OUT_OF_SERVICE: &str = "out-of-service";

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [
            ThermostatMode::Off,
            ThermostatMode::Auto,
            ThermostatMode::Heat,
            ThermostatMode::Cool,
        ] {
            assert_eq!(mode.as_str().parse::<ThermostatMode>().unwrap(), mode);
        }
        assert!("warm".parse::<ThermostatMode>().is_err());
    }

    #[test]
    fn relay_status_raw_values_match_protocol() {
        assert_eq!(RelayStatus::from_raw(0), Some(RelayStatus::Off));
        assert_eq!(RelayStatus::from_raw(1), Some(RelayStatus::On));
        assert_eq!(RelayStatus::from_raw(2), Some(RelayStatus::Locked));
        assert_eq!(RelayStatus::from_raw(3), None);
    }

    #[test]
    fn relay_slots_match_wire_order() {
        assert_eq!(RelayId::Fan.slot(), 1);
        assert_eq!(RelayId::Heat.slot(), 2);
        assert_eq!(RelayId::Cool.slot(), 3);
    }

    #[test]
    fn reset_flags_format_causes() {
        assert_eq!(ResetFlags(0).to_string(), "none");
        assert_eq!(ResetFlags(0x01).to_string(), "power-on");
        assert_eq!(ResetFlags(0x09).to_string(), "power-on+watchdog");
    }

    #[test]
    fn status_payload_wire_keys() {
        let payload = StatusPayload {
            temperature: 23.5,
            humidity: 40.0,
            state: ThermostatState::Cooling,
            output: RelayStatus::On,
            fan: BlowerMode::Auto,
            fan_state: RelayStatus::On,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["state"], "cool");
        assert_eq!(json["output"], "on");
        assert_eq!(json["fan"], "auto");
        assert_eq!(json["fan-state"], "on");
    }
}
