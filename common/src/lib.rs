pub mod engine;
pub mod types;

pub use engine::{
    fan_demand, present_output, Engine, Evaluation, FanCommand, OutputPlan, HYSTERESIS_DEFAULT,
};
pub use types::{
    BlowerMode, ParseModeError, RelayId, RelaySnapshot, RelayStatus, ResetFlags, StatusPayload,
    ThermostatMode, ThermostatState, OUT_OF_SERVICE,
};
