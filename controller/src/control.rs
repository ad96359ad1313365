//! The 1 Hz control loop and its handle.
//!
//! The loop owns the hardware (relay bank, sensor, fan) on a dedicated
//! thread. Settings flow in through lock-free cells on [`ControlHandle`];
//! until every cell is populated and the sensor has produced a reading the
//! loop abstains from commanding relays and reports out-of-service instead.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use thermostat_common::{
    fan_demand, present_output, BlowerMode, Engine, FanCommand, OutputPlan, RelayId, RelayStatus,
    StatusPayload, ThermostatMode, ThermostatState,
};

use crate::config::ThermostatConfig;
use crate::fan::FanDriver;
use crate::mqtt::{Mqtt, StatusSink};
use crate::relays::{RelayBank, RelayControl};
use crate::sht3x::{Sht3x, Units};

const TICK_PERIOD: Duration = Duration::from_secs(1);
const RELAY_FAULT_BACKOFF: Duration = Duration::from_secs(1);

const MODE_UNSET: u8 = u8::MAX;

/// Setting cells written by the MQTT side, read by the loop. Floats are
/// stored as bit patterns with NaN meaning not yet set.
struct Shared {
    mode: AtomicU8,
    blower: AtomicU8,
    heat: AtomicU64,
    cool: AtomicU64,
    stop: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            mode: AtomicU8::new(MODE_UNSET),
            blower: AtomicU8::new(blower_to_u8(BlowerMode::Auto)),
            heat: AtomicU64::new(f64::NAN.to_bits()),
            cool: AtomicU64::new(f64::NAN.to_bits()),
            stop: AtomicBool::new(false),
        }
    }

    fn mode(&self) -> Option<ThermostatMode> {
        mode_from_u8(self.mode.load(Ordering::Relaxed))
    }

    fn blower(&self) -> BlowerMode {
        blower_from_u8(self.blower.load(Ordering::Relaxed))
    }

    fn heat(&self) -> Option<f64> {
        load_setpoint(&self.heat)
    }

    fn cool(&self) -> Option<f64> {
        load_setpoint(&self.cool)
    }
}

fn load_setpoint(cell: &AtomicU64) -> Option<f64> {
    let value = f64::from_bits(cell.load(Ordering::Relaxed));
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}

fn mode_to_u8(mode: ThermostatMode) -> u8 {
    match mode {
        ThermostatMode::Off => 0,
        ThermostatMode::Auto => 1,
        ThermostatMode::Heat => 2,
        ThermostatMode::Cool => 3,
    }
}

fn mode_from_u8(raw: u8) -> Option<ThermostatMode> {
    match raw {
        0 => Some(ThermostatMode::Off),
        1 => Some(ThermostatMode::Auto),
        2 => Some(ThermostatMode::Heat),
        3 => Some(ThermostatMode::Cool),
        _ => None,
    }
}

fn blower_to_u8(blower: BlowerMode) -> u8 {
    match blower {
        BlowerMode::Auto => 0,
        BlowerMode::On => 1,
    }
}

fn blower_from_u8(raw: u8) -> BlowerMode {
    if raw == 0 {
        BlowerMode::Auto
    } else {
        BlowerMode::On
    }
}

/// Cheap clonable handle for pushing settings into the running loop.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub fn set_mode(&self, mode: ThermostatMode) {
        self.shared.mode.store(mode_to_u8(mode), Ordering::Relaxed);
    }

    pub fn set_blower(&self, blower: BlowerMode) {
        self.shared
            .blower
            .store(blower_to_u8(blower), Ordering::Relaxed);
    }

    pub fn set_heat(&self, celsius: f64) {
        self.shared.heat.store(celsius.to_bits(), Ordering::Relaxed);
    }

    pub fn set_cool(&self, celsius: f64) {
        self.shared.cool.store(celsius.to_bits(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (Option<ThermostatMode>, BlowerMode, Option<f64>, Option<f64>)
    {
        (
            self.shared.mode(),
            self.shared.blower(),
            self.shared.heat(),
            self.shared.cool(),
        )
    }
}

/// Hardware owned by the loop thread, handed back on join for the ordered
/// shutdown sequence.
struct Plant {
    relays: RelayBank,
    sensor: Sht3x,
    fan: FanDriver,
}

pub struct Control {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Plant>>,
}

impl Control {
    pub fn new(config: &ThermostatConfig, sink: Mqtt) -> anyhow::Result<Self> {
        info!("using {} temperature samples", config.temp_samples);
        info!(
            "using {:.4}C of temperature hysteresis",
            config.temp_hysteresis
        );

        let sensor = Sht3x::new(&config.sht3x_device, config.sht3x_mode, config.temp_samples)?;
        let relays = RelayBank::new(&config.i2c_device, config.relay_address);
        let fan = FanDriver::new(&config.fan());
        let plant = Plant {
            relays,
            sensor,
            fan,
        };

        let shared = Arc::new(Shared::new());
        let hysteresis = config.temp_hysteresis;
        let pwm_duty = config.fan_pwm_duty;
        let thread = thread::Builder::new().name("control".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || run_loop(&shared, plant, &sink, hysteresis, pwm_duty)
        })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops the loop and powers everything down: relays forced off and the
    /// bus closed, then the sensor thread, then the fan.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let Some(thread) = self.thread.take() else {
            return;
        };
        match thread.join() {
            Ok(mut plant) => {
                if let Err(err) = plant.relays.relay_all_off() {
                    error!("failed to force relays off at shutdown: {err}");
                }
                plant.relays.close();
                plant.sensor.stop();
                plant.fan.off();
            }
            Err(_) => error!("control thread panicked"),
        }
    }
}

fn run_loop(
    shared: &Shared,
    mut plant: Plant,
    sink: &Mqtt,
    hysteresis: f64,
    pwm_duty: u8,
) -> Plant {
    plant.fan.on();
    plant.fan.set_pwm_duty(pwm_duty);

    let mut state = LoopState::new(hysteresis);
    while !shared.stop.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        if let Some(rpm) = plant.fan.get_rpm() {
            debug!("fan rpm = {rpm}");
        }

        let inputs = TickInputs {
            temperature: plant.sensor.temperature(Units::Celsius),
            humidity: plant.sensor.humidity(),
            mode: shared.mode(),
            blower: shared.blower(),
            heat_setpoint: shared.heat(),
            cool_setpoint: shared.cool(),
        };

        if run_tick(&mut state, &mut plant.relays, sink, &inputs) == TickOutcome::RelayFault {
            thread::sleep(RELAY_FAULT_BACKOFF);
            continue;
        }

        let elapsed = tick_start.elapsed();
        match TICK_PERIOD.checked_sub(elapsed) {
            Some(remaining) => thread::sleep(remaining),
            None => debug!(
                "tick ran {:.3}s long",
                (elapsed - TICK_PERIOD).as_secs_f64()
            ),
        }
    }

    sink.publish_out_of_service();
    plant
}

struct LoopState {
    engine: Engine,
    last_status: Option<StatusPayload>,
    out_of_service: bool,
}

impl LoopState {
    fn new(hysteresis: f64) -> Self {
        Self {
            engine: Engine::new(hysteresis),
            // Out-of-service from birth: nothing is published until the
            // first complete reading, so there is no transition to report.
            last_status: None,
            out_of_service: true,
        }
    }
}

struct TickInputs {
    temperature: Option<f64>,
    humidity: f64,
    mode: Option<ThermostatMode>,
    blower: BlowerMode,
    heat_setpoint: Option<f64>,
    cool_setpoint: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Completed,
    RelayFault,
}

/// Presentation rounding: status temperatures carry three decimals,
/// humidity one.
fn round_temperature(celsius: f64) -> f64 {
    ((celsius + 0.0001) * 1000.0).round() / 1000.0
}

fn round_humidity(percent: f64) -> f64 {
    ((percent + 0.01) * 10.0).round() / 10.0
}

fn exec_on<R: RelayControl>(relays: &mut R, relay: RelayId) -> RelayStatus {
    match relays.relay_on(relay) {
        Ok(status) => status,
        Err(err) => {
            error!("{} on command failed: {err}", relay.as_str());
            RelayStatus::Locked
        }
    }
}

fn exec_off<R: RelayControl>(relays: &mut R, relay: RelayId) -> RelayStatus {
    match relays.relay_off(relay) {
        Ok(status) => status,
        Err(err) => {
            error!("{} off command failed: {err}", relay.as_str());
            RelayStatus::On
        }
    }
}

fn run_tick<R: RelayControl, S: StatusSink>(
    state: &mut LoopState,
    relays: &mut R,
    sink: &S,
    inputs: &TickInputs,
) -> TickOutcome {
    let snapshot = match relays.get_status() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!("relay status read failed: {err}");
            return TickOutcome::RelayFault;
        }
    };
    debug!(
        "fan::{} heat::{} cool::{}",
        snapshot.fan.as_str(),
        snapshot.heat.as_str(),
        snapshot.cool.as_str()
    );

    if !snapshot.reset.is_clear() {
        warn!("relay controller was reset ({})", snapshot.reset);
        match relays.reset_mcusr() {
            Ok(flags) if !flags.is_clear() => {
                error!("relay controller reset flags did not clear ({flags})");
            }
            Ok(_) => {}
            Err(err) => error!("failed to acknowledge relay controller reset: {err}"),
        }
    }

    let (Some(temperature), Some(mode), Some(heat_setpoint), Some(cool_setpoint)) = (
        inputs.temperature,
        inputs.mode,
        inputs.heat_setpoint,
        inputs.cool_setpoint,
    ) else {
        if !state.out_of_service {
            state.out_of_service = true;
            sink.publish_out_of_service();
        }
        return TickOutcome::Completed;
    };

    let temperature = round_temperature(temperature);
    let humidity = round_humidity(inputs.humidity);
    debug!("temperature {temperature:.3}C, humidity {humidity:.1}%");

    let evaluation = state
        .engine
        .evaluate(mode, heat_setpoint, cool_setpoint, temperature, &snapshot);
    match evaluation.conflict {
        Some(ThermostatState::Cooling) => warn!("cooling wanted while heat is on"),
        Some(ThermostatState::Heating) => warn!("heating wanted while cooling is on"),
        _ => {}
    }

    let last_output = state.last_status.as_ref().map(|s| s.output);
    let last_state = state.last_status.as_ref().map(|s| s.state);
    let last_fan_state = state.last_status.as_ref().map(|s| s.fan_state);

    let mut output = present_output(&snapshot);
    match evaluation.plan {
        OutputPlan::Release { cool, heat } => {
            if cool {
                output = exec_off(relays, RelayId::Cool);
                if Some(output) != last_output {
                    info!("cooling turned off");
                }
            }
            if heat {
                output = exec_off(relays, RelayId::Heat);
                if Some(output) != last_output {
                    info!("heating turned off");
                }
            }
        }
        OutputPlan::HoldLocked => {
            output = RelayStatus::Locked;
            if Some(output) != last_output {
                match evaluation.state {
                    ThermostatState::Cooling => info!("cooling is currently locked out"),
                    ThermostatState::Heating => info!("heating is currently locked out"),
                    ThermostatState::Idle => {}
                }
            }
        }
        OutputPlan::Engage(relay) => {
            output = exec_on(relays, relay);
            let verb = match relay {
                RelayId::Cool => "cooling",
                RelayId::Heat => "heating",
                RelayId::Fan => "fan",
            };
            if Some(evaluation.state) != last_state {
                info!(
                    "{verb} engaged at {temperature:.3}C with relay status {}",
                    output.as_str()
                );
            } else if Some(output) != last_output {
                info!("{verb} relay changed status to {}", output.as_str());
            }
        }
    }

    let mut fan_state = snapshot.fan;
    match fan_demand(evaluation.state, output, inputs.blower, snapshot.fan) {
        Some(FanCommand::On) => {
            fan_state = exec_on(relays, RelayId::Fan);
            if last_fan_state != Some(RelayStatus::On) {
                info!("fan turned on with relay status {}", fan_state.as_str());
            }
        }
        Some(FanCommand::Off) => {
            fan_state = exec_off(relays, RelayId::Fan);
            info!("fan turned off");
        }
        None => {}
    }

    let payload = StatusPayload {
        temperature,
        humidity,
        state: evaluation.state,
        output,
        fan: inputs.blower,
        fan_state,
    };
    if state.last_status.as_ref() != Some(&payload) {
        sink.publish_status(&payload);
        state.last_status = Some(payload);
        state.out_of_service = false;
    }

    TickOutcome::Completed
}
