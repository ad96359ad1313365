use crate::types::{
    BlowerMode, RelayId, RelaySnapshot, RelayStatus, ThermostatMode, ThermostatState,
};

/// Default temperature dead-band in Celsius (0.5 °F).
pub const HYSTERESIS_DEFAULT: f64 = 0.2778;

/// What the control loop should do with the heat/cool relays this tick.
/// The loop executes the plan against the relay bank and adopts whatever
/// status the hardware reports back as the published output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPlan {
    /// Idle: turn off whichever of the two conditioning relays is on.
    Release { cool: bool, heat: bool },
    /// Conditioning is wanted but an interlock on the opposing or fan
    /// relay has not cleared yet; report Locked and wait.
    HoldLocked,
    /// Command this relay on.
    Engage(RelayId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub state: ThermostatState,
    pub plan: OutputPlan,
    /// Set when the opposing relay was found On while this conditioning
    /// state was wanted; the state was forced back to Idle.
    pub conflict: Option<ThermostatState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanCommand {
    On,
    Off,
}

/// Output label derived from hardware feedback alone: On if either
/// conditioning relay is on, else Locked if either is locked, else Off.
pub fn present_output(relays: &RelaySnapshot) -> RelayStatus {
    if relays.cool == RelayStatus::On || relays.heat == RelayStatus::On {
        RelayStatus::On
    } else if relays.cool == RelayStatus::Locked || relays.heat == RelayStatus::Locked {
        RelayStatus::Locked
    } else {
        RelayStatus::Off
    }
}

/// Fan relay demand for one tick. The On condition wins over the Off
/// condition; `None` leaves the fan relay untouched.
pub fn fan_demand(
    state: ThermostatState,
    output: RelayStatus,
    blower: BlowerMode,
    fan_relay: RelayStatus,
) -> Option<FanCommand> {
    if (state != ThermostatState::Idle && output != RelayStatus::Locked)
        || blower == BlowerMode::On
    {
        return Some(FanCommand::On);
    }
    if state == ThermostatState::Idle
        && blower == BlowerMode::Auto
        && fan_relay == RelayStatus::On
    {
        return Some(FanCommand::Off);
    }
    None
}

/// The thermostat state machine. A Mealy machine: the next state is a
/// function of (carried state, mode, setpoints, temperature, hysteresis)
/// and the output plan additionally of the current relay feedback.
#[derive(Debug, Clone)]
pub struct Engine {
    state: ThermostatState,
    hysteresis: f64,
}

impl Engine {
    pub fn new(hysteresis: f64) -> Self {
        Self {
            state: ThermostatState::Idle,
            hysteresis,
        }
    }

    pub fn state(&self) -> ThermostatState {
        self.state
    }

    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    pub fn evaluate(
        &mut self,
        mode: ThermostatMode,
        heat_setpoint: f64,
        cool_setpoint: f64,
        temperature: f64,
        relays: &RelaySnapshot,
    ) -> Evaluation {
        let mut state = self.state;

        if mode == ThermostatMode::Off {
            state = ThermostatState::Idle;
        }

        // Cooling is evaluated before heating; re-engagement can override
        // the setpoint-satisfied transition within the same tick.
        if mode == ThermostatMode::Cool || mode == ThermostatMode::Auto {
            if (mode == ThermostatMode::Cool || state == ThermostatState::Cooling)
                && temperature <= cool_setpoint
            {
                state = ThermostatState::Idle;
            }
            if temperature >= cool_setpoint + self.hysteresis {
                state = ThermostatState::Cooling;
            }
        }

        if mode == ThermostatMode::Heat || mode == ThermostatMode::Auto {
            if (mode == ThermostatMode::Heat || state == ThermostatState::Heating)
                && temperature >= heat_setpoint
            {
                state = ThermostatState::Idle;
            }
            if temperature <= heat_setpoint - self.hysteresis {
                state = ThermostatState::Heating;
            }
        }

        // Heat and cool must never be simultaneously on. Finding the
        // opposing relay energized is an anomaly, not a fatal fault.
        let mut conflict = None;
        if state == ThermostatState::Cooling && relays.heat == RelayStatus::On {
            state = ThermostatState::Idle;
            conflict = Some(ThermostatState::Cooling);
        }
        if state == ThermostatState::Heating && relays.cool == RelayStatus::On {
            state = ThermostatState::Idle;
            conflict = Some(ThermostatState::Heating);
        }

        let plan = match state {
            ThermostatState::Idle => OutputPlan::Release {
                cool: relays.cool == RelayStatus::On,
                heat: relays.heat == RelayStatus::On,
            },
            ThermostatState::Cooling => {
                if relays.heat == RelayStatus::Locked || relays.fan == RelayStatus::Locked {
                    OutputPlan::HoldLocked
                } else {
                    OutputPlan::Engage(RelayId::Cool)
                }
            }
            ThermostatState::Heating => {
                if relays.cool == RelayStatus::Locked || relays.fan == RelayStatus::Locked {
                    OutputPlan::HoldLocked
                } else {
                    OutputPlan::Engage(RelayId::Heat)
                }
            }
        };

        self.state = state;
        Evaluation {
            state,
            plan,
            conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn all_off() -> RelaySnapshot {
        RelaySnapshot {
            reset: crate::types::ResetFlags(0),
            fan: RelayStatus::Off,
            heat: RelayStatus::Off,
            cool: RelayStatus::Off,
        }
    }

    #[test]
    fn cool_mode_engages_above_setpoint_plus_hysteresis() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let relays = all_off();

        // Rising from below the setpoint: idle until the dead-band is crossed.
        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 23.0, &relays);
        assert_eq!(eval.state, ThermostatState::Idle);

        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 24.1, &relays);
        assert_eq!(eval.state, ThermostatState::Idle);

        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 24.3, &relays);
        assert_eq!(eval.state, ThermostatState::Cooling);
        assert_eq!(eval.plan, OutputPlan::Engage(RelayId::Cool));
    }

    #[test]
    fn cooling_holds_until_temperature_falls_to_setpoint() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let relays = all_off();

        engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 24.3, &relays);
        assert_eq!(engine.state(), ThermostatState::Cooling);

        // Inside the dead-band cooling continues.
        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 24.1, &relays);
        assert_eq!(eval.state, ThermostatState::Cooling);

        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 24.0, &relays);
        assert_eq!(eval.state, ThermostatState::Idle);
    }

    #[test]
    fn heat_mode_mirrors_cool_mode() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let relays = all_off();

        let eval = engine.evaluate(ThermostatMode::Heat, 21.0, 24.0, 20.7, &relays);
        assert_eq!(eval.state, ThermostatState::Heating);
        assert_eq!(eval.plan, OutputPlan::Engage(RelayId::Heat));

        let eval = engine.evaluate(ThermostatMode::Heat, 21.0, 24.0, 20.9, &relays);
        assert_eq!(eval.state, ThermostatState::Heating);

        let eval = engine.evaluate(ThermostatMode::Heat, 21.0, 24.0, 21.0, &relays);
        assert_eq!(eval.state, ThermostatState::Idle);
    }

    #[test]
    fn auto_mode_never_engages_both_outputs() {
        // Sweep a temperature profile across both setpoints; with valid
        // setpoints (delta >= 2x hysteresis) the requested relay can never
        // oppose an energized one unless hardware feedback says so.
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let relays = all_off();
        let heat = 21.0;
        let cool = 24.0;

        let mut temp = 19.0;
        while temp < 26.0 {
            let eval = engine.evaluate(ThermostatMode::Auto, heat, cool, temp, &relays);
            match eval.plan {
                OutputPlan::Engage(RelayId::Cool) => {
                    assert!(temp >= cool, "cool engaged at {temp}")
                }
                OutputPlan::Engage(RelayId::Heat) => {
                    assert!(temp <= heat, "heat engaged at {temp}")
                }
                _ => {}
            }
            temp += 0.05;
        }
    }

    #[test]
    fn dead_band_between_setpoints_is_idempotent_idle() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let relays = all_off();

        for _ in 0..5 {
            let eval = engine.evaluate(ThermostatMode::Auto, 21.0, 24.0, 22.5, &relays);
            assert_eq!(eval.state, ThermostatState::Idle);
            assert_eq!(
                eval.plan,
                OutputPlan::Release {
                    cool: false,
                    heat: false
                }
            );
        }
    }

    #[test]
    fn mode_off_forces_idle_and_releases() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let mut relays = all_off();
        relays.cool = RelayStatus::On;

        engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 25.0, &relays);
        assert_eq!(engine.state(), ThermostatState::Cooling);

        let eval = engine.evaluate(ThermostatMode::Off, 21.0, 24.0, 25.0, &relays);
        assert_eq!(eval.state, ThermostatState::Idle);
        assert_eq!(
            eval.plan,
            OutputPlan::Release {
                cool: true,
                heat: false
            }
        );
    }

    #[test]
    fn lockout_on_opposing_relay_holds_cooling() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let mut relays = all_off();
        relays.heat = RelayStatus::Locked;

        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 25.0, &relays);
        assert_eq!(eval.state, ThermostatState::Cooling);
        assert_eq!(eval.plan, OutputPlan::HoldLocked);

        // Lockout clears: the same conditions now engage the relay.
        relays.heat = RelayStatus::Off;
        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 25.0, &relays);
        assert_eq!(eval.plan, OutputPlan::Engage(RelayId::Cool));
    }

    #[test]
    fn fan_lockout_holds_either_direction() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let mut relays = all_off();
        relays.fan = RelayStatus::Locked;

        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 25.0, &relays);
        assert_eq!(eval.plan, OutputPlan::HoldLocked);

        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let eval = engine.evaluate(ThermostatMode::Heat, 21.0, 24.0, 19.0, &relays);
        assert_eq!(eval.plan, OutputPlan::HoldLocked);
    }

    #[test]
    fn opposing_relay_on_is_a_conflict_forcing_idle() {
        let mut engine = Engine::new(HYSTERESIS_DEFAULT);
        let mut relays = all_off();
        relays.heat = RelayStatus::On;

        let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, 25.0, &relays);
        assert_eq!(eval.conflict, Some(ThermostatState::Cooling));
        assert_eq!(eval.state, ThermostatState::Idle);
        // The offending relay gets released by the Idle plan.
        assert_eq!(
            eval.plan,
            OutputPlan::Release {
                cool: false,
                heat: true
            }
        );
    }

    #[test]
    fn present_output_label_precedence() {
        let mut relays = all_off();
        assert_eq!(present_output(&relays), RelayStatus::Off);

        relays.heat = RelayStatus::Locked;
        assert_eq!(present_output(&relays), RelayStatus::Locked);

        relays.cool = RelayStatus::On;
        assert_eq!(present_output(&relays), RelayStatus::On);
    }

    #[test]
    fn fan_follows_conditioning_in_auto() {
        // Conditioning active: fan on.
        assert_eq!(
            fan_demand(
                ThermostatState::Cooling,
                RelayStatus::On,
                BlowerMode::Auto,
                RelayStatus::Off
            ),
            Some(FanCommand::On)
        );
        // Idle with the fan relay still on: fan off, regardless of prior state.
        assert_eq!(
            fan_demand(
                ThermostatState::Idle,
                RelayStatus::Off,
                BlowerMode::Auto,
                RelayStatus::On
            ),
            Some(FanCommand::Off)
        );
        // Idle with the fan already off: nothing to do.
        assert_eq!(
            fan_demand(
                ThermostatState::Idle,
                RelayStatus::Off,
                BlowerMode::Auto,
                RelayStatus::Off
            ),
            None
        );
    }

    #[test]
    fn fan_untouched_while_output_locked() {
        assert_eq!(
            fan_demand(
                ThermostatState::Cooling,
                RelayStatus::Locked,
                BlowerMode::Auto,
                RelayStatus::Off
            ),
            None
        );
    }

    #[test]
    fn blower_on_wins_over_idle_off() {
        assert_eq!(
            fan_demand(
                ThermostatState::Idle,
                RelayStatus::Off,
                BlowerMode::On,
                RelayStatus::On
            ),
            Some(FanCommand::On)
        );
    }

    #[test]
    fn cool_scenario_rising_through_dead_band() {
        // mode=Cool, cool=24.0, hysteresis=0.2778; temperature rises
        // 23.0 -> 24.3 and the engine transitions Idle -> Cooling.
        let mut engine = Engine::new(0.2778);
        let relays = all_off();

        let mut temp = 23.0;
        let mut engaged_at = None;
        while temp <= 24.3 {
            let eval = engine.evaluate(ThermostatMode::Cool, 21.0, 24.0, temp, &relays);
            if eval.plan == OutputPlan::Engage(RelayId::Cool) && engaged_at.is_none() {
                engaged_at = Some(temp);
            }
            temp += 0.1;
        }

        let engaged_at = engaged_at.expect("cooling never engaged");
        assert!(engaged_at >= 24.0 + 0.2778);
        assert_eq!(engine.state(), ThermostatState::Cooling);
    }
}
