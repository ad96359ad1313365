//! Circulation fan driver: sysfs GPIO power switch, optional sysfs PWM
//! speed control, optional GPIO tachometer.
//!
//! Setup failures are not fatal to the process. Each of the three legs
//! degrades independently: a leg that failed to configure turns its
//! operations into no-ops so the thermostat keeps conditioning even with a
//! fan that cannot report RPM or hold a speed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

const GPIO_ROOT: &str = "/sys/class/gpio";
const PWM_ROOT: &str = "/sys/class/pwm/pwmchip0";

/// Time for the kernel to create the attribute files after an export.
const EXPORT_SETTLE: Duration = Duration::from_millis(500);

const TACH_WINDOW: Duration = Duration::from_millis(500);
const TACH_POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Sentinel stored in the RPM cell while no valid sample exists.
const RPM_NONE: u32 = u32::MAX;

pub const PWM_PERIOD_DEFAULT_NS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy)]
pub struct FanConfig {
    pub power_gpio: u32,
    pub tach_gpio: Option<u32>,
    pub pwm_channel: Option<u32>,
    pub pwm_period_ns: Option<u64>,
}

enum Subsystem<T> {
    Ready(T),
    NotConfigured,
    Faulted,
}

impl<T> Subsystem<T> {
    fn ready(&self) -> Option<&T> {
        match self {
            Subsystem::Ready(inner) => Some(inner),
            _ => None,
        }
    }
}

struct Gpio {
    dir: PathBuf,
}

impl Gpio {
    fn value_path(&self) -> PathBuf {
        self.dir.join("value")
    }

    fn write_value(&self, value: &str) -> io::Result<()> {
        fs::write(self.value_path(), value)
    }
}

struct Pwm {
    dir: PathBuf,
    period_ns: u64,
}

fn export_gpio(root: &Path, pin: u32, direction: &str) -> io::Result<Gpio> {
    let dir = root.join(format!("gpio{pin}"));
    if !dir.exists() {
        debug!("exporting gpio{pin}");
        fs::write(root.join("export"), pin.to_string())?;
        thread::sleep(EXPORT_SETTLE);
    }
    fs::write(dir.join("direction"), direction)?;
    Ok(Gpio { dir })
}

fn export_pwm(root: &Path, channel: u32, period_ns: u64) -> io::Result<Pwm> {
    let dir = root.join(format!("pwm{channel}"));
    if !dir.exists() {
        debug!("exporting pwm channel {channel}");
        fs::write(root.join("export"), channel.to_string())?;
        thread::sleep(EXPORT_SETTLE);
    }
    fs::write(dir.join("period"), period_ns.to_string())?;
    fs::write(dir.join("duty_cycle"), "0")?;
    fs::write(dir.join("enable"), "0")?;
    Ok(Pwm { dir, period_ns })
}

struct TachWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct FanDriver {
    power: Subsystem<Gpio>,
    tach: Subsystem<Gpio>,
    pwm: Subsystem<Pwm>,
    powered: bool,
    duty_pct: u8,
    rpm: Arc<AtomicU32>,
    tach_worker: Option<TachWorker>,
}

impl FanDriver {
    pub fn new(config: &FanConfig) -> Self {
        Self::with_roots(config, Path::new(GPIO_ROOT), Path::new(PWM_ROOT))
    }

    fn with_roots(config: &FanConfig, gpio_root: &Path, pwm_root: &Path) -> Self {
        let power = match export_gpio(gpio_root, config.power_gpio, "out") {
            Ok(gpio) => Subsystem::Ready(gpio),
            Err(err) => {
                error!("fan power gpio{} setup failed: {err}", config.power_gpio);
                Subsystem::Faulted
            }
        };

        let tach = match config.tach_gpio {
            None => Subsystem::NotConfigured,
            Some(pin) => match export_gpio(gpio_root, pin, "in") {
                Ok(gpio) => Subsystem::Ready(gpio),
                Err(err) => {
                    error!("fan tach gpio{pin} setup failed: {err}");
                    Subsystem::Faulted
                }
            },
        };

        let pwm = match config.pwm_channel {
            None => Subsystem::NotConfigured,
            Some(channel) => {
                let period_ns = config.pwm_period_ns.unwrap_or(PWM_PERIOD_DEFAULT_NS);
                match export_pwm(pwm_root, channel, period_ns) {
                    Ok(pwm) => Subsystem::Ready(pwm),
                    Err(err) => {
                        error!("fan pwm channel {channel} setup failed: {err}");
                        Subsystem::Faulted
                    }
                }
            }
        };

        Self {
            power,
            tach,
            pwm,
            powered: false,
            duty_pct: 0,
            rpm: Arc::new(AtomicU32::new(RPM_NONE)),
            tach_worker: None,
        }
    }

    /// Powers the fan, starts the tach worker, and enables the PWM output.
    /// Idempotent while already on.
    pub fn on(&mut self) {
        let Some(gpio) = self.power.ready() else {
            return;
        };
        if self.powered {
            return;
        }
        if let Err(err) = gpio.write_value("1") {
            error!("failed to power on fan: {err}");
            return;
        }
        self.powered = true;
        self.start_tach();
        self.set_pwm_enable(true);
    }

    /// Cuts fan power; the tach worker and PWM output stop either way.
    pub fn off(&mut self) {
        let Some(gpio) = self.power.ready() else {
            return;
        };
        if !self.powered {
            return;
        }
        match gpio.write_value("0") {
            Ok(()) => self.powered = false,
            Err(err) => error!("failed to power off fan: {err}"),
        }
        self.stop_tach();
        self.set_pwm_enable(false);
    }

    /// Sets the PWM duty cycle in percent. Out-of-range values are ignored,
    /// and an unchanged value is not rewritten.
    pub fn set_pwm_duty(&mut self, duty_pct: u8) {
        if duty_pct > 100 {
            return;
        }
        let Some(pwm) = self.pwm.ready() else {
            return;
        };
        if duty_pct == self.duty_pct {
            return;
        }
        let duty_ns = pwm.period_ns / 100 * u64::from(duty_pct);
        debug!("setting fan pwm duty to {duty_pct}% ({duty_ns}ns)");
        match fs::write(pwm.dir.join("duty_cycle"), duty_ns.to_string()) {
            Ok(()) => self.duty_pct = duty_pct,
            Err(err) => error!("failed to set fan pwm duty: {err}"),
        }
    }

    /// Most recent tachometer sample, None while the tach is not running or
    /// has not completed a measurement window.
    pub fn get_rpm(&self) -> Option<u32> {
        self.tach.ready()?;
        match self.rpm.load(Ordering::Relaxed) {
            RPM_NONE => None,
            rpm => Some(rpm),
        }
    }

    fn set_pwm_enable(&self, enable: bool) {
        if let Some(pwm) = self.pwm.ready() {
            let value = if enable { "1" } else { "0" };
            debug!("setting fan pwm enable to {value}");
            if let Err(err) = fs::write(pwm.dir.join("enable"), value) {
                error!("failed to write fan pwm enable: {err}");
            }
        }
    }

    fn start_tach(&mut self) {
        let Some(gpio) = self.tach.ready() else {
            return;
        };
        if self.tach_worker.is_some() {
            return;
        }
        let value_path = gpio.value_path();
        let rpm = Arc::clone(&self.rpm);
        let stop = Arc::new(AtomicBool::new(false));
        let result = thread::Builder::new().name("fan-rpm".to_string()).spawn({
            let stop = Arc::clone(&stop);
            move || run_tach(&value_path, &rpm, &stop)
        });
        match result {
            Ok(handle) => self.tach_worker = Some(TachWorker { stop, handle }),
            Err(err) => error!("failed to spawn fan tach thread: {err}"),
        }
    }

    fn stop_tach(&mut self) {
        if let Some(worker) = self.tach_worker.take() {
            worker.stop.store(true, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                error!("fan tach thread panicked");
            }
        }
        self.rpm.store(RPM_NONE, Ordering::Relaxed);
    }
}

fn read_pin(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Counts rising edges on the tach pin over a fixed window, publishes the
/// extrapolated RPM, then idles for a window before sampling again.
fn run_tach(value_path: &Path, rpm: &AtomicU32, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let window_start = Instant::now();
        let mut pulses: u32 = 0;
        let result = (|| -> io::Result<()> {
            let mut last = read_pin(value_path)?;
            while window_start.elapsed() < TACH_WINDOW {
                let state = read_pin(value_path)?;
                if state != last {
                    if state == "1" {
                        pulses += 1;
                    }
                    last = state;
                }
                thread::sleep(TACH_POLL_INTERVAL);
            }
            Ok(())
        })();
        match result {
            Ok(()) => rpm.store(pulses * 60, Ordering::Relaxed),
            Err(err) => {
                error!("fan tach read failed: {err}");
                rpm.store(RPM_NONE, Ordering::Relaxed);
            }
        }
        thread::sleep(TACH_WINDOW);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    // Pre-creates gpio/pwm attribute directories so the driver takes the
    // already-exported path and skips the export settle sleep.
    fn gpio_root(pins: &[u32]) -> TempDir {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("export"), "").unwrap();
        for pin in pins {
            let dir = root.path().join(format!("gpio{pin}"));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("direction"), "").unwrap();
            fs::write(dir.join("value"), "0").unwrap();
        }
        root
    }

    fn pwm_root(channels: &[u32]) -> TempDir {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("export"), "").unwrap();
        for channel in channels {
            let dir = root.path().join(format!("pwm{channel}"));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("period"), "").unwrap();
            fs::write(dir.join("duty_cycle"), "").unwrap();
            fs::write(dir.join("enable"), "").unwrap();
        }
        root
    }

    fn read(root: &TempDir, rel: &str) -> String {
        fs::read_to_string(root.path().join(rel)).unwrap()
    }

    #[test]
    fn power_gpio_switches_on_and_off() {
        let gpio = gpio_root(&[17]);
        let pwm = pwm_root(&[]);
        let config = FanConfig {
            power_gpio: 17,
            tach_gpio: None,
            pwm_channel: None,
            pwm_period_ns: None,
        };

        let mut fan = FanDriver::with_roots(&config, gpio.path(), pwm.path());
        assert_eq!(read(&gpio, "gpio17/direction"), "out");

        fan.on();
        assert_eq!(read(&gpio, "gpio17/value"), "1");

        fan.off();
        assert_eq!(read(&gpio, "gpio17/value"), "0");
    }

    #[test]
    fn pwm_configured_disabled_at_startup() {
        let gpio = gpio_root(&[17]);
        let pwm = pwm_root(&[0]);
        let config = FanConfig {
            power_gpio: 17,
            tach_gpio: None,
            pwm_channel: Some(0),
            pwm_period_ns: Some(40_000),
        };

        let _fan = FanDriver::with_roots(&config, gpio.path(), pwm.path());
        assert_eq!(read(&pwm, "pwm0/period"), "40000");
        assert_eq!(read(&pwm, "pwm0/duty_cycle"), "0");
        assert_eq!(read(&pwm, "pwm0/enable"), "0");
    }

    #[test]
    fn pwm_follows_power_and_duty_writes_once() {
        let gpio = gpio_root(&[17]);
        let pwm = pwm_root(&[0]);
        let config = FanConfig {
            power_gpio: 17,
            tach_gpio: None,
            pwm_channel: Some(0),
            pwm_period_ns: None,
        };

        let mut fan = FanDriver::with_roots(&config, gpio.path(), pwm.path());
        fan.on();
        assert_eq!(read(&pwm, "pwm0/enable"), "1");

        // period/100 * 75 with the 1ms default period
        fan.set_pwm_duty(75);
        assert_eq!(read(&pwm, "pwm0/duty_cycle"), "750000");

        // Same duty is not rewritten.
        fs::write(pwm.path().join("pwm0/duty_cycle"), "tampered").unwrap();
        fan.set_pwm_duty(75);
        assert_eq!(read(&pwm, "pwm0/duty_cycle"), "tampered");

        // Out of range is ignored.
        fan.set_pwm_duty(101);
        assert_eq!(read(&pwm, "pwm0/duty_cycle"), "tampered");

        fan.off();
        assert_eq!(read(&pwm, "pwm0/enable"), "0");
    }

    #[test]
    fn faulted_power_leg_is_inert() {
        // No export file and no pre-created directories: setup fails.
        let gpio = TempDir::new().unwrap();
        let pwm = pwm_root(&[]);
        let config = FanConfig {
            power_gpio: 17,
            tach_gpio: Some(27),
            pwm_channel: None,
            pwm_period_ns: None,
        };

        let mut fan = FanDriver::with_roots(&config, gpio.path(), pwm.path());
        fan.on();
        fan.off();
        fan.set_pwm_duty(50);
        assert_eq!(fan.get_rpm(), None);
    }

    #[test]
    fn rpm_unavailable_without_tach() {
        let gpio = gpio_root(&[17]);
        let pwm = pwm_root(&[]);
        let config = FanConfig {
            power_gpio: 17,
            tach_gpio: None,
            pwm_channel: None,
            pwm_period_ns: None,
        };

        let mut fan = FanDriver::with_roots(&config, gpio.path(), pwm.path());
        fan.on();
        assert_eq!(fan.get_rpm(), None);
        fan.off();
    }

    #[test]
    fn tach_reports_zero_for_a_static_pin() {
        let gpio = gpio_root(&[17, 27]);
        let pwm = pwm_root(&[]);
        let config = FanConfig {
            power_gpio: 17,
            tach_gpio: Some(27),
            pwm_channel: None,
            pwm_period_ns: None,
        };

        let mut fan = FanDriver::with_roots(&config, gpio.path(), pwm.path());
        fan.on();
        assert_eq!(read(&gpio, "gpio27/direction"), "in");

        // One full measurement window on a pin that never toggles.
        thread::sleep(TACH_WINDOW + Duration::from_millis(200));
        assert_eq!(fan.get_rpm(), Some(0));

        fan.off();
        assert_eq!(fan.get_rpm(), None);
    }
}
