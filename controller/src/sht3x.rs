//! SHT3x temperature/humidity sensor driver.
//!
//! The kernel driver exposes a character device that delivers 6-byte
//! measurement frames. A sampling thread blocks on the device and keeps a
//! moving average of the raw temperature counts so momentary draughts do not
//! flap the relays. Readers see the filtered value through lock-free cells.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use tracing::{error, info, warn};

const IOCTL_MEASUREMENT_MODE: libc::c_ulong = 0x4004_7801;
const FRAME_LEN: usize = 6;
const READ_TIMEOUT_MS: libc::c_int = 3_000;
const COUNTS_MAX: f64 = 65_535.0;

/// Measurement mode of the sensor, combining a repetition rate with a
/// repeatability level. The discriminant is the kernel driver's mode code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum MeasurementMode {
    #[serde(rename = "single-shot-low")]
    SingleShotLow = 0,
    #[serde(rename = "single-shot-med")]
    SingleShotMed = 1,
    #[serde(rename = "single-shot-high")]
    SingleShotHigh = 2,
    #[serde(rename = "periodic-0.5-low")]
    PeriodicHalfHzLow = 3,
    #[serde(rename = "periodic-0.5-med")]
    PeriodicHalfHzMed = 4,
    #[serde(rename = "periodic-0.5-high")]
    PeriodicHalfHzHigh = 5,
    #[serde(rename = "periodic-1-low")]
    Periodic1HzLow = 6,
    #[serde(rename = "periodic-1-med")]
    Periodic1HzMed = 7,
    #[default]
    #[serde(rename = "periodic-1-high")]
    Periodic1HzHigh = 8,
    #[serde(rename = "periodic-2-low")]
    Periodic2HzLow = 9,
    #[serde(rename = "periodic-2-med")]
    Periodic2HzMed = 10,
    #[serde(rename = "periodic-2-high")]
    Periodic2HzHigh = 11,
    #[serde(rename = "periodic-4-low")]
    Periodic4HzLow = 12,
    #[serde(rename = "periodic-4-med")]
    Periodic4HzMed = 13,
    #[serde(rename = "periodic-4-high")]
    Periodic4HzHigh = 14,
    #[serde(rename = "periodic-10-low")]
    Periodic10HzLow = 15,
    #[serde(rename = "periodic-10-med")]
    Periodic10HzMed = 16,
    #[serde(rename = "periodic-10-high")]
    Periodic10HzHigh = 17,
}

impl MeasurementMode {
    fn arg(self) -> libc::c_ulong {
        self as libc::c_ulong
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Celsius,
    #[allow(dead_code)]
    Fahrenheit,
}

/// One decoded measurement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    temperature_counts: u16,
    humidity_counts: u16,
}

impl Frame {
    fn decode(raw: &[u8]) -> Option<Frame> {
        if raw.len() != FRAME_LEN {
            return None;
        }
        Some(Frame {
            temperature_counts: u16::from_be_bytes([raw[0], raw[1]]),
            humidity_counts: u16::from_be_bytes([raw[3], raw[4]]),
        })
    }

    fn humidity(self) -> f64 {
        100.0 * f64::from(self.humidity_counts) / COUNTS_MAX
    }
}

/// Moving average over the last `capacity` raw temperature counts.
struct SampleWindow {
    samples: VecDeque<u16>,
    capacity: usize,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, counts: u16) -> f64 {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(counts);
        let sum: u64 = self.samples.iter().map(|&c| u64::from(c)).sum();
        sum as f64 / self.samples.len() as f64
    }
}

fn counts_to_temperature(counts: f64, units: Units) -> f64 {
    match units {
        Units::Celsius => -45.0 + 175.0 * counts / COUNTS_MAX,
        Units::Fahrenheit => -49.0 + 315.0 * counts / COUNTS_MAX,
    }
}

/// Shared between the sampling thread (writer) and the control loop (reader).
/// Temperature starts as NaN bits, meaning no reading yet.
struct SensorCell {
    temperature_counts: AtomicU64,
    humidity: AtomicU64,
}

pub struct Sht3x {
    cell: Arc<SensorCell>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Sht3x {
    /// Spawns the sampling thread for the named device under /dev.
    pub fn new(device_name: &str, mode: MeasurementMode, samples: usize) -> io::Result<Self> {
        let device = Path::new("/dev").join(device_name);
        let cell = Arc::new(SensorCell {
            temperature_counts: AtomicU64::new(f64::NAN.to_bits()),
            humidity: AtomicU64::new(0f64.to_bits()),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("sht3x".to_string())
                .spawn(move || run(device, mode, samples, cell, stop))?
        };

        Ok(Self {
            cell,
            stop,
            thread: Some(thread),
        })
    }

    /// Filtered temperature, or None until the first frame arrives.
    pub fn temperature(&self, units: Units) -> Option<f64> {
        let counts = f64::from_bits(self.cell.temperature_counts.load(Ordering::Relaxed));
        if counts.is_nan() {
            None
        } else {
            Some(counts_to_temperature(counts, units))
        }
    }

    /// Most recent relative humidity in percent, unfiltered.
    pub fn humidity(&self) -> f64 {
        f64::from_bits(self.cell.humidity.load(Ordering::Relaxed))
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("sensor thread panicked");
            }
        }
    }
}

fn run(
    device: PathBuf,
    mode: MeasurementMode,
    samples: usize,
    cell: Arc<SensorCell>,
    stop: Arc<AtomicBool>,
) {
    let mut file = match File::open(&device) {
        Ok(file) => file,
        Err(err) => {
            error!("failed to open sensor device {}: {err}", device.display());
            return;
        }
    };

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), IOCTL_MEASUREMENT_MODE, mode.arg()) };
    if rc != 0 {
        error!(
            "sensor device {} rejected measurement mode {mode:?}: {}",
            device.display(),
            io::Error::last_os_error()
        );
        return;
    }

    info!(
        "sampling {} in mode {mode:?} with a {samples}-sample filter",
        device.display()
    );

    let mut window = SampleWindow::new(samples);
    while !stop.load(Ordering::Relaxed) {
        let mut pollfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, READ_TIMEOUT_MS) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                warn!("sensor poll failed: {err}");
            }
            continue;
        }
        if rc == 0 {
            warn!("unexpected timeout waiting for sensor data");
            continue;
        }

        let mut raw = [0u8; FRAME_LEN];
        let read = match file.read(&mut raw) {
            Ok(read) => read,
            Err(err) => {
                warn!("sensor read failed: {err}");
                continue;
            }
        };

        match Frame::decode(&raw[..read]) {
            Some(frame) => {
                let filtered = window.push(frame.temperature_counts);
                cell.temperature_counts
                    .store(filtered.to_bits(), Ordering::Relaxed);
                cell.humidity
                    .store(frame.humidity().to_bits(), Ordering::Relaxed);
            }
            None => warn!("discarding short sensor frame of {read} bytes"),
        }
    }
}
