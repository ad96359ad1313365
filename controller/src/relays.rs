//! Driver for the ATmega relay controller on the i2c bus.
//!
//! Every transfer is a 4-byte vector. Writes carry one command byte per
//! relay slot (slot 0 addresses the controller's reset register), reads
//! return the controller's status for each slot. The controller enforces its
//! own minimum-off lockouts and reports them in the status, so a commanded
//! relay may well come back `Locked` instead of `On`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use thermostat_common::{RelayId, RelaySnapshot, RelayStatus, ResetFlags};

const I2C_SLAVE: libc::c_ulong = 0x0703;

const CMD_NO_CHANGE: u8 = 0;
const CMD_OFF: u8 = 1;
const CMD_ON: u8 = 2;

/// Writing this to slot 0 acknowledges the controller's reset register.
const MCUSR_ACK: u8 = 0x0F;

const ALL_OFF_PACKET: [u8; 4] = [CMD_NO_CHANGE, CMD_OFF, CMD_OFF, CMD_OFF];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to open {device}: {source}")]
    Open {
        device: PathBuf,
        source: io::Error,
    },
    #[error("failed to select slave address {addr:#04x} on {device}")]
    SlaveAddress { device: PathBuf, addr: u16 },
    #[error("relay transfer failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid status byte {value:#04x} in slot {slot}")]
    BadStatusByte { slot: usize, value: u8 },
}

/// Seam between the control loop and the relay hardware.
pub trait RelayControl {
    fn get_status(&mut self) -> Result<RelaySnapshot, RelayError>;
    fn relay_on(&mut self, relay: RelayId) -> Result<RelayStatus, RelayError>;
    fn relay_off(&mut self, relay: RelayId) -> Result<RelayStatus, RelayError>;
    fn reset_mcusr(&mut self) -> Result<ResetFlags, RelayError>;
    fn relay_all_off(&mut self) -> Result<RelaySnapshot, RelayError>;
    fn close(&mut self);
}

pub struct RelayBank {
    device: PathBuf,
    addr: u16,
    file: Option<File>,
}

fn command_packet(relay: RelayId, command: u8) -> [u8; 4] {
    let mut packet = [CMD_NO_CHANGE; 4];
    packet[relay.slot()] = command;
    packet
}

fn parse_snapshot(raw: [u8; 4]) -> Result<RelaySnapshot, RelayError> {
    let status = |slot: usize| {
        RelayStatus::from_raw(raw[slot]).ok_or(RelayError::BadStatusByte {
            slot,
            value: raw[slot],
        })
    };
    Ok(RelaySnapshot {
        reset: ResetFlags(raw[0]),
        fan: status(RelayId::Fan.slot())?,
        heat: status(RelayId::Heat.slot())?,
        cool: status(RelayId::Cool.slot())?,
    })
}

impl RelayBank {
    pub fn new(device_name: &str, addr: u16) -> Self {
        Self {
            device: Path::new("/dev").join(device_name),
            addr,
            file: None,
        }
    }

    /// Opens the bus device and selects the slave address. Idempotent; every
    /// transfer goes through here so a failed open is retried on the next
    /// transfer rather than wedging the bank.
    fn open(&mut self) -> Result<&mut File, RelayError> {
        if self.file.is_none() {
            debug!("opening relay device {}", self.device.display());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.device)
                .map_err(|source| RelayError::Open {
                    device: self.device.clone(),
                    source,
                })?;
            let rc = unsafe {
                libc::ioctl(file.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(self.addr))
            };
            if rc != 0 {
                return Err(RelayError::SlaveAddress {
                    device: self.device.clone(),
                    addr: self.addr,
                });
            }
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(RelayError::Io(io::Error::other("relay device closed"))),
        }
    }

    fn write_packet(&mut self, packet: &[u8; 4]) -> Result<(), RelayError> {
        let file = self.open()?;
        file.write_all(packet)?;
        Ok(())
    }

    fn read_raw(&mut self) -> Result<[u8; 4], RelayError> {
        let file = self.open()?;
        let mut raw = [0u8; 4];
        file.read_exact(&mut raw)?;
        Ok(raw)
    }
}

impl RelayControl for RelayBank {
    fn get_status(&mut self) -> Result<RelaySnapshot, RelayError> {
        parse_snapshot(self.read_raw()?)
    }

    fn relay_on(&mut self, relay: RelayId) -> Result<RelayStatus, RelayError> {
        self.write_packet(&command_packet(relay, CMD_ON))?;
        Ok(self.get_status()?.status_of(relay))
    }

    fn relay_off(&mut self, relay: RelayId) -> Result<RelayStatus, RelayError> {
        self.write_packet(&command_packet(relay, CMD_OFF))?;
        Ok(self.get_status()?.status_of(relay))
    }

    /// Acknowledges the controller's reset register and returns whatever
    /// flags are left. Anything nonzero means the acknowledge did not stick.
    fn reset_mcusr(&mut self) -> Result<ResetFlags, RelayError> {
        self.write_packet(&[MCUSR_ACK, CMD_NO_CHANGE, CMD_NO_CHANGE, CMD_NO_CHANGE])?;
        Ok(self.get_status()?.reset)
    }

    fn relay_all_off(&mut self) -> Result<RelaySnapshot, RelayError> {
        self.write_packet(&ALL_OFF_PACKET)?;
        self.get_status()
    }

    fn close(&mut self) {
        self.file = None;
    }
}
