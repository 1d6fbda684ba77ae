//! Daughterboard hardware control contract.
//!
//! This module defines the interface a mainboard offers to the daughterboard
//! drivers plugged into it. The contract is split into four capability
//! traits that can be implemented independently:
//!
//! - [`AuxAnalog`]: auxiliary DAC outputs and ADC inputs
//! - [`DigitalPins`]: per-bank direction, ATR, and manual GPIO control
//! - [`SerialBus`]: I2C and SPI transactions with explicit clock edges
//! - [`ClockQuery`]: RX and TX sample-clock rates
//!
//! [`DboardInterface`] bundles all four, and [`DboardIface`] is the façade
//! daughterboard drivers hold on to. Implementations take `&self` and must
//! serialize access internally; callers never lock.

pub mod analog;
pub mod bus;
pub mod clock;
pub mod gpio;
pub mod iface;

pub use analog::{AuxAnalog, AuxKind};
pub use bus::SerialBus;
pub use clock::ClockQuery;
pub use gpio::DigitalPins;
pub use iface::{DboardIface, DboardIfaceBuilder, DboardInterface};

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter};
use thiserror::Error;

/// GPIO bank: the pin group wired to the TX or RX side of the daughterboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Bank {
    #[strum(to_string = "TX")]
    Tx,
    #[strum(to_string = "RX")]
    Rx,
}

impl Bank {
    pub(crate) fn index(self) -> usize {
        match self {
            Bank::Tx => 0,
            Bank::Rx => 1,
        }
    }
}

impl TryFrom<u8> for Bank {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Bank::Tx),
            1 => Ok(Bank::Rx),
            other => Err(Error::InvalidBank(other)),
        }
    }
}

impl From<Bank> for u8 {
    fn from(bank: Bank) -> u8 {
        bank.index() as u8
    }
}

/// SPI device selector.
///
/// Picks the chip select (and bus) used for a transaction. Unrelated to
/// [`Bank`]: a TX-bank pin and the TX SPI device are different things.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SpiDevice {
    #[strum(to_string = "TX")]
    Tx,
    #[strum(to_string = "RX")]
    Rx,
}

impl SpiDevice {
    pub(crate) fn index(self) -> usize {
        match self {
            SpiDevice::Tx => 0,
            SpiDevice::Rx => 1,
        }
    }
}

impl TryFrom<u8> for SpiDevice {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SpiDevice::Tx),
            1 => Ok(SpiDevice::Rx),
            other => Err(Error::Protocol(format!("unknown SPI device {}", other))),
        }
    }
}

impl From<SpiDevice> for u8 {
    fn from(device: SpiDevice) -> u8 {
        device.index() as u8
    }
}

/// A clock edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    #[strum(to_string = "rising")]
    Rising,
    #[strum(to_string = "falling")]
    Falling,
}

impl Edge {
    /// The other edge of the same clock period.
    pub fn opposite(self) -> Edge {
        match self {
            Edge::Rising => Edge::Falling,
            Edge::Falling => Edge::Rising,
        }
    }
}

/// Edge on which the host drives MOSI during an SPI write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum SpiPushEdge {
    #[strum(to_string = "push-rise")]
    Rise,
    #[strum(to_string = "push-fall")]
    Fall,
}

impl SpiPushEdge {
    pub fn edge(self) -> Edge {
        match self {
            SpiPushEdge::Rise => Edge::Rising,
            SpiPushEdge::Fall => Edge::Falling,
        }
    }
}

/// Edge on which the host samples MISO during an SPI read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum SpiLatchEdge {
    #[strum(to_string = "latch-rise")]
    Rise,
    #[strum(to_string = "latch-fall")]
    Fall,
}

impl SpiLatchEdge {
    pub fn edge(self) -> Edge {
        match self {
            SpiLatchEdge::Rise => Edge::Rising,
            SpiLatchEdge::Fall => Edge::Falling,
        }
    }
}

impl From<Edge> for SpiPushEdge {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Rising => SpiPushEdge::Rise,
            Edge::Falling => SpiPushEdge::Fall,
        }
    }
}

impl From<Edge> for SpiLatchEdge {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Rising => SpiLatchEdge::Rise,
            Edge::Falling => SpiLatchEdge::Fall,
        }
    }
}

/// 7-bit I2C peripheral address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct I2cAddress(u8);

impl I2cAddress {
    pub const MAX: u8 = 0x7F;

    /// Conventional address of a daughterboard ID EEPROM.
    pub const ID_EEPROM: Self = Self(0x50);

    /// Create an address, rejecting anything wider than 7 bits.
    pub fn new(address: u8) -> Result<Self> {
        if address > Self::MAX {
            return Err(Error::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for I2cAddress {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<I2cAddress> for u8 {
    fn from(address: I2cAddress) -> u8 {
        address.0
    }
}

impl fmt::Display for I2cAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Bus-level failures on I2C or SPI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Peripheral did not acknowledge its address or a data byte
    #[error("no acknowledge from {address}")]
    Nack { address: I2cAddress },

    /// Another master won arbitration
    #[error("bus arbitration lost")]
    ArbitrationLost,

    /// Bus lock or transaction did not complete in time
    #[error("bus timeout")]
    Timeout,

    /// Peripheral returned fewer bytes than requested
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Any other transport fault
    #[error("bus fault: {0}")]
    Fault(String),
}

/// Errors reported by contract operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Aux DAC/ADC index beyond what the mainboard provides
    #[error("invalid {kind} channel {channel} ({available} available)")]
    InvalidChannel {
        kind: AuxKind,
        channel: usize,
        available: usize,
    },

    /// Parameter value outside what the hardware accepts
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Bank value that names neither TX nor RX
    #[error("invalid GPIO bank {0}")]
    InvalidBank(u8),

    /// I2C address wider than 7 bits
    #[error("invalid I2C address 0x{0:02X}")]
    InvalidAddress(u8),

    /// The operation did not complete on the hardware
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// Capability not provided by this binding
    #[error("{0} not supported")]
    NotSupported(&'static str),

    /// I/O errors from a tunneled transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed control-channel traffic
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use test_case::test_case;

    #[test_case(0x00 ; "general call")]
    #[test_case(0x50 ; "eeprom")]
    #[test_case(0x7F ; "top of range")]
    fn test_i2c_address_accepts_7_bit(raw: u8) {
        assert_eq!(I2cAddress::new(raw).unwrap().get(), raw);
    }

    #[test_case(0x80)]
    #[test_case(0xFF)]
    fn test_i2c_address_rejects_8_bit(raw: u8) {
        assert!(matches!(I2cAddress::new(raw), Err(Error::InvalidAddress(a)) if a == raw));
    }

    #[test]
    fn test_bank_wire_values() {
        for bank in Bank::iter() {
            assert_eq!(Bank::try_from(u8::from(bank)).unwrap(), bank);
        }
        assert!(matches!(Bank::try_from(2), Err(Error::InvalidBank(2))));
    }

    #[test]
    fn test_edges_are_independent_of_device() {
        assert_eq!(SpiPushEdge::Rise.edge(), Edge::Rising);
        assert_eq!(SpiLatchEdge::Fall.edge(), Edge::Falling);
        assert_eq!(Edge::Rising.opposite(), Edge::Falling);
        assert_eq!(SpiLatchEdge::from(Edge::Rising), SpiLatchEdge::Rise);
    }

    #[test]
    fn test_display() {
        assert_eq!(Bank::Tx.to_string(), "TX");
        assert_eq!(SpiDevice::Rx.to_string(), "RX");
        assert_eq!(I2cAddress::new(0x50).unwrap().to_string(), "0x50");
        let err = Error::from(BusError::Nack {
            address: I2cAddress::new(0x21).unwrap(),
        });
        assert_eq!(err.to_string(), "no acknowledge from 0x21");
    }
}
