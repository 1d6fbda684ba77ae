//! Emulated peripherals that plug into an [`EmulatedMainboard`]'s buses.
//!
//! [`EmulatedMainboard`]: super::EmulatedMainboard

use async_trait::async_trait;
use std::time::Duration;
use tokio::time;

use crate::hw_trait::{BusError, Edge};

/// A device on the emulated I2C bus.
///
/// The mainboard has already matched the address; the peripheral only sees
/// the data phase.
#[async_trait]
pub trait I2cPeripheral: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), BusError>;

    /// Return up to `len` bytes. Returning fewer is reported to the caller
    /// as a short read.
    async fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError>;
}

/// A device on one of the emulated SPI buses.
#[async_trait]
pub trait SpiPeripheral: Send {
    /// Edge on which the device samples MOSI.
    fn sample_edge(&self) -> Edge;

    /// Edge on which the device drives MISO.
    fn drive_edge(&self) -> Edge {
        self.sample_edge().opposite()
    }

    /// Bits as the device sampled them.
    async fn receive(&mut self, data: &[u8]) -> Result<(), BusError>;

    /// Bytes the device shifts out over the next `len` bytes of clocks.
    async fn transmit(&mut self, len: usize) -> Result<Vec<u8>, BusError>;
}

/// I2C device that hands back what was last written to it.
#[derive(Debug, Default)]
pub struct I2cLoopback {
    last: Vec<u8>,
    stall: Option<Duration>,
}

impl I2cLoopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that holds the bus for `stall` on every transaction, e.g.
    /// by clock stretching.
    pub fn stalled(stall: Duration) -> Self {
        Self {
            last: Vec::new(),
            stall: Some(stall),
        }
    }

    async fn maybe_stall(&self) {
        if let Some(stall) = self.stall {
            time::sleep(stall).await;
        }
    }
}

#[async_trait]
impl I2cPeripheral for I2cLoopback {
    async fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
        self.maybe_stall().await;
        self.last = data.to_vec();
        Ok(())
    }

    async fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        self.maybe_stall().await;
        Ok(self.last.iter().copied().take(len).collect())
    }
}

/// 256-byte I2C EEPROM with a single-byte address pointer.
///
/// A write sets the pointer from its first byte and stores any remaining
/// bytes from there on. Reads start at the pointer. The pointer advances
/// with every byte and wraps at 256, like the 24C02 parts used for
/// daughterboard identification.
#[derive(Debug)]
pub struct I2cEeprom {
    memory: [u8; 256],
    pointer: u8,
}

impl I2cEeprom {
    /// Blank (erased, all 0xFF) EEPROM.
    pub fn new() -> Self {
        Self {
            memory: [0xFF; 256],
            pointer: 0,
        }
    }

    /// EEPROM preloaded with `contents` from offset 0.
    pub fn with_contents(contents: &[u8]) -> Self {
        let mut eeprom = Self::new();
        for (slot, byte) in eeprom.memory.iter_mut().zip(contents) {
            *slot = *byte;
        }
        eeprom
    }

    pub fn contents(&self) -> &[u8; 256] {
        &self.memory
    }
}

impl Default for I2cEeprom {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl I2cPeripheral for I2cEeprom {
    async fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
        let Some((&pointer, payload)) = data.split_first() else {
            return Ok(());
        };
        self.pointer = pointer;
        for byte in payload {
            self.memory[self.pointer as usize] = *byte;
            self.pointer = self.pointer.wrapping_add(1);
        }
        Ok(())
    }

    async fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.memory[self.pointer as usize]);
            self.pointer = self.pointer.wrapping_add(1);
        }
        Ok(out)
    }
}

/// SPI device that shifts out what was last shifted into it.
///
/// Clocks beyond the stored data read back as zeros (MISO idles low).
#[derive(Debug)]
pub struct SpiLoopback {
    sample_edge: Edge,
    last: Vec<u8>,
    failing: bool,
}

impl SpiLoopback {
    pub fn new(sample_edge: Edge) -> Self {
        Self {
            sample_edge,
            last: Vec::new(),
            failing: false,
        }
    }

    /// A device whose every transaction faults.
    pub fn failing(sample_edge: Edge) -> Self {
        Self {
            failing: true,
            ..Self::new(sample_edge)
        }
    }

    fn check(&self) -> Result<(), BusError> {
        if self.failing {
            return Err(BusError::Fault("SPI peripheral not responding".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SpiPeripheral for SpiLoopback {
    fn sample_edge(&self) -> Edge {
        self.sample_edge
    }

    async fn receive(&mut self, data: &[u8]) -> Result<(), BusError> {
        self.check()?;
        self.last = data.to_vec();
        Ok(())
    }

    async fn transmit(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        self.check()?;
        let mut out: Vec<u8> = self.last.iter().copied().take(len).collect();
        out.resize(len, 0x00);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_eeprom_pointer_and_wrap() {
        let mut eeprom = I2cEeprom::with_contents(&[0x10, 0x11, 0x12]);
        eeprom.write(&[0x01]).await.unwrap();
        assert_eq!(eeprom.read(2).await.unwrap(), vec![0x11, 0x12]);
        assert_eq!(eeprom.read(1).await.unwrap(), vec![0xFF]);

        eeprom.write(&[0xFF, 0xAA, 0xBB]).await.unwrap();
        assert_eq!(eeprom.contents()[0xFF], 0xAA);
        assert_eq!(eeprom.contents()[0x00], 0xBB);
    }

    #[tokio::test]
    async fn test_eeprom_empty_write_keeps_pointer() {
        let mut eeprom = I2cEeprom::with_contents(&[0, 1, 2, 3]);
        eeprom.write(&[0x02]).await.unwrap();
        eeprom.write(&[]).await.unwrap();
        assert_eq!(eeprom.read(1).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_i2c_loopback_returns_at_most_written() {
        let mut dev = I2cLoopback::new();
        dev.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(dev.read(2).await.unwrap(), vec![1, 2]);
        assert_eq!(dev.read(5).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_spi_loopback_pads_with_idle_level() {
        let mut dev = SpiLoopback::new(Edge::Falling);
        assert_eq!(dev.drive_edge(), Edge::Rising);
        dev.receive(&[0xAB]).await.unwrap();
        assert_eq!(dev.transmit(3).await.unwrap(), vec![0xAB, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_failing_spi_loopback() {
        let mut dev = SpiLoopback::failing(Edge::Falling);
        assert!(matches!(dev.receive(&[1]).await, Err(BusError::Fault(_))));
        assert!(matches!(dev.transmit(1).await, Err(BusError::Fault(_))));
    }
}
