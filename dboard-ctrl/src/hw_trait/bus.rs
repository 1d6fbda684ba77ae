//! I2C and SPI access for daughterboard peripherals.

use async_trait::async_trait;

use super::{I2cAddress, Result, SpiDevice, SpiLatchEdge, SpiPushEdge};
use crate::tracing::prelude::*;

/// Serial buses shared with the daughterboard.
///
/// The mainboard serializes transactions per bus (the I2C bus, and each SPI
/// device's bus) so two callers never interleave on the wire. Reads either
/// return exactly the requested number of bytes or fail; there is no
/// partial result.
#[async_trait]
pub trait SerialBus: Send + Sync {
    /// Write `data` to the peripheral at `address` in one transaction.
    async fn write_i2c(&self, address: I2cAddress, data: &[u8]) -> Result<()>;

    /// Read exactly `len` bytes from the peripheral at `address`.
    async fn read_i2c(&self, address: I2cAddress, len: usize) -> Result<Vec<u8>>;

    /// Shift `data` out to `device`, driving each bit on `push`.
    async fn write_spi(&self, device: SpiDevice, push: SpiPushEdge, data: &[u8]) -> Result<()>;

    /// Clock `len` bytes in from `device`, sampling each bit on `latch`.
    async fn read_spi(&self, device: SpiDevice, latch: SpiLatchEdge, len: usize)
        -> Result<Vec<u8>>;

    /// Like [`read_i2c`](Self::read_i2c), but reports failure as an empty
    /// buffer.
    async fn read_i2c_or_empty(&self, address: I2cAddress, len: usize) -> Vec<u8> {
        self.read_i2c(address, len).await.unwrap_or_else(|e| {
            debug!(address = %address, len, error = %e, "I2C read failed");
            Vec::new()
        })
    }

    /// Like [`read_spi`](Self::read_spi), but reports failure as an empty
    /// buffer.
    async fn read_spi_or_empty(&self, device: SpiDevice, latch: SpiLatchEdge, len: usize) -> Vec<u8> {
        self.read_spi(device, latch, len).await.unwrap_or_else(|e| {
            debug!(device = %device, len, error = %e, "SPI read failed");
            Vec::new()
        })
    }
}
