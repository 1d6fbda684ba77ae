//! Daughterboard GPIO and automatic TX/RX switching.

use async_trait::async_trait;

use super::{Bank, Result};

/// Direction, ATR and level control of the two 16-bit GPIO banks.
///
/// Every setter is mask-qualified: bits clear in `mask` are left exactly as
/// they were, and a zero mask is a no-op. For an output pin the driven level
/// comes from the ATR registers when the pin is ATR-controlled, otherwise
/// from the manual output register. Input pins read whatever the
/// daughterboard drives onto them.
#[async_trait]
pub trait DigitalPins: Send + Sync {
    /// Program the ATR registers of `bank`.
    ///
    /// * `tx_value` - levels driven while transmitting
    /// * `rx_value` - levels driven while receiving
    /// * `mask` - 1 = pin is ATR-controlled, 0 = leave as is
    ///
    /// Bits already under ATR control stay under it when absent from
    /// `mask`.
    async fn set_atr_reg(&self, bank: Bank, tx_value: u16, rx_value: u16, mask: u16)
        -> Result<()>;

    /// Set the data direction register of `bank` (1 = output, 0 = input).
    async fn set_gpio_ddr(&self, bank: Bank, value: u16, mask: u16) -> Result<()>;

    /// Set the manual output levels of `bank` (1 = high, 0 = low).
    async fn write_gpio(&self, bank: Bank, value: u16, mask: u16) -> Result<()>;

    /// Read the live level of every pin in `bank`.
    async fn read_gpio(&self, bank: Bank) -> Result<u16>;
}
