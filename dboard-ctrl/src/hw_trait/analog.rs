//! Auxiliary analog I/O.

use async_trait::async_trait;
use strum::Display;

use super::Result;

/// Which side of the auxiliary analog block a channel index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AuxKind {
    #[strum(to_string = "aux DAC")]
    Dac,
    #[strum(to_string = "aux ADC")]
    Adc,
}

/// Auxiliary DACs and ADCs routed to the daughterboard slot.
///
/// Channels are indexed from zero. Values are raw converter codes; the
/// mainboard defines resolution and full-scale voltage.
#[async_trait]
pub trait AuxAnalog: Send + Sync {
    /// Set aux DAC `channel` to output code `value`.
    ///
    /// Fails with `InvalidChannel` for an index past the mainboard's DAC
    /// count and `HardwareFault` if the write does not complete.
    async fn write_aux_dac(&self, channel: usize, value: u32) -> Result<()>;

    /// Sample aux ADC `channel`.
    ///
    /// Every call performs a fresh conversion.
    async fn read_aux_adc(&self, channel: usize) -> Result<u32>;
}
