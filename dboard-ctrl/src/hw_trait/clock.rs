//! Daughterboard clock rates.

use async_trait::async_trait;

use super::Result;
use crate::types::ClockRate;

/// Sample clocks delivered to the daughterboard.
///
/// Rates can change when the mainboard reconfigures its clocking, so callers
/// should query again rather than caching across a reconfiguration.
#[async_trait]
pub trait ClockQuery: Send + Sync {
    async fn rx_clock_rate(&self) -> Result<ClockRate>;

    async fn tx_clock_rate(&self) -> Result<ClockRate>;
}
