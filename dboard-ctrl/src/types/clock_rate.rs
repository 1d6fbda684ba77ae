//! Sample-clock rate type.

use serde::{Deserialize, Serialize};

use crate::hw_trait::{Error, Result};

/// Sample-clock frequency delivered to a daughterboard path.
///
/// Always finite and positive. Serialized as plain hertz.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ClockRate(f64);

impl ClockRate {
    /// Default mainboard sample clock.
    pub const DEFAULT: Self = Self(64e6);

    /// Create a rate from a frequency in hertz.
    pub fn from_hz(hz: f64) -> Result<Self> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(Error::InvalidValue(format!("clock rate {} Hz", hz)));
        }
        Ok(Self(hz))
    }

    /// Create a rate from a frequency in megahertz.
    pub fn from_mhz(mhz: f64) -> Result<Self> {
        Self::from_hz(mhz * 1e6)
    }

    pub fn hz(&self) -> f64 {
        self.0
    }

    pub fn mhz(&self) -> f64 {
        self.0 / 1e6
    }
}

impl TryFrom<f64> for ClockRate {
    type Error = Error;

    fn try_from(hz: f64) -> Result<Self> {
        Self::from_hz(hz)
    }
}

impl From<ClockRate> for f64 {
    fn from(rate: ClockRate) -> f64 {
        rate.0
    }
}

impl std::fmt::Display for ClockRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 1e6 {
            write!(f, "{:.3} MHz", self.mhz())
        } else if self.0 >= 1e3 {
            write!(f, "{:.3} kHz", self.0 / 1e3)
        } else {
            write!(f, "{:.3} Hz", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_mhz_conversion() {
        let rate = ClockRate::from_mhz(64.0).unwrap();
        assert!((rate.hz() - 64e6).abs() < 1e-3);
        assert!((rate.mhz() - 64.0).abs() < 1e-9);
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(-1.0 ; "negative")]
    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn test_rejects_unusable_rates(hz: f64) {
        assert!(matches!(ClockRate::from_hz(hz), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(ClockRate::from_hz(64e6).unwrap().to_string(), "64.000 MHz");
        assert_eq!(ClockRate::from_hz(32_768.0).unwrap().to_string(), "32.768 kHz");
        assert_eq!(ClockRate::from_hz(50.0).unwrap().to_string(), "50.000 Hz");
    }
}
