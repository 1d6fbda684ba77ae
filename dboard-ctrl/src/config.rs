//! Configuration management for dboard-ctrl.
//!
//! This module handles loading and validating configuration from TOML files.
//! Every field has a default, so an absent file or a partial file yields a
//! usable configuration: an emulated mainboard with four 12-bit aux channels
//! looped back, 64 MHz daughterboard clocks, and a control channel on
//! `/dev/ttyACM0`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hw_trait::{Edge, I2cAddress, SpiDevice};
use crate::tracing::prelude::*;
use crate::types::ClockRate;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "DBOARD_CONFIG";

/// Configuration file used when `DBOARD_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dboard-ctrl/dboard.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Emulated mainboard description
    pub mainboard: MainboardConfig,

    /// Bus arbitration timeouts
    pub bus: BusConfig,

    /// Control channel to a remote mainboard
    pub control: ControlConfig,
}

/// Description of the mainboard resources offered to the daughterboard.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MainboardConfig {
    pub aux_dac_count: usize,
    pub aux_adc_count: usize,

    /// DAC resolution in bits
    pub aux_dac_bits: u8,

    /// ADC resolution in bits
    pub aux_adc_bits: u8,

    /// Full-scale voltage shared by aux DACs and ADCs
    pub aux_full_scale_volts: f64,

    /// Route aux DAC n to aux ADC n
    pub aux_loopback: bool,

    pub rx_clock_rate: ClockRate,
    pub tx_clock_rate: ClockRate,

    /// Peripherals attached to the I2C bus
    pub i2c_devices: Vec<I2cDeviceConfig>,

    /// Peripherals attached to the SPI buses
    pub spi_devices: Vec<SpiDeviceConfig>,
}

impl Default for MainboardConfig {
    fn default() -> Self {
        let clock = ClockRate::DEFAULT;
        Self {
            aux_dac_count: 4,
            aux_adc_count: 4,
            aux_dac_bits: 12,
            aux_adc_bits: 12,
            aux_full_scale_volts: 3.3,
            aux_loopback: true,
            rx_clock_rate: clock,
            tx_clock_rate: clock,
            i2c_devices: Vec::new(),
            spi_devices: Vec::new(),
        }
    }
}

/// An emulated I2C peripheral.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum I2cDeviceConfig {
    /// 256-byte register file with an auto-incrementing pointer
    Eeprom {
        address: I2cAddress,
        /// Initial contents from offset 0
        #[serde(default)]
        contents: Vec<u8>,
    },
    /// Echoes back the last bytes written
    Loopback { address: I2cAddress },
}

/// An emulated SPI loopback peripheral.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpiDeviceConfig {
    pub device: SpiDevice,
    /// Edge on which the peripheral samples MOSI
    #[serde(default = "default_sample_edge")]
    pub sample_edge: Edge,
}

fn default_sample_edge() -> Edge {
    Edge::Falling
}

/// Timeouts applied by the mainboard to its shared buses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum wait for another caller's transaction to finish
    pub lock_timeout_ms: u64,
    /// Maximum duration of one transaction
    pub transaction_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2000,
            transaction_timeout_ms: 1000,
        }
    }
}

impl BusConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

/// Control channel settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Serial device carrying the control protocol
    pub serial_port: PathBuf,
    pub baud_rate: u32,
    pub lock_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,

    /// Address of the daughterboard ID EEPROM
    pub id_eeprom_address: I2cAddress,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            serial_port: PathBuf::from("/dev/ttyACM0"),
            baud_rate: 115200,
            lock_timeout_ms: 2000,
            write_timeout_ms: 1000,
            read_timeout_ms: 1000,
            id_eeprom_address: I2cAddress::ID_EEPROM,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Uses `$DBOARD_CONFIG` when set, otherwise [`DEFAULT_CONFIG_PATH`] if
    /// it exists, otherwise built-in defaults.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load_from(default_path);
        }

        debug!("No configuration file found, using defaults.");
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Loaded configuration.");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.mainboard.validate()
    }
}

impl MainboardConfig {
    /// Check converter resolutions, full scale, and peripheral placement.
    pub fn validate(&self) -> Result<()> {
        let mb = self;
        for (name, bits) in [("aux_dac_bits", mb.aux_dac_bits), ("aux_adc_bits", mb.aux_adc_bits)] {
            if !(1..=24).contains(&bits) {
                return Err(Error::Config(format!("{} must be 1-24, got {}", name, bits)));
            }
        }

        if !mb.aux_full_scale_volts.is_finite() || mb.aux_full_scale_volts <= 0.0 {
            return Err(Error::Config(format!(
                "aux_full_scale_volts must be positive, got {}",
                mb.aux_full_scale_volts
            )));
        }

        let mut addresses: Vec<I2cAddress> = mb
            .i2c_devices
            .iter()
            .map(|dev| match dev {
                I2cDeviceConfig::Eeprom { address, .. } => *address,
                I2cDeviceConfig::Loopback { address } => *address,
            })
            .collect();
        addresses.sort();
        if let Some(dup) = addresses.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("I2C address {} attached twice", dup[0])));
        }

        for dev in &mb.i2c_devices {
            if let I2cDeviceConfig::Eeprom { address, contents } = dev {
                if contents.len() > 256 {
                    return Err(Error::Config(format!(
                        "EEPROM at {} holds 256 bytes, got {}",
                        address,
                        contents.len()
                    )));
                }
            }
        }

        if mb.spi_devices.len() > 2
            || (mb.spi_devices.len() == 2 && mb.spi_devices[0].device == mb.spi_devices[1].device)
        {
            return Err(Error::Config("at most one SPI peripheral per device".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.mainboard.aux_dac_count, 4);
        assert_eq!(config.mainboard.aux_adc_bits, 12);
        assert_eq!(config.mainboard.rx_clock_rate.hz(), 64e6);
        assert_eq!(config.bus.lock_timeout(), Duration::from_secs(2));
        assert_eq!(config.control.baud_rate, 115200);
        assert_eq!(config.control.id_eeprom_address.get(), 0x50);
    }

    #[test]
    fn test_full_file() {
        let text = r#"
            [mainboard]
            aux_dac_count = 2
            aux_adc_bits = 10
            aux_loopback = false
            rx_clock_rate = 100e6
            tx_clock_rate = 50e6

            [[mainboard.i2c_devices]]
            kind = "eeprom"
            address = 0x50
            contents = [0x01, 0x00]

            [[mainboard.i2c_devices]]
            kind = "loopback"
            address = 0x21

            [[mainboard.spi_devices]]
            device = "tx"
            sample_edge = "rising"

            [bus]
            transaction_timeout_ms = 250

            [control]
            serial_port = "/dev/ttyUSB1"
            baud_rate = 921600
        "#;
        let config = Config::from_toml_str(text).unwrap();
        let mb = &config.mainboard;
        assert_eq!(mb.aux_dac_count, 2);
        assert_eq!(mb.aux_adc_count, 4);
        assert_eq!(mb.aux_adc_bits, 10);
        assert!(!mb.aux_loopback);
        assert_eq!(mb.tx_clock_rate.mhz(), 50.0);
        assert_eq!(mb.i2c_devices.len(), 2);
        assert!(matches!(
            &mb.i2c_devices[0],
            I2cDeviceConfig::Eeprom { address, contents } if address.get() == 0x50 && contents == &[1, 0]
        ));
        assert_eq!(mb.spi_devices[0].device, SpiDevice::Tx);
        assert_eq!(mb.spi_devices[0].sample_edge, Edge::Rising);
        assert_eq!(config.bus.transaction_timeout(), Duration::from_millis(250));
        assert_eq!(config.bus.lock_timeout_ms, 2000);
        assert_eq!(config.control.serial_port, PathBuf::from("/dev/ttyUSB1"));
    }

    #[test]
    fn test_spi_sample_edge_defaults_to_falling() {
        let text = r#"
            [[mainboard.spi_devices]]
            device = "rx"
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.mainboard.spi_devices[0].sample_edge, Edge::Falling);
    }

    #[test]
    fn test_rejects_8_bit_i2c_address() {
        let text = r#"
            [[mainboard.i2c_devices]]
            kind = "loopback"
            address = 0x80
        "#;
        assert!(matches!(Config::from_toml_str(text), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_i2c_address() {
        let text = r#"
            [[mainboard.i2c_devices]]
            kind = "loopback"
            address = 0x21

            [[mainboard.i2c_devices]]
            kind = "eeprom"
            address = 0x21
        "#;
        assert!(matches!(Config::from_toml_str(text), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_resolution() {
        let text = "[mainboard]\naux_dac_bits = 0\n";
        assert!(matches!(Config::from_toml_str(text), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_clock_rate() {
        let text = "[mainboard]\nrx_clock_rate = 0.0\n";
        assert!(matches!(Config::from_toml_str(text), Err(Error::Config(_))));
    }
}
