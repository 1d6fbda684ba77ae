//! Probe a mainboard over the control channel.
//!
//! Reports the daughterboard clocks, both GPIO banks, and the contents of
//! the daughterboard ID EEPROM. Useful for checking the link before
//! bringing up a driver.

use anyhow::{Context, Result};
use std::sync::Arc;
use strum::IntoEnumIterator;

use dboard_ctrl::config::Config;
use dboard_ctrl::hw_trait::{Bank, ClockQuery, DboardIface, DigitalPins, SerialBus};
use dboard_ctrl::mgmt_protocol::{ControlChannel, TunneledMainboard};
use dboard_ctrl::tracing::{self, prelude::*};

/// Bytes read from the start of the ID EEPROM.
const ID_EEPROM_LEN: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;
    let channel = ControlChannel::open(&config.control)
        .with_context(|| format!("opening {}", config.control.serial_port.display()))?;
    let iface = DboardIface::new(Arc::new(TunneledMainboard::new(channel)));

    let rx = iface.rx_clock_rate().await.context("reading RX clock rate")?;
    let tx = iface.tx_clock_rate().await.context("reading TX clock rate")?;
    info!(rx = %rx, tx = %tx, "Daughterboard clocks.");

    for bank in Bank::iter() {
        let level = iface.read_gpio(bank).await.context("reading GPIO")?;
        info!(bank = %bank, level = %format!("0x{:04X}", level), "GPIO levels.");
    }

    let address = config.control.id_eeprom_address;
    iface
        .write_i2c(address, &[0x00])
        .await
        .with_context(|| format!("addressing ID EEPROM at {}", address))?;
    let id = iface
        .read_i2c(address, ID_EEPROM_LEN)
        .await
        .with_context(|| format!("reading ID EEPROM at {}", address))?;
    info!(address = %address, contents = %hex::encode(&id), "ID EEPROM.");

    Ok(())
}
