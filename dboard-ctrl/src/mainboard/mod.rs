//! Emulated mainboard.
//!
//! [`EmulatedMainboard`] implements the whole control contract in-process:
//! aux converters with optional DAC-to-ADC loopback, both GPIO banks with ATR
//! switching, an I2C bus and two SPI buses with pluggable peripherals, and
//! reconfigurable daughterboard clocks. It backs the `dboard-emud` daemon and
//! lets daughterboard drivers be exercised without hardware.
//!
//! Bus access is serialized per bus with async mutexes; waiting for the bus
//! is bounded by the configured lock timeout and each transaction by the
//! transaction timeout, both surfacing as [`BusError::Timeout`]. GPIO banks
//! are guarded by one lock each, so a read never sees half of an update.

mod peripheral;
mod trace;

pub use peripheral::{I2cEeprom, I2cLoopback, I2cPeripheral, SpiLoopback, SpiPeripheral};
pub use trace::{BusTarget, BusTrace, BusTransaction};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time;

use crate::config::{BusConfig, Config, I2cDeviceConfig, MainboardConfig};
use crate::gpio_bank::{AtrMode, BankRegisters};
use crate::hw_trait::{
    AuxAnalog, AuxKind, Bank, BusError, ClockQuery, DigitalPins, Error, I2cAddress, Result,
    SerialBus, SpiDevice, SpiLatchEdge, SpiPushEdge,
};
use crate::tracing::prelude::*;
use crate::types::ClockRate;

/// Worst-case difference, in ADC codes, between a looped-back DAC code and
/// the code read back when DAC and ADC share a resolution. Conversion rounds
/// to the nearest code, so the only error left is floating-point rounding
/// at a code boundary.
pub const ADC_TOLERANCE: u32 = 1;

/// Longest single I2C or SPI read, in bytes.
pub const MAX_TRANSFER_LEN: usize = 64 * 1024;

const TRACE_CAPACITY: usize = 256;

type I2cDevices = HashMap<I2cAddress, Box<dyn I2cPeripheral>>;
type SpiSlot = AsyncMutex<Option<Box<dyn SpiPeripheral>>>;

struct AuxState {
    dac_codes: Vec<u32>,
    /// Volts applied to ADC inputs that are not looped back
    adc_inputs: Vec<f64>,
    /// Channels whose converters refuse to respond
    faulted: HashSet<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Clocks {
    rx: ClockRate,
    tx: ClockRate,
}

/// In-process mainboard implementing every capability of the contract.
pub struct EmulatedMainboard {
    dac_bits: u8,
    adc_bits: u8,
    full_scale_volts: f64,
    aux_loopback: bool,
    aux: Mutex<AuxState>,
    banks: [RwLock<BankRegisters>; 2],
    mode: RwLock<AtrMode>,
    i2c: AsyncMutex<I2cDevices>,
    spi: [SpiSlot; 2],
    clocks: RwLock<Clocks>,
    lock_timeout: Duration,
    transaction_timeout: Duration,
    trace: BusTrace,
}

impl EmulatedMainboard {
    /// Build a mainboard and attach the peripherals listed in `config`.
    ///
    /// Fails if `config` does not pass [`MainboardConfig::validate`].
    pub fn new(config: &MainboardConfig, bus: &BusConfig) -> crate::error::Result<Self> {
        config.validate()?;

        let mut i2c: I2cDevices = HashMap::new();
        for device in &config.i2c_devices {
            match device {
                I2cDeviceConfig::Eeprom { address, contents } => {
                    i2c.insert(*address, Box::new(I2cEeprom::with_contents(contents)));
                }
                I2cDeviceConfig::Loopback { address } => {
                    i2c.insert(*address, Box::new(I2cLoopback::new()));
                }
            }
        }

        let mut spi: [Option<Box<dyn SpiPeripheral>>; 2] = [None, None];
        for device in &config.spi_devices {
            spi[device.device.index()] = Some(Box::new(SpiLoopback::new(device.sample_edge)));
        }
        let [spi_tx, spi_rx] = spi;

        Ok(Self {
            dac_bits: config.aux_dac_bits,
            adc_bits: config.aux_adc_bits,
            full_scale_volts: config.aux_full_scale_volts,
            aux_loopback: config.aux_loopback,
            aux: Mutex::new(AuxState {
                dac_codes: vec![0; config.aux_dac_count],
                adc_inputs: vec![0.0; config.aux_adc_count],
                faulted: HashSet::new(),
            }),
            banks: Default::default(),
            mode: RwLock::new(AtrMode::default()),
            i2c: AsyncMutex::new(i2c),
            spi: [AsyncMutex::new(spi_tx), AsyncMutex::new(spi_rx)],
            clocks: RwLock::new(Clocks {
                rx: config.rx_clock_rate,
                tx: config.tx_clock_rate,
            }),
            lock_timeout: bus.lock_timeout(),
            transaction_timeout: bus.transaction_timeout(),
            trace: BusTrace::new(TRACE_CAPACITY),
        })
    }

    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        Self::new(&config.mainboard, &config.bus)
    }

    /// Attach `peripheral` at `address`, replacing any device already there.
    pub async fn attach_i2c(&self, address: I2cAddress, peripheral: impl I2cPeripheral + 'static) {
        self.i2c.lock().await.insert(address, Box::new(peripheral));
        debug!(address = %address, "I2C peripheral attached.");
    }

    /// Remove the device at `address`. Returns whether one was attached.
    pub async fn detach_i2c(&self, address: I2cAddress) -> bool {
        self.i2c.lock().await.remove(&address).is_some()
    }

    /// Attach `peripheral` to the bus of `device`, replacing any device
    /// already there.
    pub async fn attach_spi(&self, device: SpiDevice, peripheral: impl SpiPeripheral + 'static) {
        *self.spi[device.index()].lock().await = Some(Box::new(peripheral));
        debug!(device = %device, "SPI peripheral attached.");
    }

    /// Switch between transmit and receive, flipping ATR-controlled pins.
    pub fn set_atr_mode(&self, mode: AtrMode) {
        *self.mode.write() = mode;
        debug!(mode = %mode, "ATR mode changed.");
    }

    pub fn atr_mode(&self) -> AtrMode {
        *self.mode.read()
    }

    /// Set the levels the daughterboard drives onto input pins of `bank`.
    pub fn drive_inputs(&self, bank: Bank, value: u16) {
        self.banks[bank.index()].write().drive_inputs(value);
    }

    /// Snapshot of the registers of `bank`.
    pub fn bank_registers(&self, bank: Bank) -> BankRegisters {
        *self.banks[bank.index()].read()
    }

    /// Apply `volts` to aux ADC `channel`. Ignored while the channel is
    /// looped back to a DAC.
    pub fn set_adc_input(&self, channel: usize, volts: f64) -> Result<()> {
        if !volts.is_finite() {
            return Err(Error::InvalidValue(format!("ADC input {} V", volts)));
        }
        let mut aux = self.aux.lock();
        let available = aux.adc_inputs.len();
        let input = aux.adc_inputs.get_mut(channel).ok_or(Error::InvalidChannel {
            kind: AuxKind::Adc,
            channel,
            available,
        })?;
        *input = volts;
        Ok(())
    }

    /// Largest difference, in ADC codes, between an ADC reading and the
    /// looped-back DAC code rescaled to ADC resolution.
    pub fn adc_tolerance(&self) -> u32 {
        ADC_TOLERANCE
    }

    /// Make the DAC and ADC of `channel` fail (or recover).
    pub fn set_aux_fault(&self, channel: usize, faulted: bool) {
        let mut aux = self.aux.lock();
        if faulted {
            aux.faulted.insert(channel);
        } else {
            aux.faulted.remove(&channel);
        }
    }

    /// Reconfigure the daughterboard clocks.
    pub fn set_clock_rates(&self, rx: ClockRate, tx: ClockRate) {
        *self.clocks.write() = Clocks { rx, tx };
        info!(rx = %rx, tx = %tx, "Daughterboard clocks reconfigured.");
    }

    /// Return pins, converters and ATR mode to their power-on state.
    ///
    /// This is also the only way to take pins back out of ATR control.
    /// Attached peripherals stay attached.
    pub fn reset(&self) {
        for bank in &self.banks {
            *bank.write() = BankRegisters::default();
        }
        *self.mode.write() = AtrMode::default();
        let mut aux = self.aux.lock();
        aux.dac_codes.iter_mut().for_each(|code| *code = 0);
        aux.adc_inputs.iter_mut().for_each(|volts| *volts = 0.0);
        aux.faulted.clear();
        info!("Mainboard reset.");
    }

    /// Recorded bus transactions, oldest first.
    pub fn trace(&self) -> Vec<BusTransaction> {
        self.trace.snapshot()
    }

    pub fn clear_trace(&self) {
        self.trace.clear();
    }

    async fn lock_bus<'a, T>(&self, bus: &'a AsyncMutex<T>) -> std::result::Result<AsyncMutexGuard<'a, T>, BusError> {
        time::timeout(self.lock_timeout, bus.lock())
            .await
            .map_err(|_| BusError::Timeout)
    }

    async fn bounded<T>(
        &self,
        transaction: impl Future<Output = std::result::Result<T, BusError>>,
    ) -> std::result::Result<T, BusError> {
        time::timeout(self.transaction_timeout, transaction)
            .await
            .unwrap_or(Err(BusError::Timeout))
    }

    fn record(&self, target: BusTarget, is_read: bool, data: &[u8], error: Option<&BusError>) {
        match error {
            None => trace!(bus = %target, read = is_read, data = %hex::encode(data), "Bus transaction."),
            Some(e) => debug!(bus = %target, read = is_read, error = %e, "Bus transaction failed."),
        }
        self.trace.record(BusTransaction {
            target,
            is_read,
            data: data.to_vec(),
            completed: error.is_none(),
        });
    }

    fn check_aux_channel(aux: &AuxState, kind: AuxKind, channel: usize) -> Result<()> {
        let available = match kind {
            AuxKind::Dac => aux.dac_codes.len(),
            AuxKind::Adc => aux.adc_inputs.len(),
        };
        if channel >= available {
            return Err(Error::InvalidChannel {
                kind,
                channel,
                available,
            });
        }
        if aux.faulted.contains(&channel) {
            return Err(Error::HardwareFault(format!("{} {} not responding", kind, channel)));
        }
        Ok(())
    }
}

fn check_read_len(len: usize) -> Result<()> {
    if len > MAX_TRANSFER_LEN {
        return Err(Error::InvalidValue(format!(
            "read of {} bytes exceeds {} byte limit",
            len, MAX_TRANSFER_LEN
        )));
    }
    Ok(())
}

fn max_code(bits: u8) -> u32 {
    ((1u64 << bits) - 1) as u32
}

/// The bitstream seen by a receiver sampling on the same edge the
/// transmitter drives: every bit arrives one clock late, MSB first, with the
/// idle-low line shifted in ahead of the first bit.
fn delay_one_bit(data: &[u8]) -> Vec<u8> {
    let mut carry = 0u8;
    data.iter()
        .map(|byte| {
            let delayed = (byte >> 1) | (carry << 7);
            carry = byte & 1;
            delayed
        })
        .collect()
}

fn exact_len(expected: usize, mut bytes: Vec<u8>) -> std::result::Result<Vec<u8>, BusError> {
    bytes.truncate(expected);
    if bytes.len() < expected {
        return Err(BusError::ShortRead {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

#[async_trait]
impl AuxAnalog for EmulatedMainboard {
    async fn write_aux_dac(&self, channel: usize, value: u32) -> Result<()> {
        let mut aux = self.aux.lock();
        Self::check_aux_channel(&aux, AuxKind::Dac, channel)?;
        let max = max_code(self.dac_bits);
        if value > max {
            return Err(Error::InvalidValue(format!(
                "aux DAC code {} exceeds full scale {}",
                value, max
            )));
        }
        aux.dac_codes[channel] = value;
        debug!(channel, value, "Aux DAC written.");
        Ok(())
    }

    async fn read_aux_adc(&self, channel: usize) -> Result<u32> {
        let aux = self.aux.lock();
        Self::check_aux_channel(&aux, AuxKind::Adc, channel)?;

        let volts = match aux.dac_codes.get(channel) {
            Some(code) if self.aux_loopback => {
                f64::from(*code) / f64::from(max_code(self.dac_bits)) * self.full_scale_volts
            }
            _ => aux.adc_inputs[channel],
        };

        let max = max_code(self.adc_bits);
        let code = (volts / self.full_scale_volts * f64::from(max))
            .round()
            .clamp(0.0, f64::from(max)) as u32;
        trace!(channel, volts, code, "Aux ADC sampled.");
        Ok(code)
    }
}

#[async_trait]
impl DigitalPins for EmulatedMainboard {
    async fn set_atr_reg(&self, bank: Bank, tx_value: u16, rx_value: u16, mask: u16)
        -> Result<()> {
        self.banks[bank.index()].write().set_atr(tx_value, rx_value, mask);
        debug!(
            bank = %bank,
            tx = %format!("0x{:04X}", tx_value),
            rx = %format!("0x{:04X}", rx_value),
            mask = %format!("0x{:04X}", mask),
            "ATR registers set."
        );
        Ok(())
    }

    async fn set_gpio_ddr(&self, bank: Bank, value: u16, mask: u16) -> Result<()> {
        self.banks[bank.index()].write().set_ddr(value, mask);
        debug!(
            bank = %bank,
            value = %format!("0x{:04X}", value),
            mask = %format!("0x{:04X}", mask),
            "GPIO direction set."
        );
        Ok(())
    }

    async fn write_gpio(&self, bank: Bank, value: u16, mask: u16) -> Result<()> {
        self.banks[bank.index()].write().write_output(value, mask);
        trace!(
            bank = %bank,
            value = %format!("0x{:04X}", value),
            mask = %format!("0x{:04X}", mask),
            "GPIO written."
        );
        Ok(())
    }

    async fn read_gpio(&self, bank: Bank) -> Result<u16> {
        let mode = *self.mode.read();
        Ok(self.banks[bank.index()].read().level(mode))
    }
}

#[async_trait]
impl SerialBus for EmulatedMainboard {
    async fn write_i2c(&self, address: I2cAddress, data: &[u8]) -> Result<()> {
        let mut devices = self.lock_bus(&self.i2c).await?;
        let result = match devices.get_mut(&address) {
            Some(device) => self.bounded(device.write(data)).await,
            None => Err(BusError::Nack { address }),
        };
        self.record(BusTarget::I2c(address), false, data, result.as_ref().err());
        Ok(result?)
    }

    async fn read_i2c(&self, address: I2cAddress, len: usize) -> Result<Vec<u8>> {
        check_read_len(len)?;
        let mut devices = self.lock_bus(&self.i2c).await?;
        let result = match devices.get_mut(&address) {
            None => Err(BusError::Nack { address }),
            // Address-only transaction: presence check.
            Some(_) if len == 0 => Ok(Vec::new()),
            Some(device) => self
                .bounded(device.read(len))
                .await
                .and_then(|bytes| exact_len(len, bytes)),
        };
        let received = result.as_deref().unwrap_or_default();
        self.record(BusTarget::I2c(address), true, received, result.as_ref().err());
        Ok(result?)
    }

    async fn write_spi(&self, device: SpiDevice, push: SpiPushEdge, data: &[u8]) -> Result<()> {
        let mut slot = self.lock_bus(&self.spi[device.index()]).await?;
        let result = match slot.as_mut() {
            Some(peripheral) => {
                let sampled = if push.edge() == peripheral.sample_edge() {
                    delay_one_bit(data)
                } else {
                    data.to_vec()
                };
                self.bounded(peripheral.receive(&sampled)).await
            }
            // Nothing listening; the bits go nowhere.
            None => Ok(()),
        };
        let target = BusTarget::Spi {
            device,
            edge: push.edge(),
        };
        self.record(target, false, data, result.as_ref().err());
        Ok(result?)
    }

    async fn read_spi(&self, device: SpiDevice, latch: SpiLatchEdge, len: usize)
        -> Result<Vec<u8>> {
        check_read_len(len)?;
        let mut slot = self.lock_bus(&self.spi[device.index()]).await?;
        let result = match slot.as_mut() {
            Some(peripheral) => {
                let skewed = latch.edge() == peripheral.drive_edge();
                self.bounded(peripheral.transmit(len))
                    .await
                    .and_then(|bytes| exact_len(len, bytes))
                    .map(|bytes| if skewed { delay_one_bit(&bytes) } else { bytes })
            }
            // MISO idles low.
            None => Ok(vec![0; len]),
        };
        let target = BusTarget::Spi {
            device,
            edge: latch.edge(),
        };
        let received = result.as_deref().unwrap_or_default();
        self.record(target, true, received, result.as_ref().err());
        Ok(result?)
    }
}

#[async_trait]
impl ClockQuery for EmulatedMainboard {
    async fn rx_clock_rate(&self) -> Result<ClockRate> {
        Ok(self.clocks.read().rx)
    }

    async fn tx_clock_rate(&self) -> Result<ClockRate> {
        Ok(self.clocks.read().tx)
    }
}
