//! The façade daughterboard drivers hold.

use async_trait::async_trait;
use std::sync::Arc;

use super::{
    AuxAnalog, Bank, ClockQuery, DigitalPins, Error, I2cAddress, Result, SerialBus, SpiDevice,
    SpiLatchEdge, SpiPushEdge,
};
use crate::types::ClockRate;

/// Everything a mainboard offers a daughterboard.
pub trait DboardInterface: AuxAnalog + DigitalPins + SerialBus + ClockQuery {}

impl<T> DboardInterface for T where T: AuxAnalog + DigitalPins + SerialBus + ClockQuery + ?Sized {}

/// Handle binding a daughterboard to its mainboard's capabilities.
///
/// Cheap to clone; every clone talks to the same implementations. Each
/// capability can come from a different object, which lets tests supply
/// only the facets a driver touches.
#[derive(Clone)]
pub struct DboardIface {
    analog: Arc<dyn AuxAnalog>,
    pins: Arc<dyn DigitalPins>,
    bus: Arc<dyn SerialBus>,
    clock: Arc<dyn ClockQuery>,
}

impl DboardIface {
    /// Bind every capability to one mainboard.
    pub fn new<M>(mainboard: Arc<M>) -> Self
    where
        M: DboardInterface + 'static,
    {
        Self {
            analog: mainboard.clone(),
            pins: mainboard.clone(),
            bus: mainboard.clone(),
            clock: mainboard,
        }
    }

    /// Bind capabilities one at a time.
    pub fn builder() -> DboardIfaceBuilder {
        DboardIfaceBuilder::default()
    }

    pub fn analog(&self) -> &dyn AuxAnalog {
        self.analog.as_ref()
    }

    pub fn pins(&self) -> &dyn DigitalPins {
        self.pins.as_ref()
    }

    pub fn bus(&self) -> &dyn SerialBus {
        self.bus.as_ref()
    }

    pub fn clock(&self) -> &dyn ClockQuery {
        self.clock.as_ref()
    }
}

/// Builder for a [`DboardIface`] with individually bound capabilities.
///
/// Capabilities left unbound fail every call with
/// [`Error::NotSupported`].
#[derive(Default)]
pub struct DboardIfaceBuilder {
    analog: Option<Arc<dyn AuxAnalog>>,
    pins: Option<Arc<dyn DigitalPins>>,
    bus: Option<Arc<dyn SerialBus>>,
    clock: Option<Arc<dyn ClockQuery>>,
}

impl DboardIfaceBuilder {
    pub fn analog(mut self, analog: Arc<dyn AuxAnalog>) -> Self {
        self.analog = Some(analog);
        self
    }

    pub fn pins(mut self, pins: Arc<dyn DigitalPins>) -> Self {
        self.pins = Some(pins);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn SerialBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn ClockQuery>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> DboardIface {
        let unsupported = Arc::new(Unsupported);
        DboardIface {
            analog: self
                .analog
                .unwrap_or_else(|| unsupported.clone() as Arc<dyn AuxAnalog>),
            pins: self
                .pins
                .unwrap_or_else(|| unsupported.clone() as Arc<dyn DigitalPins>),
            bus: self
                .bus
                .unwrap_or_else(|| unsupported.clone() as Arc<dyn SerialBus>),
            clock: self
                .clock
                .unwrap_or_else(|| unsupported as Arc<dyn ClockQuery>),
        }
    }
}

/// Stand-in for capabilities a binding does not provide.
struct Unsupported;

#[async_trait]
impl AuxAnalog for Unsupported {
    async fn write_aux_dac(&self, _channel: usize, _value: u32) -> Result<()> {
        Err(Error::NotSupported("aux analog"))
    }

    async fn read_aux_adc(&self, _channel: usize) -> Result<u32> {
        Err(Error::NotSupported("aux analog"))
    }
}

#[async_trait]
impl DigitalPins for Unsupported {
    async fn set_atr_reg(&self, _bank: Bank, _tx: u16, _rx: u16, _mask: u16) -> Result<()> {
        Err(Error::NotSupported("GPIO"))
    }

    async fn set_gpio_ddr(&self, _bank: Bank, _value: u16, _mask: u16) -> Result<()> {
        Err(Error::NotSupported("GPIO"))
    }

    async fn write_gpio(&self, _bank: Bank, _value: u16, _mask: u16) -> Result<()> {
        Err(Error::NotSupported("GPIO"))
    }

    async fn read_gpio(&self, _bank: Bank) -> Result<u16> {
        Err(Error::NotSupported("GPIO"))
    }
}

#[async_trait]
impl SerialBus for Unsupported {
    async fn write_i2c(&self, _address: I2cAddress, _data: &[u8]) -> Result<()> {
        Err(Error::NotSupported("I2C"))
    }

    async fn read_i2c(&self, _address: I2cAddress, _len: usize) -> Result<Vec<u8>> {
        Err(Error::NotSupported("I2C"))
    }

    async fn write_spi(&self, _device: SpiDevice, _push: SpiPushEdge, _data: &[u8]) -> Result<()> {
        Err(Error::NotSupported("SPI"))
    }

    async fn read_spi(&self, _device: SpiDevice, _latch: SpiLatchEdge, _len: usize)
        -> Result<Vec<u8>> {
        Err(Error::NotSupported("SPI"))
    }
}

#[async_trait]
impl ClockQuery for Unsupported {
    async fn rx_clock_rate(&self) -> Result<ClockRate> {
        Err(Error::NotSupported("clock query"))
    }

    async fn tx_clock_rate(&self) -> Result<ClockRate> {
        Err(Error::NotSupported("clock query"))
    }
}

#[async_trait]
impl AuxAnalog for DboardIface {
    async fn write_aux_dac(&self, channel: usize, value: u32) -> Result<()> {
        self.analog.write_aux_dac(channel, value).await
    }

    async fn read_aux_adc(&self, channel: usize) -> Result<u32> {
        self.analog.read_aux_adc(channel).await
    }
}

#[async_trait]
impl DigitalPins for DboardIface {
    async fn set_atr_reg(&self, bank: Bank, tx_value: u16, rx_value: u16, mask: u16)
        -> Result<()> {
        self.pins.set_atr_reg(bank, tx_value, rx_value, mask).await
    }

    async fn set_gpio_ddr(&self, bank: Bank, value: u16, mask: u16) -> Result<()> {
        self.pins.set_gpio_ddr(bank, value, mask).await
    }

    async fn write_gpio(&self, bank: Bank, value: u16, mask: u16) -> Result<()> {
        self.pins.write_gpio(bank, value, mask).await
    }

    async fn read_gpio(&self, bank: Bank) -> Result<u16> {
        self.pins.read_gpio(bank).await
    }
}

#[async_trait]
impl SerialBus for DboardIface {
    async fn write_i2c(&self, address: I2cAddress, data: &[u8]) -> Result<()> {
        self.bus.write_i2c(address, data).await
    }

    async fn read_i2c(&self, address: I2cAddress, len: usize) -> Result<Vec<u8>> {
        self.bus.read_i2c(address, len).await
    }

    async fn write_spi(&self, device: SpiDevice, push: SpiPushEdge, data: &[u8]) -> Result<()> {
        self.bus.write_spi(device, push, data).await
    }

    async fn read_spi(&self, device: SpiDevice, latch: SpiLatchEdge, len: usize)
        -> Result<Vec<u8>> {
        self.bus.read_spi(device, latch, len).await
    }
}

#[async_trait]
impl ClockQuery for DboardIface {
    async fn rx_clock_rate(&self) -> Result<ClockRate> {
        self.clock.rx_clock_rate().await
    }

    async fn tx_clock_rate(&self) -> Result<ClockRate> {
        self.clock.tx_clock_rate().await
    }
}
