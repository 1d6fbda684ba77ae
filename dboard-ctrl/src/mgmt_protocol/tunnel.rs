//! The control contract carried over a [`ControlChannel`].

use async_trait::async_trait;
use bytes::Bytes;

use super::{ControlChannel, Request, MAX_PAYLOAD_LEN};
use crate::hw_trait::{
    AuxAnalog, AuxKind, Bank, ClockQuery, DigitalPins, Error, I2cAddress, Result, SerialBus,
    SpiDevice, SpiLatchEdge, SpiPushEdge,
};
use crate::types::ClockRate;

/// Highest channel count the wire format can address.
const WIRE_CHANNELS: usize = u8::MAX as usize + 1;

/// Remote mainboard reached through a control channel.
///
/// Errors raised on the far side come back as the same [`Error`] variants;
/// channel failures surface as [`Error::Io`] or [`Error::Protocol`].
#[derive(Clone)]
pub struct TunneledMainboard {
    channel: ControlChannel,
}

impl TunneledMainboard {
    pub fn new(channel: ControlChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    async fn request_empty(&self, request: Request) -> Result<()> {
        let payload = self.channel.request(request).await?;
        fixed::<0>(&payload)?;
        Ok(())
    }
}

fn wire_channel(kind: AuxKind, channel: usize) -> Result<u8> {
    u8::try_from(channel).map_err(|_| Error::InvalidChannel {
        kind,
        channel,
        available: WIRE_CHANNELS,
    })
}

fn wire_read_len(len: usize) -> Result<u16> {
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidValue(format!(
            "read of {} bytes exceeds frame payload limit {}",
            len, MAX_PAYLOAD_LEN
        )));
    }
    Ok(len as u16)
}

fn check_write_len(len: usize, header: usize) -> Result<()> {
    if len + header > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidValue(format!(
            "write of {} bytes exceeds frame payload limit {}",
            len,
            MAX_PAYLOAD_LEN - header
        )));
    }
    Ok(())
}

fn fixed<const N: usize>(payload: &Bytes) -> Result<[u8; N]> {
    <[u8; N]>::try_from(&payload[..]).map_err(|_| {
        Error::Protocol(format!(
            "expected {} byte reply, got {}",
            N,
            payload.len()
        ))
    })
}

fn exact(payload: Bytes, len: usize) -> Result<Vec<u8>> {
    if payload.len() != len {
        return Err(Error::Protocol(format!(
            "expected {} byte reply, got {}",
            len,
            payload.len()
        )));
    }
    Ok(payload.to_vec())
}

#[async_trait]
impl AuxAnalog for TunneledMainboard {
    async fn write_aux_dac(&self, channel: usize, value: u32) -> Result<()> {
        let channel = wire_channel(AuxKind::Dac, channel)?;
        self.request_empty(Request::WriteAuxDac { channel, value }).await
    }

    async fn read_aux_adc(&self, channel: usize) -> Result<u32> {
        let channel = wire_channel(AuxKind::Adc, channel)?;
        let payload = self.channel.request(Request::ReadAuxAdc { channel }).await?;
        Ok(u32::from_le_bytes(fixed(&payload)?))
    }
}

#[async_trait]
impl DigitalPins for TunneledMainboard {
    async fn set_atr_reg(&self, bank: Bank, tx_value: u16, rx_value: u16, mask: u16)
        -> Result<()> {
        self.request_empty(Request::SetAtrReg {
            bank,
            tx_value,
            rx_value,
            mask,
        })
        .await
    }

    async fn set_gpio_ddr(&self, bank: Bank, value: u16, mask: u16) -> Result<()> {
        self.request_empty(Request::SetGpioDdr { bank, value, mask }).await
    }

    async fn write_gpio(&self, bank: Bank, value: u16, mask: u16) -> Result<()> {
        self.request_empty(Request::WriteGpio { bank, value, mask }).await
    }

    async fn read_gpio(&self, bank: Bank) -> Result<u16> {
        let payload = self.channel.request(Request::ReadGpio { bank }).await?;
        Ok(u16::from_le_bytes(fixed(&payload)?))
    }
}

#[async_trait]
impl SerialBus for TunneledMainboard {
    async fn write_i2c(&self, address: I2cAddress, data: &[u8]) -> Result<()> {
        check_write_len(data.len(), 1)?;
        self.request_empty(Request::WriteI2c {
            address,
            data: data.to_vec(),
        })
        .await
    }

    async fn read_i2c(&self, address: I2cAddress, len: usize) -> Result<Vec<u8>> {
        let request = Request::ReadI2c {
            address,
            len: wire_read_len(len)?,
        };
        exact(self.channel.request(request).await?, len)
    }

    async fn write_spi(&self, device: SpiDevice, push: SpiPushEdge, data: &[u8]) -> Result<()> {
        check_write_len(data.len(), 2)?;
        self.request_empty(Request::WriteSpi {
            device,
            push,
            data: data.to_vec(),
        })
        .await
    }

    async fn read_spi(&self, device: SpiDevice, latch: SpiLatchEdge, len: usize)
        -> Result<Vec<u8>> {
        let request = Request::ReadSpi {
            device,
            latch,
            len: wire_read_len(len)?,
        };
        exact(self.channel.request(request).await?, len)
    }
}

#[async_trait]
impl ClockQuery for TunneledMainboard {
    async fn rx_clock_rate(&self) -> Result<ClockRate> {
        let payload = self.channel.request(Request::RxClockRate).await?;
        ClockRate::from_hz(f64::from_le_bytes(fixed(&payload)?))
    }

    async fn tx_clock_rate(&self) -> Result<ClockRate> {
        let payload = self.channel.request(Request::TxClockRate).await?;
        ClockRate::from_hz(f64::from_le_bytes(fixed(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, MainboardConfig};
    use crate::gpio_bank::AtrMode;
    use crate::hw_trait::{BusError, DboardIface, Edge};
    use crate::mainboard::{EmulatedMainboard, I2cEeprom, SpiLoopback, ADC_TOLERANCE};
    use crate::mgmt_protocol::{serve, MAX_FRAME_LEN};
    use std::sync::Arc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        remote: TunneledMainboard,
        mainboard: Arc<EmulatedMainboard>,
        cancel: CancellationToken,
        server: JoinHandle<Result<()>>,
    }

    fn harness() -> Harness {
        let mainboard = Arc::new(EmulatedMainboard::new(
            &MainboardConfig::default(),
            &BusConfig::default(),
        )
        .unwrap());
        let (client, stream) = tokio::io::duplex(2 * MAX_FRAME_LEN);
        let cancel = CancellationToken::new();

        let server = {
            let mainboard = mainboard.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { serve(stream, mainboard.as_ref(), cancel).await })
        };

        Harness {
            remote: TunneledMainboard::new(ControlChannel::new(client)),
            mainboard,
            cancel,
            server,
        }
    }

    fn addr(raw: u8) -> I2cAddress {
        I2cAddress::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_gpio_mask_confinement_through_tunnel() {
        let h = harness();
        h.remote.set_gpio_ddr(Bank::Tx, 0xFFFF, 0xFFFF).await.unwrap();
        h.remote.write_gpio(Bank::Tx, 0xA5A5, 0xFFFF).await.unwrap();

        h.remote.write_gpio(Bank::Tx, 0x0000, 0x00F0).await.unwrap();
        assert_eq!(h.remote.read_gpio(Bank::Tx).await.unwrap(), 0xA505);

        h.remote.write_gpio(Bank::Tx, 0xFFFF, 0).await.unwrap();
        assert_eq!(h.remote.read_gpio(Bank::Tx).await.unwrap(), 0xA505);
        assert_eq!(h.mainboard.bank_registers(Bank::Rx).ddr, 0);
    }

    #[tokio::test]
    async fn test_atr_scenario_through_tunnel() {
        let h = harness();
        h.remote.set_gpio_ddr(Bank::Tx, 0xFFFF, 0xFFFF).await.unwrap();
        h.remote.set_atr_reg(Bank::Tx, 0xFFFF, 0x0000, 0xFFFF).await.unwrap();

        h.mainboard.set_atr_mode(AtrMode::Transmit);
        assert_eq!(h.remote.read_gpio(Bank::Tx).await.unwrap(), 0xFFFF);
        h.mainboard.set_atr_mode(AtrMode::Receive);
        assert_eq!(h.remote.read_gpio(Bank::Tx).await.unwrap(), 0x0000);
    }

    #[tokio::test]
    async fn test_aux_loopback_through_tunnel() {
        let h = harness();
        h.remote.write_aux_dac(0, 2048).await.unwrap();
        let code = h.remote.read_aux_adc(0).await.unwrap();
        assert!(code.abs_diff(2048) <= ADC_TOLERANCE);

        assert!(matches!(
            h.remote.write_aux_dac(6, 0).await,
            Err(Error::InvalidChannel { kind: AuxKind::Dac, channel: 6, available: 4 })
        ));
        assert!(matches!(
            h.remote.read_aux_adc(1000).await,
            Err(Error::InvalidChannel { available: WIRE_CHANNELS, .. })
        ));
        assert!(matches!(h.remote.write_aux_dac(0, 1 << 12).await, Err(Error::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_spi_round_trip_through_tunnel() {
        let h = harness();
        h.mainboard
            .attach_spi(SpiDevice::Rx, SpiLoopback::new(Edge::Falling))
            .await;
        let buf = [0x01, 0x80, 0x7E];
        h.remote.write_spi(SpiDevice::Rx, SpiPushEdge::Rise, &buf).await.unwrap();
        let read = h.remote.read_spi(SpiDevice::Rx, SpiLatchEdge::Fall, buf.len()).await.unwrap();
        assert_eq!(read, buf);
    }

    #[tokio::test]
    async fn test_i2c_through_tunnel() {
        let h = harness();
        h.mainboard
            .attach_i2c(addr(0x50), I2cEeprom::with_contents(b"DB-1"))
            .await;

        h.remote.write_i2c(addr(0x50), &[0x00]).await.unwrap();
        assert_eq!(h.remote.read_i2c(addr(0x50), 4).await.unwrap(), b"DB-1");

        assert!(matches!(
            h.remote.read_i2c(addr(0x51), 1).await,
            Err(Error::Bus(BusError::Nack { address })) if address == addr(0x51)
        ));
        assert!(h.remote.read_i2c_or_empty(addr(0x51), 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_short_read_through_tunnel() {
        let h = harness();
        h.mainboard
            .attach_i2c(addr(0x22), crate::mainboard::I2cLoopback::new())
            .await;
        h.remote.write_i2c(addr(0x22), &[9]).await.unwrap();
        assert!(matches!(
            h.remote.read_i2c(addr(0x22), 3).await,
            Err(Error::Bus(BusError::ShortRead { expected: 3, actual: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_oversized_transfers_rejected_locally() {
        let h = harness();
        assert!(matches!(
            h.remote.read_spi(SpiDevice::Tx, SpiLatchEdge::Fall, MAX_PAYLOAD_LEN + 1).await,
            Err(Error::InvalidValue(_))
        ));
        let big = vec![0; MAX_PAYLOAD_LEN];
        assert!(matches!(
            h.remote.write_i2c(addr(0x10), &big).await,
            Err(Error::InvalidValue(_))
        ));
        // The channel is still usable.
        assert_eq!(h.remote.rx_clock_rate().await.unwrap().hz(), 64e6);
    }

    #[tokio::test]
    async fn test_clock_rates_through_tunnel() {
        let h = harness();
        h.mainboard.set_clock_rates(
            ClockRate::from_mhz(200.0).unwrap(),
            ClockRate::from_mhz(100.0).unwrap(),
        );
        assert_eq!(h.remote.rx_clock_rate().await.unwrap().mhz(), 200.0);
        assert_eq!(h.remote.tx_clock_rate().await.unwrap().mhz(), 100.0);
    }

    #[tokio::test]
    async fn test_unbound_capability_reported_remotely() {
        let clock_only = DboardIface::builder()
            .clock(Arc::new(EmulatedMainboard::new(
                &MainboardConfig::default(),
                &BusConfig::default(),
            )
            .unwrap()))
            .build();
        let (client, stream) = tokio::io::duplex(MAX_FRAME_LEN);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move { serve(stream, &clock_only, token).await });

        let remote = TunneledMainboard::new(ControlChannel::new(client));
        assert!(matches!(
            remote.read_gpio(Bank::Rx).await,
            Err(Error::NotSupported("GPIO"))
        ));
        assert!(remote.tx_clock_rate().await.is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let h = harness();
        h.remote.read_gpio(Bank::Tx).await.unwrap();
        h.cancel.cancel();
        assert!(h.server.await.unwrap().is_ok());
    }
}
