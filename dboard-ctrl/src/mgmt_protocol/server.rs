//! Mainboard side of the control channel.

use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::{Incoming, Request, Response, ServerCodec};
use crate::hw_trait::{AuxAnalog, ClockQuery, DboardInterface, DigitalPins, Result, SerialBus};
use crate::tracing::prelude::*;

/// Answer control requests arriving on `stream` using `iface`.
///
/// Runs until the peer closes the stream or `cancel` fires. Requests are
/// handled one at a time in arrival order. A request that cannot be parsed
/// is answered with an error response; only a broken framing layer ends the
/// session with an error.
pub async fn serve<S, I>(stream: S, iface: &I, cancel: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: DboardInterface + ?Sized,
{
    let mut framed = Framed::new(stream, ServerCodec);
    debug!("Control session started.");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Control session cancelled.");
                return Ok(());
            }
            frame = framed.next() => frame,
        };

        let Incoming { id, request } = match frame {
            Some(Ok(incoming)) => incoming,
            Some(Err(e)) => {
                warn!(error = %e, "Control framing error, closing session.");
                return Err(e.into());
            }
            None => {
                debug!("Control peer closed the stream.");
                return Ok(());
            }
        };

        let response = match request {
            Ok(request) => {
                let opcode = request.opcode();
                match dispatch(iface, request).await {
                    Ok(payload) => Response::ok(id, payload.freeze()),
                    Err(e) => {
                        debug!(id, opcode = %opcode, error = %e, "Request failed.");
                        Response::failure(id, &e)
                    }
                }
            }
            Err(e) => {
                warn!(id, error = %e, "Malformed control request.");
                Response::failure(id, &e)
            }
        };

        framed.send(response).await?;
    }
}

async fn dispatch<I>(iface: &I, request: Request) -> Result<BytesMut>
where
    I: DboardInterface + ?Sized,
{
    let mut payload = BytesMut::new();
    match request {
        Request::WriteAuxDac { channel, value } => {
            iface.write_aux_dac(usize::from(channel), value).await?;
        }
        Request::ReadAuxAdc { channel } => {
            payload.put_u32_le(iface.read_aux_adc(usize::from(channel)).await?);
        }
        Request::SetAtrReg {
            bank,
            tx_value,
            rx_value,
            mask,
        } => {
            iface.set_atr_reg(bank, tx_value, rx_value, mask).await?;
        }
        Request::SetGpioDdr { bank, value, mask } => {
            iface.set_gpio_ddr(bank, value, mask).await?;
        }
        Request::WriteGpio { bank, value, mask } => {
            iface.write_gpio(bank, value, mask).await?;
        }
        Request::ReadGpio { bank } => {
            payload.put_u16_le(iface.read_gpio(bank).await?);
        }
        Request::WriteI2c { address, data } => {
            iface.write_i2c(address, &data).await?;
        }
        Request::ReadI2c { address, len } => {
            payload.put_slice(&iface.read_i2c(address, usize::from(len)).await?);
        }
        Request::WriteSpi { device, push, data } => {
            iface.write_spi(device, push, &data).await?;
        }
        Request::ReadSpi { device, latch, len } => {
            payload.put_slice(&iface.read_spi(device, latch, usize::from(len)).await?);
        }
        Request::RxClockRate => {
            payload.put_f64_le(iface.rx_clock_rate().await?.hz());
        }
        Request::TxClockRate => {
            payload.put_f64_le(iface.tx_clock_rate().await?.hz());
        }
    }
    Ok(payload)
}
