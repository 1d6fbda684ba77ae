//! Control-channel protocol.
//!
//! Carries the daughterboard control contract over a byte stream, usually a
//! USB CDC-ACM serial port, so a driver on a host can drive a remote
//! mainboard controller. [`ControlChannel`] is the client,
//! [`TunneledMainboard`] puts the contract on top of it, and [`serve`]
//! answers requests on the mainboard side.
//!
//! Frame layout, integers little-endian:
//!
//! ```text
//! request:  [len u16][id u8][opcode u8][payload ...]
//! response: [len u16][id u8][status u8][payload ...]
//! ```
//!
//! `len` counts the bytes following it. A response carries the ID of the
//! request it answers. Error responses carry the fields needed to rebuild
//! the original [`Error`] followed by a UTF-8 message.

mod channel;
mod server;
mod tunnel;

pub use channel::{ChannelTimeouts, ControlChannel};
pub use server::serve;
pub use tunnel::TunneledMainboard;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use strum::{Display, FromRepr};
use tokio_util::codec::{Decoder, Encoder};

use crate::hw_trait::{
    AuxKind, Bank, BusError, Edge, Error, I2cAddress, Result, SpiDevice, SpiLatchEdge,
    SpiPushEdge,
};
use crate::tracing::prelude::*;

/// Largest frame accepted in either direction, length prefix included.
pub const MAX_FRAME_LEN: usize = 4096;

/// Length prefix, ID and opcode/status.
const HEADER_LEN: usize = 4;

/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    WriteAuxDac = 0x01,
    ReadAuxAdc = 0x02,
    SetAtrReg = 0x10,
    SetGpioDdr = 0x11,
    WriteGpio = 0x12,
    ReadGpio = 0x13,
    WriteI2c = 0x20,
    ReadI2c = 0x21,
    WriteSpi = 0x30,
    ReadSpi = 0x31,
    RxClockRate = 0x40,
    TxClockRate = 0x41,
}

/// Outcome of a request. Every error kind has its own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    InvalidChannel = 0x01,
    InvalidValue = 0x02,
    InvalidBank = 0x03,
    InvalidAddress = 0x04,
    HardwareFault = 0x05,
    Nack = 0x06,
    ArbitrationLost = 0x07,
    Timeout = 0x08,
    ShortRead = 0x09,
    BusFault = 0x0A,
    NotSupported = 0x0B,
    Protocol = 0x0C,
}

/// One contract operation as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    WriteAuxDac { channel: u8, value: u32 },
    ReadAuxAdc { channel: u8 },
    SetAtrReg { bank: Bank, tx_value: u16, rx_value: u16, mask: u16 },
    SetGpioDdr { bank: Bank, value: u16, mask: u16 },
    WriteGpio { bank: Bank, value: u16, mask: u16 },
    ReadGpio { bank: Bank },
    WriteI2c { address: I2cAddress, data: Vec<u8> },
    ReadI2c { address: I2cAddress, len: u16 },
    WriteSpi { device: SpiDevice, push: SpiPushEdge, data: Vec<u8> },
    ReadSpi { device: SpiDevice, latch: SpiLatchEdge, len: u16 },
    RxClockRate,
    TxClockRate,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::WriteAuxDac { .. } => Opcode::WriteAuxDac,
            Request::ReadAuxAdc { .. } => Opcode::ReadAuxAdc,
            Request::SetAtrReg { .. } => Opcode::SetAtrReg,
            Request::SetGpioDdr { .. } => Opcode::SetGpioDdr,
            Request::WriteGpio { .. } => Opcode::WriteGpio,
            Request::ReadGpio { .. } => Opcode::ReadGpio,
            Request::WriteI2c { .. } => Opcode::WriteI2c,
            Request::ReadI2c { .. } => Opcode::ReadI2c,
            Request::WriteSpi { .. } => Opcode::WriteSpi,
            Request::ReadSpi { .. } => Opcode::ReadSpi,
            Request::RxClockRate => Opcode::RxClockRate,
            Request::TxClockRate => Opcode::TxClockRate,
        }
    }

    fn put_payload(&self, dst: &mut BytesMut) {
        match self {
            Request::WriteAuxDac { channel, value } => {
                dst.put_u8(*channel);
                dst.put_u32_le(*value);
            }
            Request::ReadAuxAdc { channel } => dst.put_u8(*channel),
            Request::SetAtrReg {
                bank,
                tx_value,
                rx_value,
                mask,
            } => {
                dst.put_u8(u8::from(*bank));
                dst.put_u16_le(*tx_value);
                dst.put_u16_le(*rx_value);
                dst.put_u16_le(*mask);
            }
            Request::SetGpioDdr { bank, value, mask } | Request::WriteGpio { bank, value, mask } => {
                dst.put_u8(u8::from(*bank));
                dst.put_u16_le(*value);
                dst.put_u16_le(*mask);
            }
            Request::ReadGpio { bank } => dst.put_u8(u8::from(*bank)),
            Request::WriteI2c { address, data } => {
                dst.put_u8(address.get());
                dst.put_slice(data);
            }
            Request::ReadI2c { address, len } => {
                dst.put_u8(address.get());
                dst.put_u16_le(*len);
            }
            Request::WriteSpi { device, push, data } => {
                dst.put_u8(u8::from(*device));
                dst.put_u8(edge_to_wire(push.edge()));
                dst.put_slice(data);
            }
            Request::ReadSpi { device, latch, len } => {
                dst.put_u8(u8::from(*device));
                dst.put_u8(edge_to_wire(latch.edge()));
                dst.put_u16_le(*len);
            }
            Request::RxClockRate | Request::TxClockRate => {}
        }
    }

    /// Parse the payload of a frame carrying `opcode`.
    pub fn decode(opcode: u8, mut payload: &[u8]) -> Result<Self> {
        let opcode = Opcode::from_repr(opcode)
            .ok_or_else(|| Error::Protocol(format!("unknown opcode 0x{:02X}", opcode)))?;
        let buf = &mut payload;

        let request = match opcode {
            Opcode::WriteAuxDac => Request::WriteAuxDac {
                channel: take_u8(buf)?,
                value: take_u32(buf)?,
            },
            Opcode::ReadAuxAdc => Request::ReadAuxAdc {
                channel: take_u8(buf)?,
            },
            Opcode::SetAtrReg => Request::SetAtrReg {
                bank: Bank::try_from(take_u8(buf)?)?,
                tx_value: take_u16(buf)?,
                rx_value: take_u16(buf)?,
                mask: take_u16(buf)?,
            },
            Opcode::SetGpioDdr => Request::SetGpioDdr {
                bank: Bank::try_from(take_u8(buf)?)?,
                value: take_u16(buf)?,
                mask: take_u16(buf)?,
            },
            Opcode::WriteGpio => Request::WriteGpio {
                bank: Bank::try_from(take_u8(buf)?)?,
                value: take_u16(buf)?,
                mask: take_u16(buf)?,
            },
            Opcode::ReadGpio => Request::ReadGpio {
                bank: Bank::try_from(take_u8(buf)?)?,
            },
            Opcode::WriteI2c => Request::WriteI2c {
                address: I2cAddress::new(take_u8(buf)?)?,
                data: take_rest(buf),
            },
            Opcode::ReadI2c => Request::ReadI2c {
                address: I2cAddress::new(take_u8(buf)?)?,
                len: take_read_len(buf)?,
            },
            Opcode::WriteSpi => Request::WriteSpi {
                device: SpiDevice::try_from(take_u8(buf)?)?,
                push: SpiPushEdge::from(take_edge(buf)?),
                data: take_rest(buf),
            },
            Opcode::ReadSpi => Request::ReadSpi {
                device: SpiDevice::try_from(take_u8(buf)?)?,
                latch: SpiLatchEdge::from(take_edge(buf)?),
                len: take_read_len(buf)?,
            },
            Opcode::RxClockRate => Request::RxClockRate,
            Opcode::TxClockRate => Request::TxClockRate,
        };

        if !buf.is_empty() {
            return Err(Error::Protocol(format!(
                "{} request has {} trailing bytes",
                opcode,
                buf.len()
            )));
        }
        Ok(request)
    }
}

fn edge_to_wire(edge: Edge) -> u8 {
    match edge {
        Edge::Rising => 0,
        Edge::Falling => 1,
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::Protocol(format!(
            "payload truncated: need {} more bytes, have {}",
            needed,
            buf.len()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(*buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(*buf, 2)?;
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(*buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_edge(buf: &mut &[u8]) -> Result<Edge> {
    match take_u8(buf)? {
        0 => Ok(Edge::Rising),
        1 => Ok(Edge::Falling),
        other => Err(Error::Protocol(format!("unknown clock edge {}", other))),
    }
}

fn take_read_len(buf: &mut &[u8]) -> Result<u16> {
    let len = take_u16(buf)?;
    if usize::from(len) > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidValue(format!(
            "read of {} bytes exceeds frame payload limit {}",
            len, MAX_PAYLOAD_LEN
        )));
    }
    Ok(len)
}

fn take_rest(buf: &mut &[u8]) -> Vec<u8> {
    std::mem::take(buf).to_vec()
}

/// Request tagged with the ID its response must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub request: Request,
}

/// Answer to one [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u8,
    pub status: Status,
    pub payload: Bytes,
}

impl Response {
    pub fn ok(id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            status: Status::Ok,
            payload: payload.into(),
        }
    }

    /// Error response from which [`Response::error`] rebuilds `err`.
    pub fn failure(id: u8, err: &Error) -> Self {
        let mut payload = BytesMut::new();
        let (status, message) = match err {
            Error::InvalidChannel {
                kind,
                channel,
                available,
            } => {
                payload.put_u8(match kind {
                    AuxKind::Dac => 0,
                    AuxKind::Adc => 1,
                });
                payload.put_u32_le(saturate(*channel));
                payload.put_u32_le(saturate(*available));
                (Status::InvalidChannel, err.to_string())
            }
            Error::InvalidValue(msg) => (Status::InvalidValue, msg.clone()),
            Error::InvalidBank(bank) => {
                payload.put_u8(*bank);
                (Status::InvalidBank, err.to_string())
            }
            Error::InvalidAddress(address) => {
                payload.put_u8(*address);
                (Status::InvalidAddress, err.to_string())
            }
            Error::HardwareFault(msg) => (Status::HardwareFault, msg.clone()),
            Error::Io(e) => (Status::HardwareFault, e.to_string()),
            Error::Bus(BusError::Nack { address }) => {
                payload.put_u8(address.get());
                (Status::Nack, err.to_string())
            }
            Error::Bus(BusError::ArbitrationLost) => (Status::ArbitrationLost, err.to_string()),
            Error::Bus(BusError::Timeout) => (Status::Timeout, err.to_string()),
            Error::Bus(BusError::ShortRead { expected, actual }) => {
                payload.put_u32_le(saturate(*expected));
                payload.put_u32_le(saturate(*actual));
                (Status::ShortRead, err.to_string())
            }
            Error::Bus(BusError::Fault(msg)) => (Status::BusFault, msg.clone()),
            Error::NotSupported(capability) => (Status::NotSupported, capability.to_string()),
            Error::Protocol(msg) => (Status::Protocol, msg.clone()),
        };

        let room = MAX_PAYLOAD_LEN - payload.len();
        payload.put_slice(truncate_utf8(&message, room).as_bytes());
        Self {
            id,
            status,
            payload: payload.freeze(),
        }
    }

    /// The error this response reports, if any.
    pub fn error(&self) -> Option<Error> {
        if self.status == Status::Ok {
            return None;
        }
        Some(self.decode_error().unwrap_or_else(|e| e))
    }

    fn decode_error(&self) -> Result<Error> {
        let buf = &mut &self.payload[..];
        let err = match self.status {
            Status::Ok => Error::Protocol("success status carries no error".into()),
            Status::InvalidChannel => Error::InvalidChannel {
                kind: match take_u8(buf)? {
                    0 => AuxKind::Dac,
                    _ => AuxKind::Adc,
                },
                channel: take_u32(buf)? as usize,
                available: take_u32(buf)? as usize,
            },
            Status::InvalidValue => Error::InvalidValue(message(*buf)),
            Status::InvalidBank => Error::InvalidBank(take_u8(buf)?),
            Status::InvalidAddress => Error::InvalidAddress(take_u8(buf)?),
            Status::HardwareFault => Error::HardwareFault(message(*buf)),
            Status::Nack => BusError::Nack {
                address: I2cAddress::new(take_u8(buf)?)?,
            }
            .into(),
            Status::ArbitrationLost => BusError::ArbitrationLost.into(),
            Status::Timeout => BusError::Timeout.into(),
            Status::ShortRead => BusError::ShortRead {
                expected: take_u32(buf)? as usize,
                actual: take_u32(buf)? as usize,
            }
            .into(),
            Status::BusFault => BusError::Fault(message(*buf)).into(),
            Status::NotSupported => Error::NotSupported(capability_name(&message(*buf))),
            Status::Protocol => Error::Protocol(message(*buf)),
        };
        Ok(err)
    }
}

fn saturate(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn message(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).into_owned()
}

/// Map a remote capability name back onto the names used locally.
fn capability_name(name: &str) -> &'static str {
    const KNOWN: [&str; 5] = ["aux analog", "GPIO", "I2C", "SPI", "clock query"];
    KNOWN
        .into_iter()
        .find(|known| *known == name)
        .unwrap_or("remote capability")
}

/// Split one complete frame body (everything after the length prefix) off
/// `src`, or return `None` if more bytes are needed.
fn take_frame(src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
    if src.len() < 2 {
        return Ok(None);
    }
    let len = usize::from(u16::from_le_bytes([src[0], src[1]]));
    if len + 2 > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", len + 2, MAX_FRAME_LEN),
        ));
    }
    if len < HEADER_LEN - 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body of {} bytes has no header", len),
        ));
    }
    if src.len() < len + 2 {
        src.reserve(len + 2 - src.len());
        return Ok(None);
    }
    src.advance(2);
    Ok(Some(src.split_to(len)))
}

/// Write a frame header, let `body` append the rest, then patch the length.
fn put_frame(
    dst: &mut BytesMut,
    id: u8,
    code: u8,
    body: impl FnOnce(&mut BytesMut),
) -> io::Result<()> {
    let start = dst.len();
    dst.put_u16_le(0);
    dst.put_u8(id);
    dst.put_u8(code);
    body(dst);

    let frame_len = dst.len() - start;
    if frame_len > MAX_FRAME_LEN {
        dst.truncate(start);
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", frame_len, MAX_FRAME_LEN),
        ));
    }
    let len = (frame_len - 2) as u16;
    dst[start..start + 2].copy_from_slice(&len.to_le_bytes());
    trace!(id, frame = %hex::encode(&dst[start..]), "Encoded frame.");
    Ok(())
}

/// Client-side codec: encodes [`Packet`]s, decodes [`Response`]s.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl Encoder<Packet> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> io::Result<()> {
        let request = packet.request;
        put_frame(dst, packet.id, request.opcode() as u8, |dst| {
            request.put_payload(dst)
        })
    }
}

impl Decoder for ControlCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Response>> {
        let Some(mut frame) = take_frame(src)? else {
            return Ok(None);
        };
        let id = frame.get_u8();
        let raw = frame.get_u8();
        let status = Status::from_repr(raw).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown status 0x{:02X} in response {}", raw, id),
            )
        })?;
        Ok(Some(Response {
            id,
            status,
            payload: frame.freeze(),
        }))
    }
}

/// A request as received by the server. Requests that fail to parse keep
/// their ID so they can still be answered.
#[derive(Debug)]
pub struct Incoming {
    pub id: u8,
    pub request: Result<Request>,
}

/// Server-side codec: decodes [`Incoming`] requests, encodes
/// [`Response`]s.
#[derive(Debug, Default)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = Incoming;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Incoming>> {
        let Some(mut frame) = take_frame(src)? else {
            return Ok(None);
        };
        trace!(frame = %hex::encode(&frame), "Received frame.");
        let id = frame.get_u8();
        let opcode = frame.get_u8();
        Ok(Some(Incoming {
            id,
            request: Request::decode(opcode, &frame),
        }))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> io::Result<()> {
        put_frame(dst, response.id, response.status as u8, |dst| {
            dst.put_slice(&response.payload)
        })
    }
}
