//! Control channel client.
//!
//! Handles packet ID management and request/response correlation over any
//! byte stream.

use bytes::Bytes;
use futures::SinkExt;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time;
use tokio_serial::SerialPortBuilderExt;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{ControlCodec, Packet, Request, Response};
use crate::config::ControlConfig;
use crate::hw_trait::{Error, Result};
use crate::tracing::prelude::*;

/// Bounds on each stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// Waiting for another request on the same channel to finish
    pub lock: Duration,
    pub write: Duration,
    pub read: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(2),
            write: Duration::from_secs(1),
            read: Duration::from_secs(1),
        }
    }
}

impl From<&ControlConfig> for ChannelTimeouts {
    fn from(config: &ControlConfig) -> Self {
        Self {
            lock: Duration::from_millis(config.lock_timeout_ms),
            write: Duration::from_millis(config.write_timeout_ms),
            read: Duration::from_millis(config.read_timeout_ms),
        }
    }
}

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, ControlCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, ControlCodec>;

/// Client end of the control protocol.
///
/// One request is in flight at a time. The channel can be cloned so several
/// components share it; clones queue behind each other.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Mutex<ControlChannelInner>>,
    timeouts: ChannelTimeouts,
}

struct ControlChannelInner {
    writer: Writer,
    reader: Reader,
    next_id: u8,
    /// Requests given up on whose responses may still arrive
    abandoned: HashSet<u8>,
}

impl ControlChannelInner {
    /// Read frames until the response to `id`, dropping late responses to
    /// abandoned requests.
    async fn receive(&mut self, id: u8) -> Result<Response> {
        loop {
            let response = self.reader.next().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "Control stream closed")
            })??;

            if response.id == id {
                return Ok(response);
            }
            if !self.abandoned.remove(&response.id) {
                return Err(Error::Protocol(format!(
                    "response ID mismatch: expected {}, got {}",
                    id, response.id
                )));
            }
            debug!(id = response.id, "Dropped late response.");
        }
    }
}

impl ControlChannel {
    /// Create a control channel over `stream` with default timeouts.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_timeouts(stream, ChannelTimeouts::default())
    }

    pub fn with_timeouts<S>(stream: S, timeouts: ChannelTimeouts) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            inner: Arc::new(Mutex::new(ControlChannelInner {
                writer: FramedWrite::new(writer, ControlCodec),
                reader: FramedRead::new(reader, ControlCodec),
                next_id: 0,
                abandoned: HashSet::new(),
            })),
            timeouts,
        }
    }

    /// Open the serial port named in `config`.
    pub fn open(config: &ControlConfig) -> crate::error::Result<Self> {
        let port = tokio_serial::new(config.serial_port.to_string_lossy(), config.baud_rate)
            .open_native_async()?;
        info!(
            port = %config.serial_port.display(),
            baud = config.baud_rate,
            "Opened control channel."
        );
        Ok(Self::with_timeouts(port, ChannelTimeouts::from(config)))
    }

    /// Send `request` and wait for its response.
    ///
    /// Returns the response payload, or the error the remote end reported.
    pub async fn request(&self, request: Request) -> Result<Bytes> {
        let mut inner = time::timeout(self.timeouts.lock, self.inner.lock())
            .await
            .map_err(|_| timed_out("Control channel lock timeout (possible deadlock)"))?;

        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        // A reused ID can no longer be told apart from its predecessor.
        inner.abandoned.remove(&id);
        let opcode = request.opcode();

        // Frame contents are logged by the encoder.
        let sent = time::timeout(self.timeouts.write, inner.writer.send(Packet { id, request })).await;
        match sent {
            Ok(sent) => sent?,
            Err(_) => {
                inner.abandoned.insert(id);
                return Err(timed_out("Control request write timeout"));
            }
        }

        let received = time::timeout(self.timeouts.read, inner.receive(id)).await;
        let response = match received {
            Ok(response) => response?,
            Err(_) => {
                inner.abandoned.insert(id);
                return Err(timed_out("Control request read timeout"));
            }
        };

        if let Some(err) = response.error() {
            debug!(id, opcode = %opcode, error = %err, "Remote request failed.");
            return Err(err);
        }

        Ok(response.payload)
    }
}

fn timed_out(what: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_trait::Bank;
    use crate::mgmt_protocol::{Response, ServerCodec, Status};
    use futures::SinkExt;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn test_ids_increment_and_payload_returned() {
        let (client, server) = tokio::io::duplex(1024);
        let channel = ControlChannel::new(client);

        let peer = tokio::spawn(async move {
            let mut framed = Framed::new(server, ServerCodec);
            let mut ids = Vec::new();
            for _ in 0..3 {
                let incoming = framed.next().await.unwrap().unwrap();
                ids.push(incoming.id);
                framed
                    .send(Response::ok(incoming.id, vec![0x34, 0x12]))
                    .await
                    .unwrap();
            }
            ids
        });

        for _ in 0..3 {
            let payload = channel.request(Request::ReadGpio { bank: Bank::Tx }).await.unwrap();
            assert_eq!(&payload[..], &[0x34, 0x12]);
        }
        assert_eq!(peer.await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_mismatched_response_id_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let channel = ControlChannel::new(client);

        tokio::spawn(async move {
            let mut framed = Framed::new(server, ServerCodec);
            let incoming = framed.next().await.unwrap().unwrap();
            framed
                .send(Response::ok(incoming.id.wrapping_add(1), Vec::new()))
                .await
                .unwrap();
        });

        let result = channel.request(Request::RxClockRate).await;
        assert!(matches!(result, Err(Error::Protocol(msg)) if msg.contains("mismatch")));
    }

    #[tokio::test]
    async fn test_remote_error_returned() {
        let (client, server) = tokio::io::duplex(1024);
        let channel = ControlChannel::new(client);

        tokio::spawn(async move {
            let mut framed = Framed::new(server, ServerCodec);
            let incoming = framed.next().await.unwrap().unwrap();
            let response = Response::failure(incoming.id, &Error::InvalidBank(3));
            assert_eq!(response.status, Status::InvalidBank);
            framed.send(response).await.unwrap();
        });

        let result = channel.request(Request::ReadGpio { bank: Bank::Rx }).await;
        assert!(matches!(result, Err(Error::InvalidBank(3))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (client, _server) = tokio::io::duplex(1024);
        let channel = ControlChannel::new(client);
        let result = channel.request(Request::TxClockRate).await;
        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_late_response() {
        let (client, server) = tokio::io::duplex(1024);
        let channel = ControlChannel::new(client);

        tokio::spawn(async move {
            let mut framed = Framed::new(server, ServerCodec);
            let first = framed.next().await.unwrap().unwrap();
            time::sleep(Duration::from_millis(1500)).await;
            framed.send(Response::ok(first.id, vec![0xAA])).await.unwrap();
            while let Some(Ok(incoming)) = framed.next().await {
                framed.send(Response::ok(incoming.id, vec![incoming.id])).await.unwrap();
            }
        });

        let late = channel.request(Request::TxClockRate).await;
        assert!(matches!(late, Err(Error::Io(e)) if e.kind() == io::ErrorKind::TimedOut));

        for id in 1..5u8 {
            let payload = channel.request(Request::RxClockRate).await.unwrap();
            assert_eq!(&payload[..], &[id]);
        }
    }

    #[tokio::test]
    async fn test_unknown_response_id_after_timeout_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let channel = ControlChannel::with_timeouts(
            client,
            ChannelTimeouts {
                read: Duration::from_millis(20),
                ..ChannelTimeouts::default()
            },
        );

        tokio::spawn(async move {
            let mut framed = Framed::new(server, ServerCodec);
            // Ignore the first request, answer the second with an ID never sent.
            framed.next().await.unwrap().unwrap();
            framed.next().await.unwrap().unwrap();
            framed.send(Response::ok(9, Vec::new())).await.unwrap();
        });

        assert!(channel.request(Request::TxClockRate).await.is_err());
        let result = channel.request(Request::TxClockRate).await;
        assert!(matches!(result, Err(Error::Protocol(msg)) if msg.contains("mismatch")));
    }

    #[tokio::test]
    async fn test_closed_stream_reported() {
        let (client, server) = tokio::io::duplex(1024);
        let channel = ControlChannel::new(client);
        drop(server);
        assert!(matches!(
            channel.request(Request::TxClockRate).await,
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_timeouts_from_config() {
        let config = ControlConfig {
            read_timeout_ms: 250,
            ..ControlConfig::default()
        };
        let timeouts = ChannelTimeouts::from(&config);
        assert_eq!(timeouts.read, Duration::from_millis(250));
        assert_eq!(timeouts.lock, Duration::from_secs(2));
    }
}
