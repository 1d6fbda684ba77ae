//! Emulated mainboard daemon.
//!
//! Serves the daughterboard control protocol on a serial port, backed by an
//! emulated mainboard built from the configuration file.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::time;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use dboard_ctrl::config::Config;
use dboard_ctrl::hw_trait::DboardIface;
use dboard_ctrl::mainboard::EmulatedMainboard;
use dboard_ctrl::mgmt_protocol;
use dboard_ctrl::tracing::{self, prelude::*};

/// Pause between a failed control session and the next.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Answer control sessions on `port` until cancelled.
async fn serve_port<S>(mut port: S, iface: DboardIface, running: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!("Task started.");

    while !running.is_cancelled() {
        match mgmt_protocol::serve(&mut port, &iface, running.clone()).await {
            Ok(()) => break,
            Err(e) => warn!(error = %e, "Control session failed, restarting."),
        }
        tokio::select! {
            _ = running.cancelled() => break,
            _ = time::sleep(RESTART_DELAY) => {},
        }
    }

    trace!("Task stopped.");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;
    let mainboard =
        Arc::new(EmulatedMainboard::from_config(&config).context("building emulated mainboard")?);
    let iface = DboardIface::new(mainboard);

    let control = &config.control;
    let port = tokio_serial::new(control.serial_port.to_string_lossy(), control.baud_rate)
        .open_native_async()
        .with_context(|| format!("opening {}", control.serial_port.display()))?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(serve_port(port, iface, running.clone()));
    tracker.close();
    info!(port = %control.serial_port.display(), baud = control.baud_rate, "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = tracker.wait() => warn!("Control task exited."),
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dboard_ctrl::config::{BusConfig, MainboardConfig};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// A port whose device has gone away: every read fails.
    struct UnpluggedPort {
        reads: Arc<AtomicUsize>,
    }

    impl AsyncRead for UnpluggedPort {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")))
        }
    }

    impl AsyncWrite for UnpluggedPort {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_port_restarts_are_paced() {
        let mainboard =
            EmulatedMainboard::new(&MainboardConfig::default(), &BusConfig::default()).unwrap();
        let iface = DboardIface::new(Arc::new(mainboard));
        let reads = Arc::new(AtomicUsize::new(0));
        let port = UnpluggedPort {
            reads: reads.clone(),
        };

        let running = CancellationToken::new();
        let task = tokio::spawn(serve_port(port, iface, running.clone()));

        time::sleep(RESTART_DELAY * 3 + RESTART_DELAY / 2).await;
        assert_eq!(reads.load(Ordering::SeqCst), 4);

        running.cancel();
        task.await.unwrap();
    }
}
