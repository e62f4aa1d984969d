use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::{Error, ErrorCode, Result, DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_BUFFER_LEN};
use super::receiver::{Datagram, DatagramHandler};
use super::socket;
use super::worker::Worker;

/// State shared with the background send task
struct SenderInner {
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
    status: ErrorCode,
    responses: Mutex<Option<Arc<dyn DatagramHandler>>>,
}

impl SenderInner {
    fn endpoint(&self) -> Result<(&UdpSocket, SocketAddr)> {
        match (&self.socket, self.target) {
            (Some(socket), Some(target)) => Ok((socket, target)),
            _ => Err(Error::Channel(self.status)),
        }
    }

    async fn transmit(&self, payload: &[u8]) -> Result<usize> {
        let (socket, target) = self.endpoint()?;
        let sent = socket.send_to(payload, target).await?;
        trace!("sent {} bytes to {}", sent, target);
        Ok(sent)
    }

    fn response_handler(&self) -> Option<Arc<dyn DatagramHandler>> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Send side of a multicast channel
pub struct MulticastSender {
    inner: Arc<SenderInner>,
    worker: Worker,
    interval: Duration,
}

impl MulticastSender {
    /// Opens a sender towards `group:port` using the default outgoing interface
    pub async fn new(group: &str, port: u16) -> Self {
        Self::with_interface(group, port, None).await
    }

    /// Opens a sender towards `group:port`, sending IPv4 multicast out of `interface`.
    ///
    /// Setup failures are stored: the sender is then invalid and every
    /// operation reports the stored error.
    pub async fn with_interface(group: &str, port: u16, interface: Option<&str>) -> Self {
        let opened = socket::bind_sender(group, port, interface).and_then(|(socket, target)| {
            UdpSocket::from_std(socket)
                .map(|socket| (socket, target))
                .map_err(|e| ErrorCode::from_io(&e, ErrorCode::INVALID_SOCKET))
        });

        let (socket, target, status) = match opened {
            Ok((socket, target)) => (Some(socket), Some(target), ErrorCode::NONE),
            Err(code) => {
                warn!("sender to {} port {} unusable: {}", group, port, code);
                (None, None, code)
            }
        };

        MulticastSender {
            inner: Arc::new(SenderInner {
                socket,
                target,
                status,
                responses: Mutex::new(None),
            }),
            worker: Worker::new("multicast sender"),
            interval: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.status.is_ok()
    }

    /// Status stored at construction
    pub fn error(&self) -> ErrorCode {
        self.inner.status
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.inner.target
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sets the wait between background transmissions
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Hands unicast replies arriving on this sender's socket to `handler`
    /// while the background loop runs
    pub fn set_response_handler<H: DatagramHandler>(&self, handler: H) {
        *self
            .inner
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Fills and transmits exactly once; returns the bytes sent (0 when `source`
    /// produced nothing)
    pub async fn send<F>(&self, source: F) -> Result<usize>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        self.inner.endpoint()?;

        let mut buffer = BytesMut::new();
        source(&mut buffer)?;
        if buffer.is_empty() {
            return Ok(0);
        }
        self.inner.transmit(&buffer).await
    }

    /// Runs fill, transmit, wait on a background task until [`stop`](Self::stop).
    ///
    /// `source` is called once per tick. Leaving the buffer empty skips that
    /// tick's transmission; an error aborts only that transmission.
    pub fn spawn_send<F>(&self, source: F) -> Result<()>
    where
        F: FnMut(&mut BytesMut) -> Result<()> + Send + 'static,
    {
        if !self.is_valid() {
            return Err(Error::Channel(self.inner.status));
        }

        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        if !self
            .worker
            .spawn(move |cancel| send_loop(inner, source, interval, cancel))
        {
            return Err(Error::invalid_state("send loop already running"));
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Requests the send loop to exit after its current tick
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Waits for the send loop to exit
    pub async fn join(&self) {
        self.worker.join().await;
    }
}

async fn send_loop<F>(
    inner: Arc<SenderInner>,
    mut source: F,
    interval: Duration,
    cancel: CancellationToken,
) where
    F: FnMut(&mut BytesMut) -> Result<()> + Send + 'static,
{
    let mut buffer = BytesMut::new();
    let mut replies = vec![0u8; DEFAULT_BUFFER_LEN];

    while !cancel.is_cancelled() {
        buffer.clear();
        match source(&mut buffer) {
            Ok(()) if buffer.is_empty() => trace!("nothing to send this tick"),
            Ok(()) => {
                if let Err(e) = inner.transmit(&buffer).await {
                    warn!("transmission failed: {}", e);
                }
            }
            Err(e) => warn!("skipping transmission: {}", e),
        }

        let wait = tokio::time::sleep(interval);
        tokio::pin!(wait);
        loop {
            let Ok((socket, _)) = inner.endpoint() else { return };
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("send loop stopped");
                    return;
                }
                _ = &mut wait => break,
                received = socket.recv_from(&mut replies) => {
                    let Ok((len, from)) = received else { continue };
                    if let Some(handler) = inner.response_handler() {
                        let payload = Bytes::copy_from_slice(&replies[..len]);
                        handler.handle(Datagram { payload, source: from }).await;
                    }
                }
            }
        }
    }
    debug!("send loop stopped");
}
