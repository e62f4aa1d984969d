use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::{Error, ErrorCode, Result, DEFAULT_BUFFER_LEN};
use super::socket;
use super::worker::Worker;

/// One received datagram and where it came from
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Bytes,
    pub source: SocketAddr,
}

/// Handles datagrams delivered by a receive loop
pub trait DatagramHandler: Send + Sync + 'static {
    fn handle(&self, datagram: Datagram) -> BoxFuture<'static, ()>;
}

impl<F, Fut> DatagramHandler for F
where
    F: Fn(Datagram) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, datagram: Datagram) -> BoxFuture<'static, ()> {
        Box::pin(self(datagram))
    }
}

/// State shared with the background receive task
pub(crate) struct ReceiverInner {
    socket: Option<UdpSocket>,
    status: ErrorCode,
    buffer_len: AtomicUsize,
}

impl ReceiverInner {
    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(Error::Channel(self.status))
    }

    async fn next_datagram(&self, buffer: &mut Vec<u8>) -> Result<Datagram> {
        let socket = self.socket()?;
        buffer.resize(self.buffer_len.load(Ordering::Relaxed), 0);
        let (len, source) = socket.recv_from(buffer).await?;
        trace!("received {} bytes from {}", len, source);
        Ok(Datagram {
            payload: Bytes::copy_from_slice(&buffer[..len]),
            source,
        })
    }

    pub(crate) async fn reply_to(&self, target: SocketAddr, payload: &[u8]) -> Result<usize> {
        Ok(self.socket()?.send_to(payload, target).await?)
    }
}

/// Receive side of a multicast channel
pub struct MulticastReceiver {
    inner: Arc<ReceiverInner>,
    worker: Worker,
}

impl MulticastReceiver {
    /// Binds `bind:port` and joins `group`.
    ///
    /// Setup failures are stored: the receiver is then invalid and every
    /// operation reports the stored error.
    pub async fn new(bind: &str, group: &str, port: u16) -> Self {
        let (socket, status) = match socket::bind_receiver(bind, group, port)
            .and_then(|s| UdpSocket::from_std(s).map_err(|e| ErrorCode::from_io(&e, ErrorCode::INVALID_SOCKET)))
        {
            Ok(socket) => (Some(socket), ErrorCode::NONE),
            Err(code) => {
                warn!("receiver {} / {} port {} unusable: {}", bind, group, port, code);
                (None, code)
            }
        };

        MulticastReceiver {
            inner: Arc::new(ReceiverInner {
                socket,
                status,
                buffer_len: AtomicUsize::new(DEFAULT_BUFFER_LEN),
            }),
            worker: Worker::new("multicast receiver"),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.status.is_ok()
    }

    /// Status stored at construction
    pub fn error(&self) -> ErrorCode {
        self.inner.status
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn buffer_len(&self) -> usize {
        self.inner.buffer_len.load(Ordering::Relaxed)
    }

    /// Sets the receive buffer length; never below the 1024 byte floor
    pub fn set_buffer_len(&self, len: usize) {
        self.inner
            .buffer_len
            .store(len.max(DEFAULT_BUFFER_LEN), Ordering::Relaxed);
    }

    /// Waits for exactly one datagram and hands it to `handler`
    pub async fn receive<H: DatagramHandler>(&self, handler: &H) -> Result<()> {
        let mut buffer = Vec::new();
        let datagram = self.inner.next_datagram(&mut buffer).await?;
        handler.handle(datagram).await;
        Ok(())
    }

    /// Runs the receive loop on a background task until [`stop`](Self::stop)
    pub fn spawn_receive<H: DatagramHandler>(&self, handler: H) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Channel(self.inner.status));
        }

        let inner = Arc::clone(&self.inner);
        if !self.worker.spawn(move |cancel| receive_loop(inner, handler, cancel)) {
            return Err(Error::invalid_state("receive loop already running"));
        }
        Ok(())
    }

    /// Answers a datagram unicast from this receiver's socket
    pub async fn reply_to(&self, target: SocketAddr, payload: &[u8]) -> Result<usize> {
        self.inner.reply_to(target, payload).await
    }

    pub(crate) fn shared(&self) -> Arc<ReceiverInner> {
        Arc::clone(&self.inner)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Requests the receive loop to exit after its current datagram
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Waits for the receive loop to exit
    pub async fn join(&self) {
        self.worker.join().await;
    }
}

async fn receive_loop<H: DatagramHandler>(
    inner: Arc<ReceiverInner>,
    handler: H,
    cancel: CancellationToken,
) {
    let mut buffer = Vec::new();
    while !cancel.is_cancelled() {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = inner.next_datagram(&mut buffer) => received,
        };

        match received {
            // A datagram in hand is always handled before the stop request is seen
            Ok(datagram) => handler.handle(datagram).await,
            Err(e) => debug!("receive failed: {}", e),
        }
    }
    debug!("receive loop stopped");
}
