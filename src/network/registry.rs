use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::core::{Config, ErrorCode, Result};
use crate::protocol::{
    codec, HeartbeatResponse, Message, MessageCodec, RegistryResponse, ServiceAnnouncement,
    WireMessage, MAX_MESSAGE_SIZE,
};
use super::receiver::{Datagram, DatagramHandler, MulticastReceiver};
use super::sender::MulticastSender;

/// Known services plus the keys still waiting to be rebroadcast
#[derive(Debug, Default)]
pub struct Directory {
    services: HashMap<String, ServiceAnnouncement>,
    pending: VecDeque<String>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `announcement` under its key (last write wins) and queues the key
    pub fn record(&mut self, announcement: ServiceAnnouncement) -> String {
        let key = announcement.key();
        self.services.insert(key.clone(), announcement);
        self.pending.push_back(key.clone());
        key
    }

    /// Forgets a service; queued copies of its key become empty ticks
    pub fn remove(&mut self, key: &str) -> Option<ServiceAnnouncement> {
        self.services.remove(key)
    }

    /// Pops the oldest pending key and returns its current entry
    pub fn next_pending(&mut self) -> Option<ServiceAnnouncement> {
        let key = self.pending.pop_front()?;
        self.services.get(&key).cloned()
    }

    pub fn get(&self, key: &str) -> Option<&ServiceAnnouncement> {
        self.services.get(key)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// All entries ordered by key
    pub fn snapshot(&self) -> Vec<ServiceAnnouncement> {
        let mut services: Vec<_> = self.services.values().cloned().collect();
        services.sort_by_key(|s| s.key());
        services
    }
}

/// Packs a directory snapshot into responses of at most `limit` encoded bytes.
/// An empty directory still yields one (empty) response.
fn split_snapshot(services: Vec<ServiceAnnouncement>, limit: usize) -> Vec<RegistryResponse> {
    let empty_len = RegistryResponse::default().length();
    let mut responses = Vec::new();
    let mut current = RegistryResponse::default();
    let mut current_len = empty_len;

    for service in services {
        let len = service.length();
        if !current.services.is_empty() && current_len + len > limit {
            responses.push(std::mem::take(&mut current));
            current_len = empty_len;
        }
        current_len += len;
        current.services.push(service);
    }
    responses.push(current);
    responses
}

/// State touched by the intake task and by rebroadcast sends
struct Intake {
    directory: Mutex<Directory>,
    broadcaster: MulticastSender,
}

impl Intake {
    fn directory(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn process(&self, payload: Bytes) {
        let mut buffer = BytesMut::from(&payload[..]);
        let message = match MessageCodec::new().decode(&mut buffer) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping malformed datagram: {}", e);
                return;
            }
        };

        match message {
            Message::ServiceAnnouncement(announcement) => {
                info!("Received: {}", announcement);
                self.directory().record(announcement);
                if let Err(e) = self.rebroadcast_next().await {
                    warn!("rebroadcast failed: {}", e);
                }
            }
            Message::ServiceSignoff(signoff) => {
                if self.directory().remove(&signoff.key()).is_some() {
                    info!("Signed off: {}", signoff);
                }
            }
            Message::RegistryRequest(_) => {
                let services = self.directory().snapshot();
                for response in split_snapshot(services, MAX_MESSAGE_SIZE) {
                    if let Err(e) = self.broadcaster.send(|dst| codec::encode(&response, dst)).await {
                        warn!("directory snapshot not sent: {}", e);
                    }
                }
            }
            Message::HeartbeatRequest(_) => {
                if let Err(e) = self
                    .broadcaster
                    .send(|dst| codec::encode(&HeartbeatResponse, dst))
                    .await
                {
                    warn!("heartbeat response not sent: {}", e);
                }
            }
            other => trace!("ignoring message type {:#010x}", other.message_type()),
        }
    }

    /// Pops the oldest pending key and encodes its entry; leaves `dst` empty
    /// when nothing is pending. The lock covers the pop only.
    fn fill_next(&self, dst: &mut BytesMut) -> Result<()> {
        let next = self.directory().next_pending();
        match next {
            Some(announcement) => {
                debug!("Rebroadcasting: {}", announcement);
                codec::encode(&announcement, dst)
            }
            None => Ok(()),
        }
    }

    /// One rebroadcast tick: transmits the oldest pending entry, if any
    async fn rebroadcast_next(&self) -> Result<usize> {
        self.broadcaster.send(|dst| self.fill_next(dst)).await
    }
}

/// Receive-loop handler feeding the registry
struct IntakeHandler(Arc<Intake>);

impl DatagramHandler for IntakeHandler {
    fn handle(&self, datagram: Datagram) -> futures::future::BoxFuture<'static, ()> {
        let intake = Arc::clone(&self.0);
        Box::pin(async move { intake.process(datagram.payload).await })
    }
}

/// Registry directory: aggregates announcements and rebroadcasts new entries
pub struct Registry {
    intake: Arc<Intake>,
    listener: MulticastReceiver,
}

impl Registry {
    /// Opens the intake channel (registration port) and the rebroadcast channel
    /// (announce port) described by `config`
    pub async fn new(config: &Config) -> Self {
        let listener = MulticastReceiver::new(
            &config.bind_address,
            &config.multicast_address,
            config.registration_port,
        )
        .await;
        listener.set_buffer_len(config.buffer_len);

        let mut broadcaster = MulticastSender::with_interface(
            &config.multicast_address,
            config.announce_port,
            Some(&config.bind_address),
        )
        .await;
        broadcaster.set_interval(config.announce_interval);

        let registry = Registry {
            intake: Arc::new(Intake {
                directory: Mutex::new(Directory::new()),
                broadcaster,
            }),
            listener,
        };
        if !registry.is_valid() {
            warn!("registry is invalid: {}", registry.error());
        }
        registry
    }

    /// Starts the background intake loop and the periodic rebroadcast loop
    pub fn start(&self) -> Result<()> {
        self.listener
            .spawn_receive(IntakeHandler(Arc::clone(&self.intake)))?;
        let intake = Arc::clone(&self.intake);
        if let Err(e) = self
            .intake
            .broadcaster
            .spawn_send(move |dst| intake.fill_next(dst))
        {
            self.listener.stop();
            return Err(e);
        }
        info!(
            "registry listening on {:?}, rebroadcasting to {:?}",
            self.listener.local_addr(),
            self.intake.broadcaster.target()
        );
        Ok(())
    }

    /// Processes one datagram exactly as the intake loop would
    pub async fn ingest(&self, payload: Bytes) {
        self.intake.process(payload).await;
    }

    /// Runs one rebroadcast tick; returns the bytes sent (0 when nothing was pending)
    pub async fn rebroadcast_next(&self) -> Result<usize> {
        self.intake.rebroadcast_next().await
    }

    /// Address the intake listener is bound to
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_valid(&self) -> bool {
        self.listener.is_valid() && self.intake.broadcaster.is_valid()
    }

    /// Combined status of the intake and rebroadcast channels
    pub fn error(&self) -> ErrorCode {
        self.listener.error() | self.intake.broadcaster.error()
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running() || self.intake.broadcaster.is_running()
    }

    /// Snapshot of every known service ordered by key
    pub fn services(&self) -> Vec<ServiceAnnouncement> {
        self.intake.directory().snapshot()
    }

    pub fn service(&self, key: &str) -> Option<ServiceAnnouncement> {
        self.intake.directory().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.intake.directory().len()
    }

    pub fn is_empty(&self) -> bool {
        self.intake.directory().is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.intake.directory().pending_len()
    }

    /// Requests intake then rebroadcast to stop
    pub fn stop(&self) {
        self.listener.stop();
        self.intake.broadcaster.stop();
    }

    /// Waits for both background tasks to exit
    pub async fn join(&self) {
        self.listener.join().await;
        self.intake.broadcaster.join().await;
    }

    /// Stops both channels and waits for them
    pub async fn shutdown(&self) {
        self.stop();
        self.join().await;
        info!("registry shut down with {} known services", self.len());
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop();
    }
}
