use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::core::{Config, Error, ErrorCode, Protocol, Result, ServiceConfig};
use crate::protocol::{
    codec, HeartbeatRequest, Message, MessageCodec, RegistryRequest, ServiceAnnouncement,
    ServiceSignoff, MAX_MESSAGE_SIZE,
};
use super::receiver::{Datagram, DatagramHandler, MulticastReceiver};
use super::sender::MulticastSender;

/// Called with every announcement heard on the announce channel
pub type AnnouncementCallback = Arc<dyn Fn(&ServiceAnnouncement) + Send + Sync>;

/// Lifecycle of an [`Announcer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncerState {
    /// Constructed or stopped; nothing is sent or received
    Idle,
    /// Announcing itself and listening for others
    Active,
}

/// State shared with the announcer's receive task
#[derive(Default)]
struct SharedState {
    callback: Mutex<Option<AnnouncementCallback>>,
    known: Mutex<HashMap<String, ServiceAnnouncement>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedState {
    fn observe(&self, announcement: ServiceAnnouncement) {
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(&announcement);
        }
        lock(&self.known).insert(announcement.key(), announcement);
    }

    fn process(&self, payload: Bytes) {
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
                debug!("Heard: {}", announcement);
                self.observe(announcement);
            }
            Message::RegistryResponse(response) => {
                debug!("directory snapshot with {} services", response.services.len());
                for announcement in response.services {
                    self.observe(announcement);
                }
            }
            Message::ServiceSignoff(signoff) => {
                lock(&self.known).remove(&signoff.key());
            }
            Message::HeartbeatResponse(_) => {
                *lock(&self.last_heartbeat) = Some(Instant::now());
            }
            other => trace!("ignoring message type {:#010x}", other.message_type()),
        }
    }
}

struct AnnouncementHandler(Arc<SharedState>);

impl DatagramHandler for AnnouncementHandler {
    fn handle(&self, datagram: Datagram) -> futures::future::BoxFuture<'static, ()> {
        let shared = Arc::clone(&self.0);
        Box::pin(async move { shared.process(datagram.payload) })
    }
}

/// Announces one service to the registry and tracks what the registry rebroadcasts
pub struct Announcer {
    identity: ServiceAnnouncement,
    /// Towards the registry's registration port
    sender: MulticastSender,
    /// On the announce port
    receiver: MulticastReceiver,
    shared: Arc<SharedState>,
    state: Mutex<AnnouncerState>,
}

impl Announcer {
    /// Opens both channels described by `config` for the service `service`.
    ///
    /// Setup failures leave the announcer invalid; check [`is_valid`](Self::is_valid).
    pub async fn new(config: &Config, service: &ServiceConfig) -> Self {
        let mut sender = MulticastSender::with_interface(
            &config.multicast_address,
            config.registration_port,
            Some(&config.bind_address),
        )
        .await;
        sender.set_interval(config.announce_interval);

        let receiver = MulticastReceiver::new(
            &config.bind_address,
            &config.multicast_address,
            config.announce_port,
        )
        .await;
        // Directory snapshots can fill a whole datagram
        receiver.set_buffer_len(config.buffer_len.max(MAX_MESSAGE_SIZE));

        let announcer = Announcer {
            identity: ServiceAnnouncement::from(service),
            sender,
            receiver,
            shared: Arc::new(SharedState::default()),
            state: Mutex::new(AnnouncerState::Idle),
        };
        if !announcer.is_valid() {
            warn!("announcer '{}' is invalid: {}", service.name, announcer.error());
        }
        announcer
    }

    /// Starts announcing and listening; a no-op while already active
    pub fn start(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Channel(self.error()));
        }

        let mut state = lock(&self.state);
        if *state == AnnouncerState::Active {
            return Ok(());
        }

        self.receiver
            .spawn_receive(AnnouncementHandler(Arc::clone(&self.shared)))?;
        let identity = self.identity.clone();
        if let Err(e) = self
            .sender
            .spawn_send(move |dst| codec::encode(&identity, dst))
        {
            self.receiver.stop();
            return Err(e);
        }

        *state = AnnouncerState::Active;
        info!("announcing {}", self.identity);
        Ok(())
    }

    /// Requests both background tasks to exit; idempotent
    pub fn stop(&self) {
        self.sender.stop();
        self.receiver.stop();
        *lock(&self.state) = AnnouncerState::Idle;
    }

    /// Waits for both background tasks to exit
    pub async fn join(&self) {
        self.sender.join().await;
        self.receiver.join().await;
    }

    pub async fn shutdown(&self) {
        self.stop();
        self.join().await;
    }

    pub fn state(&self) -> AnnouncerState {
        *lock(&self.state)
    }

    /// Registers the callback invoked for every announcement heard
    pub fn set_announcement_callback<F>(&self, callback: F)
    where
        F: Fn(&ServiceAnnouncement) + Send + Sync + 'static,
    {
        *lock(&self.shared.callback) = Some(Arc::new(callback));
    }

    pub fn identity(&self) -> &ServiceAnnouncement {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn brief(&self) -> &str {
        &self.identity.brief
    }

    pub fn port(&self) -> u16 {
        self.identity.port
    }

    pub fn protocol(&self) -> Protocol {
        self.identity.protocol
    }

    pub fn is_valid(&self) -> bool {
        self.sender.is_valid() && self.receiver.is_valid()
    }

    /// Combined status of both channels
    pub fn error(&self) -> ErrorCode {
        self.sender.error() | self.receiver.error()
    }

    /// Address the announce listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }

    /// Every service heard so far, ordered by key
    pub fn known_services(&self) -> Vec<ServiceAnnouncement> {
        let mut services: Vec<_> = lock(&self.shared.known).values().cloned().collect();
        services.sort_by_key(|s| s.key());
        services
    }

    /// Instant the last heartbeat response from a registry arrived
    pub fn last_registry_heartbeat(&self) -> Option<Instant> {
        *lock(&self.shared.last_heartbeat)
    }

    /// Tells the registry this service is leaving
    pub async fn sign_off(&self) -> Result<usize> {
        let signoff = ServiceSignoff::from(&self.identity);
        info!("signing off {}", self.identity);
        self.sender.send(|dst| codec::encode(&signoff, dst)).await
    }

    /// Asks the registry to broadcast its whole directory
    pub async fn request_directory(&self) -> Result<usize> {
        self.sender.send(|dst| codec::encode(&RegistryRequest, dst)).await
    }

    /// Asks the registry for a heartbeat response
    pub async fn probe_registry(&self) -> Result<usize> {
        self.sender.send(|dst| codec::encode(&HeartbeatRequest, dst)).await
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::Registry;
    use crate::protocol::{deserialize, serialize, HeartbeatResponse, RegistryResponse};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout, Duration};

    fn service(name: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            brief: "demo".to_string(),
            protocol: Protocol::PubSub,
        }
    }

    fn loopback_config(registration_port: u16, announce_port: u16) -> Config {
        Config {
            bind_address: "127.0.0.1".to_string(),
            multicast_address: "127.0.0.1".to_string(),
            registration_port,
            announce_port,
            announce_interval: Duration::from_millis(100),
            ..Config::default()
        }
    }

    /// A socket standing in for the registry's intake
    fn registry_peer() -> std::net::UdpSocket {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        socket
    }

    #[tokio::test]
    async fn test_invalid_announcer() {
        let config = Config {
            multicast_address: "nonsense".to_string(),
            ..Config::default()
        };
        let announcer = Announcer::new(&config, &service("svc-x", 1)).await;
        assert!(!announcer.is_valid());

        let err = announcer.start().unwrap_err();
        assert!(err.code().contains(ErrorCode::ADDRESS_PARSE));
        assert_eq!(announcer.state(), AnnouncerState::Idle);
    }

    #[tokio::test]
    async fn test_accessors() {
        let config = loopback_config(9, 0);
        let announcer = Announcer::new(&config, &service("svc-a", 9000)).await;
        assert!(announcer.is_valid());
        assert_eq!(announcer.name(), "svc-a");
        assert_eq!(announcer.address(), "127.0.0.1");
        assert_eq!(announcer.brief(), "demo");
        assert_eq!(announcer.port(), 9000);
        assert_eq!(announcer.protocol(), Protocol::PubSub);
        assert!(announcer.known_services().is_empty());
        assert!(announcer.last_registry_heartbeat().is_none());
    }

    #[tokio::test]
    async fn test_periodic_announcement() {
        let peer = registry_peer();
        let config = loopback_config(peer.local_addr().unwrap().port(), 0);
        let announcer = Announcer::new(&config, &service("svc-a", 9000)).await;

        announcer.start().unwrap();
        announcer.start().unwrap();
        assert_eq!(announcer.state(), AnnouncerState::Active);

        let expected = announcer.identity().clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 1024];
            for _ in 0..2 {
                let (len, _) = peer.recv_from(&mut buf).unwrap();
                let heard: ServiceAnnouncement = deserialize(&buf[..len]).unwrap();
                assert_eq!(heard, expected);
            }
        })
        .await
        .unwrap();

        announcer.stop();
        announcer.stop();
        timeout(Duration::from_secs(2), announcer.join()).await.unwrap();
        assert_eq!(announcer.state(), AnnouncerState::Idle);
    }

    #[tokio::test]
    async fn test_join_when_idle() {
        let announcer = Announcer::new(&loopback_config(9, 0), &service("svc-a", 1)).await;
        timeout(Duration::from_millis(200), announcer.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let peer = registry_peer();
        let config = loopback_config(peer.local_addr().unwrap().port(), 0);
        let announcer = Announcer::new(&config, &service("svc-a", 9000)).await;

        announcer.start().unwrap();
        announcer.stop();
        assert_eq!(announcer.state(), AnnouncerState::Idle);

        announcer.start().unwrap();
        assert_eq!(announcer.state(), AnnouncerState::Active);

        let expected = announcer.identity().clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 1024];
            let (len, _) = peer.recv_from(&mut buf).unwrap();
            let heard: ServiceAnnouncement = deserialize(&buf[..len]).unwrap();
            assert_eq!(heard, expected);
        })
        .await
        .unwrap();

        announcer.shutdown().await;
        assert_eq!(announcer.state(), AnnouncerState::Idle);
    }

    #[tokio::test]
    async fn test_large_directory_snapshot() {
        let announcer = Announcer::new(&loopback_config(9, 0), &service("svc-a", 1)).await;
        announcer.start().unwrap();

        let snapshot = RegistryResponse {
            services: (0..30u16)
                .map(|i| ServiceAnnouncement::from(&service("svc-member", 10_000 + i)))
                .collect(),
        };
        let bytes = serialize(&snapshot).unwrap();
        assert!(bytes.len() > 1024);
        registry_peer()
            .send_to(&bytes, announcer.local_addr().unwrap())
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while announcer.known_services().len() < 30 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(announcer.known_services(), snapshot.services);

        announcer.shutdown().await;
    }

    #[tokio::test]
    async fn test_intake_updates_local_view() {
        let announcer = Announcer::new(&loopback_config(9, 0), &service("svc-a", 1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        announcer.set_announcement_callback(move |a: &ServiceAnnouncement| {
            let _ = tx.send(a.clone());
        });
        announcer.start().unwrap();

        let target = announcer.local_addr().unwrap();
        let other = ServiceAnnouncement::from(&service("svc-b", 9100));
        let snapshot = RegistryResponse {
            services: vec![ServiceAnnouncement::from(&service("svc-c", 9200))],
        };
        let peer = registry_peer();
        peer.send_to(b"\x01\x00", target).unwrap();
        peer.send_to(&serialize(&other).unwrap(), target).unwrap();
        peer.send_to(&serialize(&snapshot).unwrap(), target).unwrap();
        peer.send_to(&serialize(&HeartbeatResponse).unwrap(), target).unwrap();

        for expected in ["svc-b", "svc-c"] {
            let heard = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(heard.name, expected);
        }
        timeout(Duration::from_secs(2), async {
            while announcer.last_registry_heartbeat().is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let keys: Vec<String> = announcer.known_services().iter().map(|s| s.key()).collect();
        assert_eq!(keys, vec!["127.0.0.1:9100", "127.0.0.1:9200"]);
        announcer.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_shot_requests() {
        let peer = registry_peer();
        let config = loopback_config(peer.local_addr().unwrap().port(), 0);
        let announcer = Announcer::new(&config, &service("svc-a", 9000)).await;

        assert!(announcer.sign_off().await.unwrap() > 0);
        assert!(announcer.request_directory().await.unwrap() > 0);
        assert!(announcer.probe_registry().await.unwrap() > 0);

        let kinds = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 1024];
            (0..3)
                .map(|_| {
                    let (len, _) = peer.recv_from(&mut buf).unwrap();
                    let mut payload = &buf[..len];
                    Message::decode(&mut payload).unwrap()
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();

        assert_eq!(
            kinds[0],
            Message::ServiceSignoff(ServiceSignoff::from(announcer.identity()))
        );
        assert_eq!(kinds[1], Message::RegistryRequest(RegistryRequest));
        assert_eq!(kinds[2], Message::HeartbeatRequest(HeartbeatRequest));
    }

    /// Registry and announcers wired over loopback unicast endpoints
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_discovery_round_trip() {
        let listener = Announcer::new(&loopback_config(9, 0), &service("svc-listener", 1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.set_announcement_callback(move |a: &ServiceAnnouncement| {
            let _ = tx.send(a.clone());
        });
        listener.start().unwrap();

        let registry_config = loopback_config(0, listener.local_addr().unwrap().port());
        let registry = Registry::new(&registry_config).await;
        registry.start().unwrap();

        let intake = registry.local_addr().unwrap().port();
        let announcer = Announcer::new(&loopback_config(intake, 0), &service("svc-a", 9000)).await;
        announcer.start().unwrap();

        // Three announcement intervals plus scheduling slack
        let within = registry_config.announce_interval * 3 + Duration::from_millis(100);
        let heard = timeout(within, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&heard, announcer.identity());

        let entry = registry.service("127.0.0.1:9000").unwrap();
        assert_eq!(entry.name, "svc-a");
        assert_eq!(entry.port, 9000);
        assert_eq!(entry.protocol, Protocol::PubSub);
        assert_eq!(entry.address, "127.0.0.1");
        assert_eq!(entry.brief, "demo");

        announcer.shutdown().await;
        announcer.sign_off().await.unwrap();
        timeout(Duration::from_secs(2), async {
            while !registry.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        registry.shutdown().await;
        listener.shutdown().await;
    }

    /// Same flow over a real IPv4 group; needs multicast on the loopback interface
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore]
    async fn test_multicast_discovery() {
        let config = Config {
            bind_address: "127.0.0.1".to_string(),
            multicast_address: "239.0.0.1".to_string(),
            announce_interval: Duration::from_millis(200),
            ..Config::default()
        };

        let registry = Registry::new(&config).await;
        assert!(registry.is_valid(), "{}", registry.error());
        registry.start().unwrap();

        let listener = Announcer::new(&config, &service("svc-listener", 1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.set_announcement_callback(move |a: &ServiceAnnouncement| {
            if a.name == "svc-a" {
                let _ = tx.send(a.clone());
            }
        });
        listener.start().unwrap();

        let announcer = Announcer::new(&config, &service("svc-a", 9000)).await;
        announcer.start().unwrap();

        let heard = timeout(Duration::from_millis(600), rx.recv()).await.unwrap().unwrap();
        assert_eq!(&heard, announcer.identity());
        assert_eq!(registry.service("127.0.0.1:9000").as_ref(), Some(announcer.identity()));

        announcer.shutdown().await;
        listener.shutdown().await;
        registry.shutdown().await;
    }
}
