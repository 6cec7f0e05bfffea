//! LAN service: heartbeat broadcast, device expiry and the single datagram receive loop.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use udpeer_core::protocol::{BROADCAST_ADDR, DEVICE_TIMEOUT, HEARTBEAT_INTERVAL, MAX_DATAGRAM_LEN};
use udpeer_core::{
    integrity, wire, ChunkOutcome, DeviceRegistry, EndStep, Message, PeerUpdate, ReceiverEvent,
    TransferTable,
};

use crate::config::Config;

/// Registry shared by the receive loop, the heartbeat task and the console.
pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

/// The local peer: service socket, device registry and inbox.
pub struct Service {
    name: String,
    port: u16,
    socket: Arc<UdpSocket>,
    registry: SharedRegistry,
    inbox: PathBuf,
}

impl Service {
    /// Bind the service socket on all interfaces with broadcast enabled.
    pub async fn bind(cfg: &Config) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", cfg.port)).await?;
        socket.set_broadcast(true)?;
        info!(name = %cfg.name, addr = %socket.local_addr()?, "service bound");
        Ok(Self {
            name: cfg.name.clone(),
            port: cfg.port,
            socket: Arc::new(socket),
            registry: Arc::new(Mutex::new(DeviceRegistry::new(cfg.name.clone()))),
            inbox: cfg.inbox_dir.clone(),
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Run the heartbeat task and the receive loop until the socket fails.
    pub async fn run(self) -> io::Result<()> {
        if let Err(e) = tokio::fs::create_dir_all(&self.inbox).await {
            warn!(dir = %self.inbox.display(), error = %e, "cannot create inbox directory");
        }
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.socket.clone(),
            self.registry.clone(),
            self.name.clone(),
            SocketAddr::from((BROADCAST_ADDR, self.port)),
        ));
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            TransferTable::new(self.name.clone(), self.inbox.clone()),
        );
        let result = recv_loop(self.socket.clone(), dispatcher).await;
        heartbeat_task.abort();
        result
    }
}

/// Send our heartbeat to `dest` (the broadcast address) and sweep silent devices, once per
/// [`HEARTBEAT_INTERVAL`]. The first tick fires at once.
async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    registry: SharedRegistry,
    name: String,
    dest: SocketAddr,
) -> io::Result<()> {
    let frame = wire::encode(&Message::Heartbeat { name })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&frame, dest).await {
            warn!(error = %e, "heartbeat broadcast failed");
        }
        let removed = registry
            .lock()
            .await
            .sweep_expired(now(), DEVICE_TIMEOUT);
        for device in removed {
            info!(device = %device.name, addr = %device.addr, "device removed after inactivity");
        }
    }
}

/// One receive at a time; each datagram is handled to completion before the next.
async fn recv_loop(socket: Arc<UdpSocket>, mut dispatcher: Dispatcher) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "receive failed");
                continue;
            }
        };
        let Some(reply) = dispatcher.handle(&buf[..n], from, now()).await else {
            continue;
        };
        match wire::encode(&reply) {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, from).await {
                    warn!(to = %from, error = %e, "reply send failed");
                }
            }
            Err(e) => error!(reply = ?reply, error = %e, "cannot encode reply"),
        }
    }
}

/// Current time from the runtime clock, so paused test time reaches the registry.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Routes decoded datagrams: heartbeats to the registry, transfers to the session table.
pub struct Dispatcher {
    registry: SharedRegistry,
    transfers: TransferTable,
}

impl Dispatcher {
    pub fn new(registry: SharedRegistry, transfers: TransferTable) -> Self {
        Self {
            registry,
            transfers,
        }
    }

    /// Handle one datagram from `from`; returns the reply to send back, if any.
    pub async fn handle(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Option<Message> {
        let msg = match wire::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(from = %from, error = %e, "dropping malformed datagram");
                return None;
            }
        };
        match msg {
            Message::Heartbeat { name } => {
                let update = self.registry.lock().await.upsert(&name, from, now);
                if update == PeerUpdate::New {
                    info!(device = %name, addr = %from, "new device discovered");
                }
                None
            }
            Message::Talk { id, text } => {
                info!(from = %from, "TALK: {}", text);
                Some(Message::ack(id))
            }
            Message::File {
                id,
                file_name,
                size,
            } => {
                info!(from = %from, id = %id, file = %file_name, size, "FILE offered");
                let handled = self.transfers.on_file(&id, &file_name, size);
                log_event(&id, handled.event);
                handled.reply
            }
            Message::Chunk { id, seq, data } => {
                let handled = self.transfers.on_chunk(&id, seq, &data);
                log_event(&id, handled.event);
                handled.reply
            }
            Message::End { id, fingerprint } => {
                let handled = match self.transfers.prepare_end(&id) {
                    EndStep::Done(handled) => handled,
                    EndStep::Verify(path) => {
                        let local = hash_off_thread(path).await;
                        self.transfers.conclude_end(&id, &fingerprint, local)
                    }
                };
                log_event(&id, handled.event);
                handled.reply
            }
            Message::Ack { id } | Message::Nack { id, .. } => {
                debug!(from = %from, id = %id, "stray acknowledgment ignored");
                None
            }
        }
    }
}

async fn hash_off_thread(path: PathBuf) -> io::Result<String> {
    tokio::task::spawn_blocking(move || integrity::fingerprint_file(&path))
        .await
        .map_err(io::Error::other)?
}

fn log_event(id: &str, event: ReceiverEvent) {
    match event {
        ReceiverEvent::Opened { path, size } => {
            info!(id, path = %path.display(), size, "receiving file")
        }
        ReceiverEvent::Reoffered => debug!(id, "FILE repeated, keeping session"),
        ReceiverEvent::Refused { reason } => warn!(id, %reason, "FILE refused"),
        ReceiverEvent::Chunk { seq, outcome } => match outcome {
            ChunkOutcome::Written => debug!(id, seq, "chunk saved"),
            ChunkOutcome::Duplicate => debug!(id, seq, "chunk already received"),
            ChunkOutcome::OutOfOrder { expected } => {
                warn!(id, seq, expected, "chunk out of order, not written")
            }
            ChunkOutcome::Sealed => debug!(id, seq, "chunk after END, not written"),
        },
        ReceiverEvent::UnknownTransfer => debug!(id, "no session for transfer"),
        ReceiverEvent::Discarded => debug!(id, "transfer discarded earlier, ignoring"),
        ReceiverEvent::Validated {
            path,
            declared,
            written,
        } => {
            if declared == written {
                info!(id, path = %path.display(), size = written, "file verified")
            } else {
                warn!(id, path = %path.display(), declared, written, "file verified, size differs from offer")
            }
        }
        ReceiverEvent::AlreadyValidated => debug!(id, "END repeated, already verified"),
        ReceiverEvent::Mismatch { local, claimed } => {
            error!(id, %local, %claimed, "fingerprint mismatch, transfer discarded")
        }
        ReceiverEvent::Failed(e) => error!(id, error = %e, "transfer I/O error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use udpeer_core::integrity::fingerprint;

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], 5000))
    }

    fn dispatcher(dir: &tempfile::TempDir) -> (Dispatcher, SharedRegistry) {
        let registry = Arc::new(Mutex::new(DeviceRegistry::new("me")));
        let d = Dispatcher::new(registry.clone(), TransferTable::new("me", dir.path()));
        (d, registry)
    }

    async fn send(d: &mut Dispatcher, msg: &Message) -> Option<Message> {
        d.handle(&wire::encode(msg).unwrap(), peer(), Instant::now()).await
    }

    #[tokio::test]
    async fn heartbeat_registers_peer_but_not_self() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, registry) = dispatcher(&dir);
        let reply = send(&mut d, &Message::Heartbeat { name: "alice".into() }).await;
        assert!(reply.is_none());
        send(&mut d, &Message::Heartbeat { name: "me".into() }).await;
        let devices = registry.lock().await.snapshot();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "alice");
        assert_eq!(devices[0].addr, peer());
    }

    #[tokio::test]
    async fn silent_device_swept_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, registry) = dispatcher(&dir);
        let t0 = Instant::now();
        let hb = wire::encode(&Message::Heartbeat { name: "alice".into() }).unwrap();
        d.handle(&hb, peer(), t0).await;
        let later = t0 + DEVICE_TIMEOUT + Duration::from_millis(1);
        let removed = registry.lock().await.sweep_expired(later, DEVICE_TIMEOUT);
        assert_eq!(removed.len(), 1);
        assert!(registry.lock().await.is_empty());
    }

    async fn expect_heartbeat(listener: &UdpSocket) {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HEARTBEAT me");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_tick_announces_and_expires_silent_devices() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let registry = Arc::new(Mutex::new(DeviceRegistry::new("me")));
        let t0 = now();
        registry.lock().await.upsert("stale", peer(), t0);
        registry
            .lock()
            .await
            .upsert("fresh", SocketAddr::from(([192, 168, 1, 21], 5000)), t0);
        let task = tokio::spawn(heartbeat_loop(
            socket,
            registry.clone(),
            "me".into(),
            listener.local_addr().unwrap(),
        ));

        expect_heartbeat(&listener).await; // t = 0
        expect_heartbeat(&listener).await; // t = 5
        tokio::time::sleep(Duration::from_secs(3)).await;
        registry
            .lock()
            .await
            .upsert("fresh", SocketAddr::from(([192, 168, 1, 21], 5000)), now());

        expect_heartbeat(&listener).await; // t = 10: "stale" silent for exactly the threshold, kept
        tokio::task::yield_now().await;
        assert_eq!(registry.lock().await.len(), 2);

        expect_heartbeat(&listener).await; // t = 15
        tokio::task::yield_now().await;
        let names: Vec<String> = registry
            .lock()
            .await
            .snapshot()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["fresh".to_string()]);
        task.abort();
    }

    #[tokio::test]
    async fn malformed_datagram_gets_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, _) = dispatcher(&dir);
        assert!(d.handle(b"BOGUS 1 2", peer(), Instant::now()).await.is_none());
        assert!(d.handle(b"TALK", peer(), Instant::now()).await.is_none());
    }

    #[tokio::test]
    async fn talk_is_acked() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, _) = dispatcher(&dir);
        let reply = send(
            &mut d,
            &Message::Talk {
                id: "5".into(),
                text: "hello there".into(),
            },
        )
        .await;
        assert_eq!(reply, Some(Message::ack("5")));
    }

    #[tokio::test]
    async fn stray_acks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, _) = dispatcher(&dir);
        assert!(send(&mut d, &Message::ack("1")).await.is_none());
        assert!(send(&mut d, &Message::nack("1", "no")).await.is_none());
    }

    #[tokio::test]
    async fn file_transfer_through_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, _) = dispatcher(&dir);
        let file = Message::File {
            id: "9".into(),
            file_name: "doc.txt".into(),
            size: 11,
        };
        assert_eq!(send(&mut d, &file).await, Some(Message::ack("9")));
        for (seq, part) in [&b"hello "[..], &b"world"[..]].iter().enumerate() {
            let chunk = Message::Chunk {
                id: "9".into(),
                seq: seq as u32,
                data: part.to_vec(),
            };
            assert_eq!(send(&mut d, &chunk).await, Some(Message::ack("9")));
        }
        let end = Message::End {
            id: "9".into(),
            fingerprint: fingerprint(b"hello world"),
        };
        assert_eq!(send(&mut d, &end).await, Some(Message::ack("9")));
        assert_eq!(
            std::fs::read(dir.path().join("received_me_doc.txt")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn heartbeat_reaches_registry_over_udp() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            name: "me".into(),
            port: 0,
            outbox_dir: dir.path().into(),
            inbox_dir: dir.path().into(),
        };
        let service = Service::bind(&cfg).await.unwrap();
        let port = service.socket.local_addr().unwrap().port();
        let registry = service.registry();
        let task = tokio::spawn(service.run());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"HEARTBEAT alice", ("127.0.0.1", port))
            .await
            .unwrap();

        let mut found = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            found = registry.lock().await.get("alice");
            if found.is_some() {
                break;
            }
        }
        task.abort();
        let device = found.expect("heartbeat not registered");
        assert_eq!(device.addr, sender.local_addr().unwrap());
    }
}
