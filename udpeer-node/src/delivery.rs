//! Reliable delivery: send a datagram and wait for the matching ACK, with bounded retries.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};
use udpeer_core::protocol::{ACK_TIMEOUT, MAX_DATAGRAM_LEN};
use udpeer_core::{wire, Message, RetryPolicy};

/// One request/response channel to a single peer.
#[allow(async_fn_in_trait)]
pub trait Link {
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout.
    async fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Private ephemeral socket talking to one peer; one per TALK or file transfer.
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    pub async fn open(peer: SocketAddr) -> io::Result<Self> {
        let local = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, peer })
    }
}

impl Link for UdpLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.peer).await.map(|_| ())
    }

    async fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no ACK after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("rejected by peer: {reason}")]
    Rejected { reason: String },
}

/// Upper bound on leftover datagrams discarded before an exchange starts.
const MAX_STALE: usize = 64;

/// Send `datagram` until an ACK carrying `expected_id` comes back or the budget runs out.
///
/// Replies already waiting on the link belong to an earlier exchange (chunk ACKs all carry
/// the transfer id) and are discarded first. Each attempt waits [`ACK_TIMEOUT`] for a single
/// reply. A reply that is not the expected ACK ends that attempt early; a NACK for
/// `expected_id` ends the exchange.
pub async fn deliver<L: Link>(
    link: &L,
    datagram: &[u8],
    expected_id: &str,
    policy: RetryPolicy,
) -> Result<Delivered, DeliveryError> {
    drain_stale(link, expected_id).await;
    for attempt in policy.attempts() {
        if !attempt.delay_before.is_zero() {
            tokio::time::sleep(attempt.delay_before).await;
        }
        if let Err(e) = link.send(datagram).await {
            warn!(id = expected_id, attempt = attempt.number, error = %e, "send failed");
            continue;
        }
        debug!(id = expected_id, attempt = attempt.number, "sent, waiting for ACK");

        let reply = match link.recv(ACK_TIMEOUT).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(id = expected_id, attempt = attempt.number, "timed out waiting for ACK");
                continue;
            }
            Err(e) => {
                warn!(id = expected_id, attempt = attempt.number, error = %e, "receive failed");
                continue;
            }
        };
        match wire::decode(&reply) {
            Ok(Message::Ack { id }) if id == expected_id => {
                return Ok(Delivered {
                    attempts: attempt.number,
                });
            }
            Ok(Message::Nack { id, reason }) if id == expected_id => {
                warn!(id = expected_id, %reason, "NACK received");
                return Err(DeliveryError::Rejected { reason });
            }
            Ok(other) => debug!(id = expected_id, reply = ?other, "ignoring unexpected reply"),
            Err(e) => debug!(id = expected_id, error = %e, "ignoring malformed reply"),
        }
    }
    Err(DeliveryError::Exhausted {
        attempts: policy.max_attempts,
    })
}

async fn drain_stale<L: Link>(link: &L, expected_id: &str) {
    for _ in 0..MAX_STALE {
        match link.recv(Duration::ZERO).await {
            Ok(Some(stale)) => {
                debug!(id = expected_id, len = stale.len(), "discarding stale reply")
            }
            Ok(None) | Err(_) => break,
        }
    }
}
