//! UDP broadcast discovery.
//!
//! Two async tasks:
//!
//! 1. **Beacon broadcaster** — periodically sends our 22-byte beacon so that
//!    other nodes on the same LAN segment can find us. On shutdown it sends
//!    one beacon with port 0 ("going away") and dwells briefly so the
//!    datagram leaves before the socket dies.
//!
//! 2. **Beacon listener** — receives beacons from other nodes, drops
//!    malformed datagrams and our own echoes, and forwards the rest to the
//!    node runtime. The listener never touches node state.
//!
//! Both tasks respect a [`CancellationToken`] for clean shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::node::NetInput;
use crate::protocol::{Beacon, DISCOVERY_PORT};

/// A beacon accepted by the listener. `port == 0` means the sender is
/// going away.
#[derive(Debug, Clone, Copy)]
pub struct BeaconEvent {
    pub uuid: Uuid,
    pub addr: IpAddr,
    pub port: u16,
}

// ────────────────────────────────────────────────────────────────────────────
// Beacon broadcaster
// ────────────────────────────────────────────────────────────────────────────

/// Periodically broadcast our presence beacon.
///
/// The socket binds to `0.0.0.0:0` (ephemeral) with `SO_BROADCAST` enabled
/// and sends to `255.255.255.255:5670`, so it never conflicts with the
/// listener bound to the discovery port itself.
pub async fn run_beacon_broadcaster(
    uuid: Uuid,
    inbox_port: u16,
    beacon_interval: Duration,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("beacon broadcaster bind failed: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("beacon broadcaster set_broadcast failed: {}", e);
        return;
    }

    let broadcast_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    let beacon = Beacon {
        uuid,
        port: inbox_port,
    }
    .encode();

    debug!(
        "beacon broadcaster started (inbox_port={}, interval={:?})",
        inbox_port, beacon_interval
    );

    let mut tick = interval(beacon_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = socket.send_to(&beacon, broadcast_addr).await {
                    warn!("beacon send failed: {}", e);
                }
            }
        }
    }

    // Farewell: port 0 tells every listener we are going away. The dwell
    // lets the datagram out before the socket is dropped.
    let farewell = Beacon { uuid, port: 0 }.encode();
    let _ = socket.send_to(&farewell, broadcast_addr).await;
    sleep(Duration::from_millis(1)).await;

    debug!("beacon broadcaster stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Beacon listener
// ────────────────────────────────────────────────────────────────────────────

/// Receive beacons and forward them to the runtime.
///
/// The caller pre-binds `socket` (via [`bind_reusable_udp`]) so that bind
/// failures surface before any task is spawned. Datagrams that fail the
/// magic/length/version check and beacons carrying our own UUID are dropped.
pub async fn run_beacon_listener(
    own_uuid: Uuid,
    socket: UdpSocket,
    net_tx: mpsc::Sender<NetInput>,
    cancel: CancellationToken,
) {
    debug!("beacon listener started");
    let mut buf = [0u8; 64];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("beacon recv error: {}", e);
                        continue;
                    }
                };
                let Some(beacon) = Beacon::decode(&buf[..len]) else {
                    trace!("dropping malformed beacon from {}", src);
                    continue;
                };
                if beacon.uuid == own_uuid {
                    continue;
                }
                let event = BeaconEvent {
                    uuid: beacon.uuid,
                    addr: src.ip(),
                    port: beacon.port,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = net_tx.send(NetInput::Beacon(event)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("beacon listener stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Socket helper
// ────────────────────────────────────────────────────────────────────────────

/// Bind a UDP socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// available) using `socket2`, so several nodes on the same machine can
/// share the discovery port.
pub async fn bind_reusable_udp(port: u16) -> std::io::Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("SO_REUSEADDR failed (non-fatal): {}", e);
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Err(e) = socket.set_reuse_port(true) {
            warn!("SO_REUSEPORT failed (non-fatal): {}", e);
        }
    }

    // Non-blocking must be set *before* converting to a tokio socket.
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reusable_bind_allows_two_sockets_on_one_port() {
        let first = bind_reusable_udp(0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        // A second bind on the same port must not fail on a platform with
        // SO_REUSEPORT; on Windows SO_REUSEADDR alone is enough for UDP.
        let second = bind_reusable_udp(port).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn listener_forwards_foreign_beacons_only() {
        let socket = bind_reusable_udp(0).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let own_uuid = Uuid::new_v4();
        let other_uuid = Uuid::new_v4();

        let (net_tx, mut net_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_beacon_listener(own_uuid, socket, net_tx, cancel.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", port);
        // Own echo: must be swallowed.
        sender
            .send_to(&Beacon { uuid: own_uuid, port: 1 }.encode(), &target)
            .await
            .unwrap();
        // Garbage: must be swallowed.
        sender.send_to(b"not a beacon", &target).await.unwrap();
        // Foreign beacon: must come through.
        sender
            .send_to(&Beacon { uuid: other_uuid, port: 42 }.encode(), &target)
            .await
            .unwrap();

        let input = tokio::time::timeout(Duration::from_secs(5), net_rx.recv())
            .await
            .expect("timed out")
            .expect("listener closed");
        match input {
            NetInput::Beacon(ev) => {
                assert_eq!(ev.uuid, other_uuid);
                assert_eq!(ev.port, 42);
            }
            other => panic!("unexpected input: {:?}", other),
        }

        cancel.cancel();
        let _ = handle.await;
    }
}
