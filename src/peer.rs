//! A remote node as seen from this node: identity, liveness deadlines,
//! message sequences, and the outbound TCP link.
//!
//! The link is an mpsc queue drained by a writer task. The task connects to
//! the peer's inbox, sends our raw 16-byte UUID as the routing identity, then
//! writes queued frames; on connect or write failure it retries with
//! exponential back-off until cancelled, re-sending the identity after every
//! reconnect. Per-peer FIFO is preserved by the single queue.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{write_frame, ZreMsg};

/// A peer that has not been heard from for this long is evasive and gets
/// pinged by the reaper.
pub const PEER_EVASIVE: Duration = Duration::from_secs(5);

/// A peer silent for this long is expired and removed.
pub const PEER_EXPIRED: Duration = Duration::from_secs(30);

/// Outbound frames queued per peer while the link (re)connects.
const LINK_QUEUE: usize = 256;

/// Initial reconnection delay (seconds).
const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;

/// Back-off ceiling for reconnection attempts (seconds).
const MAX_RECONNECT_DELAY_SECS: u64 = 8;

pub struct Peer {
    pub uuid: Uuid,
    pub endpoint: String,
    pub name: String,
    pub headers: HashMap<String, String>,
    pub status: u8,
    /// True once HELLO has been received from this peer.
    pub ready: bool,
    sent_sequence: u16,
    want_sequence: u16,
    evasive_at: Instant,
    expired_at: Instant,
    /// Set when the PING + EVASIVE event for the current episode fired;
    /// cleared by any activity refresh.
    evasive_notified: bool,
    link: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Peer {
    /// Build a peer around an existing link queue.
    pub fn new(uuid: Uuid, endpoint: String, link: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Peer {
            uuid,
            endpoint,
            name: String::new(),
            headers: HashMap::new(),
            status: 0,
            ready: false,
            sent_sequence: 0,
            want_sequence: 0,
            evasive_at: now + PEER_EVASIVE,
            expired_at: now + PEER_EXPIRED,
            evasive_notified: false,
            link,
            cancel,
        }
    }

    /// Create a peer and spawn its link writer connecting to `endpoint`,
    /// identified to the remote router by `our_uuid`.
    pub fn connect(our_uuid: Uuid, uuid: Uuid, endpoint: &str, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let link = spawn_link(our_uuid, endpoint.to_string(), cancel.clone());
        Peer::new(uuid, endpoint.to_string(), link, cancel)
    }

    /// Stamp the next outgoing sequence on `msg`, encode it, and queue it on
    /// the link. A full queue drops the frame with a warning; delivery of
    /// what was queued is TCP's problem.
    pub fn send(&mut self, mut msg: ZreMsg) {
        self.sent_sequence = self.sent_sequence.wrapping_add(1);
        msg.set_seq(self.sent_sequence);
        let frame = msg.encode();
        if let Err(e) = self.link.try_send(frame) {
            warn!(
                "peer {}: dropping outbound {} ({})",
                self.uuid,
                msg.name(),
                e
            );
        }
    }

    /// Initialise the inbound sequence from a HELLO; no loss check.
    pub fn seed_sequence(&mut self, seq: u16) {
        self.want_sequence = seq.wrapping_add(1);
    }

    /// Inbound sequence check. Accepts `seq` only if it is the next expected
    /// value; acceptance advances the window.
    pub fn accepts(&mut self, seq: u16) -> bool {
        if seq == self.want_sequence {
            self.want_sequence = seq.wrapping_add(1);
            true
        } else {
            debug!(
                "peer {}: sequence gap (want {}, got {})",
                self.uuid, self.want_sequence, seq
            );
            false
        }
    }

    /// Push both liveness deadlines out and end any evasive episode.
    /// Called on every inbound activity, beacons included.
    pub fn refresh(&mut self) {
        let now = Instant::now();
        self.evasive_at = now + PEER_EVASIVE;
        self.expired_at = now + PEER_EXPIRED;
        self.evasive_notified = false;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expired_at
    }

    /// True when the peer entered the evasive window and the current episode
    /// has not been announced yet.
    pub fn needs_evasive_ping(&self, now: Instant) -> bool {
        now >= self.evasive_at && !self.evasive_notified
    }

    pub fn mark_evasive(&mut self) {
        self.evasive_notified = true;
    }

    /// Tear down the outbound link. Emits no owner event; the node layer
    /// decides what the owner hears.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub fn force_deadlines(&mut self, evasive_in: Duration, expired_in: Duration) {
        let now = Instant::now();
        self.evasive_at = now + evasive_in;
        self.expired_at = now + expired_in;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Link writer task
// ────────────────────────────────────────────────────────────────────────────

/// Spawn the writer task for one peer link and hand back its queue.
pub fn spawn_link(our_uuid: Uuid, endpoint: String, cancel: CancellationToken) -> mpsc::Sender<Vec<u8>> {
    let (tx, rx) = mpsc::channel(LINK_QUEUE);
    tokio::spawn(run_link(our_uuid, endpoint, rx, cancel));
    tx
}

/// Strip the `tcp://` scheme so the rest is a `host:port` connect address.
fn connect_addr(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

async fn run_link(
    our_uuid: Uuid,
    endpoint: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let addr = connect_addr(&endpoint).to_string();
    let mut delay_secs = INITIAL_RECONNECT_DELAY_SECS;

    while !cancel.is_cancelled() {
        let connect_result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = TcpStream::connect(&addr) => r,
        };

        match connect_result {
            Ok(mut stream) => {
                debug!("link to {} connected", endpoint);
                delay_secs = INITIAL_RECONNECT_DELAY_SECS;

                // Routing identity first, then the queued frames.
                if write_frame(&mut stream, our_uuid.as_bytes()).await.is_err() {
                    debug!("link to {}: identity write failed", endpoint);
                } else {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            frame = rx.recv() => match frame {
                                // Queue closed: the peer was dropped.
                                None => return,
                                Some(frame) => {
                                    if let Err(e) = write_frame(&mut stream, &frame).await {
                                        debug!("link to {}: write failed: {}", endpoint, e);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!("link to {}: connect failed: {}", endpoint, e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(Duration::from_secs(delay_secs)) => {},
        }

        // Exponential back-off with ceiling.
        delay_secs = (delay_secs * 2).min(MAX_RECONNECT_DELAY_SECS);
    }
}
