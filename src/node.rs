//! The node runtime — one task owns all state and multiplexes the owner's
//! commands, discovery beacons, inbox traffic, and the liveness reaper.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │                         run_node                               │
//!  │                                                                │
//!  │  commands ──►┐    ┌──────────────┐   ┌─────────────────────┐  │
//!  │              │    │ UDP beacon   │   │  TCP inbox          │  │
//!  │   events ◄──┐│    │ broadcaster  │   │  (router listener)  │  │
//!  │             ││    └──────────────┘   └──────────┬──────────┘  │
//!  │             ││    ┌──────────────┐              │             │
//!  │             ││    │ UDP listener │──────┐       │             │
//!  │             ││    └──────────────┘      ▼       ▼             │
//!  │             ││                       NetInput channel          │
//!  │             ││                           │                     │
//!  │             │└───────────┐              │                     │
//!  │             │     ┌──────▼──────────────▼──────┐              │
//!  │             └─────┤  event loop (owns peers,   │◄── 1 s reaper│
//!  │                   │  groups, name, status)     │              │
//!  │                   └──────────┬─────────────────┘              │
//!  │                              ▼                                 │
//!  │                   per-peer outbound links                      │
//!  └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The owner communicates strictly through the command/event channels; no
//! other thread ever touches the peer table or the group registries.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use local_ip_address::local_ip;
use log::{debug, info, trace, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::discovery::{
    bind_reusable_udp, run_beacon_broadcaster, run_beacon_listener, BeaconEvent,
};
use crate::error::NodeError;
use crate::group::Group;
use crate::inbox::run_inbox;
use crate::peer::Peer;
use crate::protocol::{ZreMsg, DISCOVERY_PORT};

/// Capacity of the owner event channel. The loop never blocks on it:
/// events beyond this backlog are dropped.
const EVENT_QUEUE: usize = 1000;

/// Capacity of the owner command channel.
const COMMAND_QUEUE: usize = 64;

/// Capacity of the internal channel feeding beacons and inbox traffic
/// into the loop.
const NET_QUEUE: usize = 1024;

// ────────────────────────────────────────────────────────────────────────────
// Owner-facing types
// ────────────────────────────────────────────────────────────────────────────

/// Events the node emits to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer completed HELLO and is now ready.
    Enter {
        uuid: Uuid,
        name: String,
        headers: HashMap<String, String>,
        endpoint: String,
    },
    /// The node stopped (after a STOP command).
    Stop,
    /// A ready peer was removed (expiry, sequence gap, goodbye beacon,
    /// connection loss, or stale-record replacement).
    Exit { uuid: Uuid, name: String },
    /// A peer has been silent for 5 s; a PING was sent. Fires once per
    /// silent episode.
    Evasive { uuid: Uuid, name: String },
    /// A peer joined a group.
    Join {
        uuid: Uuid,
        name: String,
        group: String,
    },
    /// A peer left a group.
    Leave {
        uuid: Uuid,
        name: String,
        group: String,
    },
    /// A peer whispered directly to us.
    Whisper {
        uuid: Uuid,
        name: String,
        payload: Vec<Vec<u8>>,
    },
    /// A peer shouted to a group we are in.
    Shout {
        uuid: Uuid,
        name: String,
        group: String,
        payload: Vec<Vec<u8>>,
    },
}

impl Event {
    /// Label for log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Enter { .. } => "ENTER",
            Event::Stop => "STOP",
            Event::Exit { .. } => "EXIT",
            Event::Evasive { .. } => "EVASIVE",
            Event::Join { .. } => "JOIN",
            Event::Leave { .. } => "LEAVE",
            Event::Whisper { .. } => "WHISPER",
            Event::Shout { .. } => "SHOUT",
        }
    }
}

/// Commands the owner sends to the node task. Queries carry a oneshot
/// reply sender, which makes an unknown command tag unrepresentable.
enum Command {
    Uuid(oneshot::Sender<Uuid>),
    Name(oneshot::Sender<String>),
    SetName(String),
    SetHeader(String, String),
    SetPort(u16),
    SetInterval(Duration),
    SetVerbose,
    Start(oneshot::Sender<Result<String, NodeError>>),
    Stop(oneshot::Sender<()>),
    Join(String),
    Leave(String),
    Whisper(Uuid, Vec<Vec<u8>>),
    Shout(String, Vec<Vec<u8>>),
    Peers(oneshot::Sender<Vec<Uuid>>),
    OwnGroups(oneshot::Sender<Vec<String>>),
    PeerGroups(oneshot::Sender<Vec<String>>),
    PeerEndpoint(Uuid, oneshot::Sender<Option<String>>),
    PeerName(Uuid, oneshot::Sender<Option<String>>),
    PeerHeader(Uuid, String, oneshot::Sender<Option<String>>),
    Dump,
    Terminate,
}

/// Inputs funnelled into the loop by the discovery and inbox tasks.
#[derive(Debug)]
pub(crate) enum NetInput {
    Beacon(BeaconEvent),
    Message { uuid: Uuid, msg: ZreMsg },
    Closed { uuid: Uuid },
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// Owner-side handle to a running node task.
///
/// Dropping the handle closes the command channel, which terminates the
/// node task (farewell beacon included).
pub struct Node {
    cmd: mpsc::Sender<Command>,
}

impl Node {
    /// Spawn the node task. Must be called within a tokio runtime.
    ///
    /// Returns the handle and the event stream. The node is idle until
    /// [`Node::start`] is issued.
    pub fn spawn(config: NodeConfig) -> (Node, mpsc::Receiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (net_tx, net_rx) = mpsc::channel(NET_QUEUE);
        let state = NodeState::new(config, event_tx, net_tx);
        tokio::spawn(run_node(state, cmd_rx, net_rx));
        (Node { cmd: cmd_tx }, event_rx)
    }

    async fn send(&self, cmd: Command) -> Result<(), NodeError> {
        self.cmd.send(cmd).await.map_err(|_| NodeError::Terminated)
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| NodeError::Terminated)
    }

    /// Our immutable 16-byte identity.
    pub async fn uuid(&self) -> Result<Uuid, NodeError> {
        self.query(Command::Uuid).await
    }

    /// Current node name.
    pub async fn name(&self) -> Result<String, NodeError> {
        self.query(Command::Name).await
    }

    /// Set the node name (must be non-empty; advertised in future HELLOs).
    pub async fn set_name(&self, name: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::SetName(name.into())).await
    }

    /// Insert or replace a header advertised to new peers.
    pub async fn set_header(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), NodeError> {
        self.send(Command::SetHeader(key.into(), value.into())).await
    }

    /// Override the inbox TCP port. Only honored before START.
    pub async fn set_port(&self, port: u16) -> Result<(), NodeError> {
        self.send(Command::SetPort(port)).await
    }

    /// Override the beacon interval; takes effect at the next START.
    pub async fn set_interval(&self, interval: Duration) -> Result<(), NodeError> {
        self.send(Command::SetInterval(interval)).await
    }

    /// Enable per-frame trace output.
    pub async fn set_verbose(&self) -> Result<(), NodeError> {
        self.send(Command::SetVerbose).await
    }

    /// Bind the inbox, start beaconing, and begin tracking peers.
    /// Returns the endpoint the inbox is reachable at.
    pub async fn start(&self) -> Result<String, NodeError> {
        self.query(Command::Start).await?
    }

    /// Announce departure and stop all networking. The node can be
    /// started again afterwards.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.query(Command::Stop).await
    }

    /// Join a group, announcing it to every known peer.
    pub async fn join(&self, group: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::Join(group.into())).await
    }

    /// Leave a group, announcing it to every known peer.
    pub async fn leave(&self, group: impl Into<String>) -> Result<(), NodeError> {
        self.send(Command::Leave(group.into())).await
    }

    /// Send payload frames to one peer. Unknown peers are dropped silently.
    pub async fn whisper(&self, peer: Uuid, payload: Vec<Vec<u8>>) -> Result<(), NodeError> {
        self.send(Command::Whisper(peer, payload)).await
    }

    /// Send payload frames to every peer in a group we are a member of.
    pub async fn shout(
        &self,
        group: impl Into<String>,
        payload: Vec<Vec<u8>>,
    ) -> Result<(), NodeError> {
        self.send(Command::Shout(group.into(), payload)).await
    }

    /// UUIDs of all known peers.
    pub async fn peers(&self) -> Result<Vec<Uuid>, NodeError> {
        self.query(Command::Peers).await
    }

    /// Names of the groups we joined.
    pub async fn own_groups(&self) -> Result<Vec<String>, NodeError> {
        self.query(Command::OwnGroups).await
    }

    /// Names of the groups known to have remote members.
    pub async fn peer_groups(&self) -> Result<Vec<String>, NodeError> {
        self.query(Command::PeerGroups).await
    }

    pub async fn peer_endpoint(&self, peer: Uuid) -> Result<Option<String>, NodeError> {
        self.query(|tx| Command::PeerEndpoint(peer, tx)).await
    }

    pub async fn peer_name(&self, peer: Uuid) -> Result<Option<String>, NodeError> {
        self.query(|tx| Command::PeerName(peer, tx)).await
    }

    pub async fn peer_header(
        &self,
        peer: Uuid,
        key: impl Into<String>,
    ) -> Result<Option<String>, NodeError> {
        let key = key.into();
        self.query(|tx| Command::PeerHeader(peer, key, tx)).await
    }

    /// Log a diagnostic snapshot of the node state.
    pub async fn dump(&self) -> Result<(), NodeError> {
        self.send(Command::Dump).await
    }

    /// Tear the node down. The task sends a farewell beacon and exits.
    pub async fn terminate(&self) -> Result<(), NodeError> {
        self.send(Command::Terminate).await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Runtime state
// ────────────────────────────────────────────────────────────────────────────

/// Networking resources of one START..STOP span.
struct RunningTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct NodeState {
    uuid: Uuid,
    name: String,
    headers: HashMap<String, String>,
    status: u8,
    endpoint: String,
    port: u16,
    beacon_interval: Duration,
    verbose: bool,
    peers: HashMap<Uuid, Peer>,
    own_groups: BTreeSet<String>,
    peer_groups: HashMap<String, Group>,
    events: mpsc::Sender<Event>,
    net_tx: mpsc::Sender<NetInput>,
    cancel: CancellationToken,
    run: Option<RunningTasks>,
}

async fn run_node(
    mut state: NodeState,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut net_rx: mpsc::Receiver<NetInput>,
) {
    let mut reaper = interval(Duration::from_secs(1));
    reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    // Channel closed (handle dropped) or explicit terminate.
                    None | Some(Command::Terminate) => break,
                    Some(cmd) => state.handle_command(cmd).await,
                }
            }
            input = net_rx.recv() => {
                // The state holds a net_tx clone, so recv never yields None.
                if let Some(input) = input {
                    state.handle_net(input);
                }
            }
            _ = reaper.tick() => state.reap(),
        }
    }

    state.shutdown().await;
}

impl NodeState {
    fn new(config: NodeConfig, events: mpsc::Sender<Event>, net_tx: mpsc::Sender<NetInput>) -> Self {
        let uuid = Uuid::new_v4();
        let beacon_interval = config.beacon_interval();
        let name = if config.name.is_empty() {
            uuid.simple().to_string()[..6].to_string()
        } else {
            config.name
        };
        NodeState {
            uuid,
            name,
            headers: config.headers,
            status: 0,
            endpoint: String::new(),
            port: config.port,
            beacon_interval,
            verbose: config.verbose,
            peers: HashMap::new(),
            own_groups: BTreeSet::new(),
            peer_groups: HashMap::new(),
            events,
            net_tx,
            cancel: CancellationToken::new(),
            run: None,
        }
    }

    // ── Command dispatch ─────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Uuid(reply) => {
                let _ = reply.send(self.uuid);
            }
            Command::Name(reply) => {
                let _ = reply.send(self.name.clone());
            }
            Command::SetName(name) => {
                if name.is_empty() || name.len() > u8::MAX as usize {
                    warn!("SET NAME ignored: invalid name {:?}", name);
                } else {
                    self.name = name;
                }
            }
            Command::SetHeader(key, value) => {
                if key.is_empty() || key.len() > u8::MAX as usize {
                    warn!("SET HEADER ignored: invalid key {:?}", key);
                } else {
                    self.headers.insert(key, value);
                }
            }
            Command::SetPort(port) => {
                if self.run.is_some() {
                    warn!("SET PORT ignored: node already started");
                } else {
                    self.port = port;
                }
            }
            Command::SetInterval(interval) => {
                self.beacon_interval = interval.max(Duration::from_millis(1));
            }
            Command::SetVerbose => {
                self.verbose = true;
            }
            Command::Start(reply) => {
                let _ = reply.send(self.handle_start().await);
            }
            Command::Stop(reply) => {
                self.handle_stop().await;
                let _ = reply.send(());
            }
            Command::Join(group) => self.handle_join(&group),
            Command::Leave(group) => self.handle_leave(&group),
            Command::Whisper(uuid, payload) => self.handle_whisper(uuid, payload),
            Command::Shout(group, payload) => self.handle_shout(&group, payload),
            Command::Peers(reply) => {
                let _ = reply.send(self.peers.keys().copied().collect());
            }
            Command::OwnGroups(reply) => {
                let _ = reply.send(self.own_groups.iter().cloned().collect());
            }
            Command::PeerGroups(reply) => {
                let _ = reply.send(self.peer_groups.keys().cloned().collect());
            }
            Command::PeerEndpoint(uuid, reply) => {
                let _ = reply.send(self.peers.get(&uuid).map(|p| p.endpoint.clone()));
            }
            Command::PeerName(uuid, reply) => {
                let _ = reply.send(self.peers.get(&uuid).map(|p| p.name.clone()));
            }
            Command::PeerHeader(uuid, key, reply) => {
                let _ = reply.send(
                    self.peers
                        .get(&uuid)
                        .and_then(|p| p.headers.get(&key).cloned()),
                );
            }
            Command::Dump => self.dump(),
            // Handled by the loop before dispatch.
            Command::Terminate => {}
        }
    }

    /// Bind the inbox and the discovery socket, then spawn the networking
    /// tasks. Nothing is mutated until every bind has succeeded.
    async fn handle_start(&mut self) -> Result<String, NodeError> {
        if self.run.is_some() {
            return Err(NodeError::AlreadyStarted);
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(|source| NodeError::Bind {
                what: format!("tcp inbox on port {}", self.port),
                source,
            })?;
        let inbox_port = listener
            .local_addr()
            .map_err(|source| NodeError::Bind {
                what: "tcp inbox".to_string(),
                source,
            })?
            .port();

        let udp = bind_reusable_udp(DISCOVERY_PORT)
            .await
            .map_err(|source| NodeError::Bind {
                what: format!("udp discovery port {}", DISCOVERY_PORT),
                source,
            })?;

        let host = local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string());
        self.endpoint = format!("tcp://{}:{}", host, inbox_port);

        let cancel = self.cancel.child_token();
        let handles = vec![
            tokio::spawn(run_inbox(listener, self.net_tx.clone(), cancel.clone())),
            tokio::spawn(run_beacon_listener(
                self.uuid,
                udp,
                self.net_tx.clone(),
                cancel.clone(),
            )),
            tokio::spawn(run_beacon_broadcaster(
                self.uuid,
                inbox_port,
                self.beacon_interval,
                cancel.clone(),
            )),
        ];
        self.run = Some(RunningTasks { cancel, handles });

        info!("node {} ({}) started at {}", self.name, self.uuid, self.endpoint);
        Ok(self.endpoint.clone())
    }

    /// Stop networking. Synchronous from the loop's point of view: the
    /// farewell beacon is flushed (broadcaster exit path) before this
    /// returns, so peers observe our departure before teardown.
    async fn handle_stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.cancel.cancel();
        for handle in run.handles {
            let _ = handle.await;
        }
        // Remote nodes learn of the departure from the farewell beacon;
        // locally the peers just go away, without EXIT events.
        for (_, peer) in self.peers.drain() {
            peer.disconnect();
        }
        self.peer_groups.clear();
        self.endpoint.clear();
        info!("node {} stopped", self.name);
        self.emit(Event::Stop);
    }

    async fn shutdown(&mut self) {
        self.handle_stop().await;
        self.cancel.cancel();
    }

    fn handle_join(&mut self, group: &str) {
        if !valid_group(group) {
            warn!("JOIN ignored: invalid group name {:?}", group);
            return;
        }
        // Already a member: no frames, no status change.
        if !self.own_groups.insert(group.to_string()) {
            return;
        }
        self.status = self.status.wrapping_add(1);
        let msg = ZreMsg::Join {
            seq: 0,
            group: group.to_string(),
            status: self.status,
        };
        for peer in self.peers.values_mut() {
            peer.send(msg.clone());
        }
        debug!("joined group {:?} (status {})", group, self.status);
    }

    fn handle_leave(&mut self, group: &str) {
        if !self.own_groups.remove(group) {
            return;
        }
        self.status = self.status.wrapping_add(1);
        let msg = ZreMsg::Leave {
            seq: 0,
            group: group.to_string(),
            status: self.status,
        };
        for peer in self.peers.values_mut() {
            peer.send(msg.clone());
        }
        debug!("left group {:?} (status {})", group, self.status);
    }

    fn handle_whisper(&mut self, uuid: Uuid, payload: Vec<Vec<u8>>) {
        match self.peers.get_mut(&uuid) {
            Some(peer) => peer.send(ZreMsg::Whisper {
                seq: 0,
                content: payload,
            }),
            None => debug!("WHISPER to unknown peer {} dropped", uuid),
        }
    }

    /// Fan a SHOUT out to the remote members of `group`. Requires our own
    /// membership; a group nobody else is in fans out to nobody.
    fn handle_shout(&mut self, group: &str, payload: Vec<Vec<u8>>) {
        if !self.own_groups.contains(group) {
            debug!("SHOUT to group {:?} dropped: not a member", group);
            return;
        }
        if let Some(members) = self.peer_groups.get(group) {
            let msg = ZreMsg::Shout {
                seq: 0,
                group: group.to_string(),
                content: payload,
            };
            members.send(&mut self.peers, &msg);
        }
    }

    // ── Network input ────────────────────────────────────────────────────

    fn handle_net(&mut self, input: NetInput) {
        match input {
            NetInput::Beacon(ev) => self.handle_beacon(ev),
            NetInput::Message { uuid, msg } => self.handle_message(uuid, msg),
            NetInput::Closed { uuid } => {
                if self.peers.contains_key(&uuid) {
                    debug!("peer {} inbox connection closed", uuid);
                    self.remove_peer(&uuid);
                }
            }
        }
    }

    fn handle_beacon(&mut self, ev: BeaconEvent) {
        if self.run.is_none() {
            return;
        }
        if ev.port > 0 {
            let endpoint = format!("tcp://{}:{}", ev.addr, ev.port);
            self.require_peer(ev.uuid, &endpoint);
            if let Some(peer) = self.peers.get_mut(&ev.uuid) {
                peer.refresh();
            }
        } else if self.peers.contains_key(&ev.uuid) {
            debug!("peer {} announced departure", ev.uuid);
            self.remove_peer(&ev.uuid);
        }
    }

    /// Return whether `uuid` is (now) a known peer.
    ///
    /// An unknown UUID gets a fresh peer: any existing peer holding the
    /// same endpoint is purged first (one peer per endpoint), the link is
    /// connected, and our HELLO goes out as the link's first message. The
    /// new peer is not ready until its own HELLO arrives.
    fn require_peer(&mut self, uuid: Uuid, endpoint: &str) -> bool {
        if self.peers.contains_key(&uuid) {
            return true;
        }
        let Some(run) = &self.run else {
            return false;
        };
        let parent = run.cancel.clone();

        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.endpoint == endpoint)
            .map(|(u, _)| *u)
            .collect();
        for old in stale {
            debug!("purging peer {} superseded at {}", old, endpoint);
            self.remove_peer(&old);
        }

        let mut peer = Peer::connect(self.uuid, uuid, endpoint, &parent);
        peer.send(ZreMsg::Hello {
            seq: 0,
            endpoint: self.endpoint.clone(),
            groups: self.own_groups.iter().cloned().collect(),
            status: self.status,
            name: self.name.clone(),
            headers: self.headers.clone(),
        });
        self.peers.insert(uuid, peer);
        debug!("new peer {} at {}", uuid, endpoint);
        true
    }

    fn handle_message(&mut self, uuid: Uuid, msg: ZreMsg) {
        if self.verbose {
            trace!("recv {} seq={} from {}", msg.name(), msg.seq(), uuid);
        }

        if let ZreMsg::Hello { ref endpoint, .. } = msg {
            match self.peers.get(&uuid) {
                // HELLO from a peer that already completed one: the remote
                // restarted faster than our reaper noticed. Drop the stale
                // record and treat this as a fresh arrival.
                Some(p) if p.ready => {
                    debug!("peer {} sent a second HELLO; resetting", uuid);
                    self.remove_peer(&uuid);
                }
                // Our own HELLO reflected back at us.
                Some(p) if p.endpoint == self.endpoint => return,
                _ => {}
            }
            if !self.require_peer(uuid, endpoint) {
                return;
            }
        }

        let seq = msg.seq();
        let is_hello = matches!(msg, ZreMsg::Hello { .. });
        let mut lost = false;
        match self.peers.get_mut(&uuid) {
            None => return,
            Some(peer) => {
                if is_hello {
                    peer.seed_sequence(seq);
                    peer.ready = true;
                } else if !peer.ready {
                    // Only HELLO may open a conversation.
                    return;
                } else if !peer.accepts(seq) {
                    lost = true;
                }
                if !lost {
                    peer.refresh();
                }
            }
        }
        if lost {
            warn!("messages lost from peer {}; removing it", uuid);
            self.remove_peer(&uuid);
            return;
        }

        match msg {
            ZreMsg::Hello {
                groups,
                status,
                name,
                headers,
                ..
            } => {
                let endpoint = match self.peers.get_mut(&uuid) {
                    Some(peer) => {
                        peer.name = name.clone();
                        peer.headers = headers.clone();
                        peer.endpoint.clone()
                    }
                    None => return,
                };
                self.emit(Event::Enter {
                    uuid,
                    name,
                    headers,
                    endpoint,
                });
                for group in &groups {
                    self.join_peer_group(uuid, group);
                }
                // The advertised status is authoritative for a fresh peer.
                if let Some(peer) = self.peers.get_mut(&uuid) {
                    peer.status = status;
                }
            }
            ZreMsg::Whisper { content, .. } => {
                let name = self.peer_display_name(&uuid);
                self.emit(Event::Whisper {
                    uuid,
                    name,
                    payload: content,
                });
            }
            ZreMsg::Shout { group, content, .. } => {
                let name = self.peer_display_name(&uuid);
                self.emit(Event::Shout {
                    uuid,
                    name,
                    group,
                    payload: content,
                });
            }
            ZreMsg::Join { group, status, .. } => {
                self.join_peer_group(uuid, &group);
                self.check_peer_status(uuid, status);
            }
            ZreMsg::Leave { group, status, .. } => {
                self.leave_peer_group(uuid, &group);
                self.check_peer_status(uuid, status);
            }
            // The activity refresh above is the whole point of a PING.
            ZreMsg::Ping { .. } => {}
            // Not expected in this profile.
            ZreMsg::PingOk { .. } => {}
        }
    }

    // ── Group bookkeeping ────────────────────────────────────────────────

    fn join_peer_group(&mut self, uuid: Uuid, group: &str) {
        let newly_joined = self
            .peer_groups
            .entry(group.to_string())
            .or_insert_with(Group::new)
            .join(uuid);
        if !newly_joined {
            return;
        }
        let name = match self.peers.get_mut(&uuid) {
            Some(peer) => {
                // Every membership change bumps the peer's status counter.
                peer.status = peer.status.wrapping_add(1);
                peer.name.clone()
            }
            None => String::new(),
        };
        self.emit(Event::Join {
            uuid,
            name,
            group: group.to_string(),
        });
    }

    fn leave_peer_group(&mut self, uuid: Uuid, group: &str) {
        // Empty groups persist until the node is dropped.
        let Some(members) = self.peer_groups.get_mut(group) else {
            return;
        };
        if !members.leave(uuid) {
            return;
        }
        let name = match self.peers.get_mut(&uuid) {
            Some(peer) => {
                peer.status = peer.status.wrapping_add(1);
                peer.name.clone()
            }
            None => String::new(),
        };
        self.emit(Event::Leave {
            uuid,
            name,
            group: group.to_string(),
        });
    }

    /// Advisory status check after a JOIN/LEAVE. Drift is logged and
    /// resynced, never fatal.
    fn check_peer_status(&mut self, uuid: Uuid, advertised: u8) {
        if let Some(peer) = self.peers.get_mut(&uuid) {
            if peer.status != advertised {
                warn!(
                    "peer {} status out of sync (have {}, advertised {})",
                    uuid, peer.status, advertised
                );
                peer.status = advertised;
            }
        }
    }

    // ── Reaper ───────────────────────────────────────────────────────────

    fn reap(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut evasive = Vec::new();
        for (uuid, peer) in &self.peers {
            if peer.is_expired(now) {
                expired.push(*uuid);
            } else if peer.needs_evasive_ping(now) {
                evasive.push(*uuid);
            }
        }

        for uuid in evasive {
            let name = match self.peers.get_mut(&uuid) {
                Some(peer) => {
                    peer.send(ZreMsg::Ping { seq: 0 });
                    peer.mark_evasive();
                    peer.name.clone()
                }
                None => continue,
            };
            debug!("peer {} is evasive; pinged", uuid);
            self.emit(Event::Evasive { uuid, name });
        }

        for uuid in expired {
            debug!("peer {} expired", uuid);
            self.remove_peer(&uuid);
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Drop a peer: cancel its link, detach it from every group, and emit
    /// EXIT if the owner ever saw it enter.
    fn remove_peer(&mut self, uuid: &Uuid) {
        let Some(peer) = self.peers.remove(uuid) else {
            return;
        };
        peer.disconnect();
        for members in self.peer_groups.values_mut() {
            members.leave(*uuid);
        }
        if peer.ready {
            self.emit(Event::Exit {
                uuid: *uuid,
                name: peer.name,
            });
        }
    }

    fn peer_display_name(&self, uuid: &Uuid) -> String {
        self.peers
            .get(uuid)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    /// Push an event to the owner without ever blocking the loop.
    fn emit(&self, event: Event) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("owner event channel full; dropping {}", event.name());
            }
            // Owner hung up; termination follows via the command channel.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn dump(&self) {
        info!("node {} ({})", self.name, self.uuid);
        info!(
            "  endpoint: {}",
            if self.endpoint.is_empty() {
                "(not started)"
            } else {
                &self.endpoint
            }
        );
        info!("  status: {}", self.status);
        info!("  own groups: {:?}", self.own_groups);
        info!("  peer groups:");
        for (name, members) in &self.peer_groups {
            info!("    {:?}: {} members", name, members.len());
        }
        info!("  peers:");
        for (uuid, peer) in &self.peers {
            info!(
                "    {} name={:?} endpoint={} ready={}",
                uuid, peer.name, peer.endpoint, peer.ready
            );
        }
    }
}

fn valid_group(group: &str) -> bool {
    !group.is_empty() && group.len() <= u8::MAX as usize
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
