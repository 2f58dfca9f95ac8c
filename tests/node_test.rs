//! Integration tests: a real node exercised over loopback TCP by a
//! hand-driven fake peer, plus a full two-node discovery scenario that
//! needs a broadcast-capable network (run with `--ignored`).

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;
use zre_node::protocol::{read_frame, write_frame, ZreMsg};
use zre_node::{Event, Node, NodeConfig};

const WAIT: Duration = Duration::from_secs(10);

/// Wait for the first event matching `pred`, skipping everything else
/// (other tests on the same machine may be beaconing on the shared
/// discovery port, so unrelated peers can show up).
async fn wait_for(
    events: &mut mpsc::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("node terminated");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// A hand-driven remote peer: its own inbox listener plus an outbound
/// connection into the node under test, with sequence stamping like a
/// real implementation.
struct FakePeer {
    uuid: Uuid,
    endpoint: String,
    listener: TcpListener,
    stream: TcpStream,
    seq: u16,
}

impl FakePeer {
    async fn connect(node_endpoint: &str) -> FakePeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let addr = node_endpoint.strip_prefix("tcp://").unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let uuid = Uuid::new_v4();
        write_frame(&mut stream, uuid.as_bytes()).await.unwrap();
        FakePeer {
            uuid,
            endpoint,
            listener,
            stream,
            seq: 0,
        }
    }

    async fn send(&mut self, mut msg: ZreMsg) {
        self.seq = self.seq.wrapping_add(1);
        msg.set_seq(self.seq);
        write_frame(&mut self.stream, &msg.encode()).await.unwrap();
    }

    async fn hello(&mut self, name: &str, groups: &[&str]) {
        let msg = ZreMsg::Hello {
            seq: 0,
            endpoint: self.endpoint.clone(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            status: groups.len() as u8,
            name: name.to_string(),
            headers: HashMap::new(),
        };
        self.send(msg).await;
    }

    /// Accept the node's outbound link and consume its identity + HELLO.
    async fn accept_node_link(&mut self) -> (Uuid, ZreMsg, TcpStream) {
        let (mut stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("node never connected")
            .unwrap();
        let identity = read_frame(&mut stream).await.unwrap();
        let uuid = Uuid::from_slice(&identity).unwrap();
        let hello = ZreMsg::decode(&read_frame(&mut stream).await.unwrap()).unwrap();
        (uuid, hello, stream)
    }
}

/// Read the next non-PING message from a node link.
async fn next_link_msg(stream: &mut TcpStream) -> ZreMsg {
    timeout(WAIT, async {
        loop {
            let frame = read_frame(stream).await.unwrap();
            let msg = ZreMsg::decode(&frame).unwrap();
            if !matches!(msg, ZreMsg::Ping { .. }) {
                return msg;
            }
        }
    })
    .await
    .expect("timed out reading link")
}

#[tokio::test]
async fn handshake_groups_and_messaging_over_loopback() {
    let config = NodeConfig {
        name: "alpha".to_string(),
        ..Default::default()
    };
    let (node, mut events) = Node::spawn(config);
    let endpoint = node.start().await.unwrap();

    let mut fake = FakePeer::connect(&endpoint).await;
    fake.hello("beta", &["chat"]).await;
    let fake_uuid = fake.uuid;

    // The owner sees the peer enter, then join its advertised group.
    let enter = wait_for(&mut events, |e| {
        matches!(e, Event::Enter { uuid, .. } if *uuid == fake_uuid)
    })
    .await;
    match enter {
        Event::Enter { name, endpoint, .. } => {
            assert_eq!(name, "beta");
            assert_eq!(endpoint, fake.endpoint);
        }
        _ => unreachable!(),
    }
    wait_for(&mut events, |e| {
        matches!(e, Event::Join { uuid, group, .. } if *uuid == fake_uuid && group == "chat")
    })
    .await;

    // The node dialed back into our inbox and introduced itself.
    let (node_uuid, node_hello, mut link) = fake.accept_node_link().await;
    assert_eq!(node_uuid, node.uuid().await.unwrap());
    match node_hello {
        ZreMsg::Hello {
            seq,
            name,
            endpoint: hello_endpoint,
            ..
        } => {
            assert_eq!(seq, 1);
            assert_eq!(name, "alpha");
            assert_eq!(hello_endpoint, endpoint);
        }
        other => panic!("expected HELLO, got {:?}", other),
    }

    // Inbound whisper reaches the owner.
    fake.send(ZreMsg::Whisper {
        seq: 0,
        content: vec![b"psst".to_vec()],
    })
    .await;
    let whisper = wait_for(&mut events, |e| {
        matches!(e, Event::Whisper { uuid, .. } if *uuid == fake_uuid)
    })
    .await;
    match whisper {
        Event::Whisper { name, payload, .. } => {
            assert_eq!(name, "beta");
            assert_eq!(payload, vec![b"psst".to_vec()]);
        }
        _ => unreachable!(),
    }

    // Our JOIN goes out to every peer, then SHOUT fans out to the group.
    node.join("chat").await.unwrap();
    match next_link_msg(&mut link).await {
        ZreMsg::Join { group, status, .. } => {
            assert_eq!(group, "chat");
            assert_eq!(status, 1);
        }
        other => panic!("expected JOIN, got {:?}", other),
    }

    node.shout("chat", vec![b"hi".to_vec()]).await.unwrap();
    match next_link_msg(&mut link).await {
        ZreMsg::Shout { group, content, .. } => {
            assert_eq!(group, "chat");
            assert_eq!(content, vec![b"hi".to_vec()]);
        }
        other => panic!("expected SHOUT, got {:?}", other),
    }

    node.whisper(fake_uuid, vec![b"direct".to_vec()])
        .await
        .unwrap();
    match next_link_msg(&mut link).await {
        ZreMsg::Whisper { content, .. } => {
            assert_eq!(content, vec![b"direct".to_vec()]);
        }
        other => panic!("expected WHISPER, got {:?}", other),
    }

    // Queries reflect what we set up.
    assert!(node.peers().await.unwrap().contains(&fake_uuid));
    assert!(node.own_groups().await.unwrap().contains(&"chat".to_string()));
    assert!(node
        .peer_groups()
        .await
        .unwrap()
        .contains(&"chat".to_string()));
    assert_eq!(
        node.peer_endpoint(fake_uuid).await.unwrap(),
        Some(fake.endpoint.clone())
    );
    assert_eq!(
        node.peer_name(fake_uuid).await.unwrap(),
        Some("beta".to_string())
    );
    assert_eq!(node.peer_header(fake_uuid, "nope").await.unwrap(), None);

    // The peer leaves its group, then hangs up entirely.
    fake.send(ZreMsg::Leave {
        seq: 0,
        group: "chat".to_string(),
        status: 2,
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, Event::Leave { uuid, group, .. } if *uuid == fake_uuid && group == "chat")
    })
    .await;

    drop(fake);
    wait_for(&mut events, |e| {
        matches!(e, Event::Exit { uuid, .. } if *uuid == fake_uuid)
    })
    .await;

    node.stop().await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::Stop)).await;
    node.terminate().await.unwrap();
}

#[tokio::test]
async fn sequence_gap_drops_the_peer() {
    let (node, mut events) = Node::spawn(NodeConfig::default());
    let endpoint = node.start().await.unwrap();

    let mut fake = FakePeer::connect(&endpoint).await;
    fake.hello("gappy", &[]).await;
    let fake_uuid = fake.uuid;
    wait_for(&mut events, |e| {
        matches!(e, Event::Enter { uuid, .. } if *uuid == fake_uuid)
    })
    .await;

    // Skip ahead in the sequence space: the node must declare loss.
    fake.seq = fake.seq.wrapping_add(5);
    fake.send(ZreMsg::Whisper {
        seq: 0,
        content: vec![b"too late".to_vec()],
    })
    .await;

    wait_for(&mut events, |e| {
        matches!(e, Event::Exit { uuid, .. } if *uuid == fake_uuid)
    })
    .await;
    assert!(!node.peers().await.unwrap().contains(&fake_uuid));

    node.terminate().await.unwrap();
}

#[tokio::test]
async fn start_reports_endpoint_and_is_not_reentrant() {
    let (node, _events) = Node::spawn(NodeConfig::default());
    let endpoint = node.start().await.unwrap();
    assert!(endpoint.starts_with("tcp://"));
    assert!(node.start().await.is_err());

    node.stop().await.unwrap();
    // A stopped node can be started again.
    let endpoint = node.start().await.unwrap();
    assert!(endpoint.starts_with("tcp://"));
    node.terminate().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a broadcast-capable network interface"]
async fn two_nodes_discover_and_chat() {
    let (a, mut events_a) = Node::spawn(NodeConfig {
        name: "a".to_string(),
        ..Default::default()
    });
    let (b, mut events_b) = Node::spawn(NodeConfig {
        name: "b".to_string(),
        ..Default::default()
    });
    a.start().await.unwrap();
    b.start().await.unwrap();
    let a_uuid = a.uuid().await.unwrap();
    let b_uuid = b.uuid().await.unwrap();

    // Within a couple of beacon intervals both sides see each other.
    wait_for(&mut events_a, |e| {
        matches!(e, Event::Enter { uuid, .. } if *uuid == b_uuid)
    })
    .await;
    wait_for(&mut events_b, |e| {
        matches!(e, Event::Enter { uuid, .. } if *uuid == a_uuid)
    })
    .await;

    // Group membership propagates.
    a.join("chat").await.unwrap();
    wait_for(&mut events_b, |e| {
        matches!(e, Event::Join { uuid, group, .. } if *uuid == a_uuid && group == "chat")
    })
    .await;
    b.join("chat").await.unwrap();
    wait_for(&mut events_a, |e| {
        matches!(e, Event::Join { uuid, group, .. } if *uuid == b_uuid && group == "chat")
    })
    .await;

    // A shout from a reaches b.
    a.shout("chat", vec![b"hi".to_vec()]).await.unwrap();
    let shout = wait_for(&mut events_b, |e| {
        matches!(e, Event::Shout { uuid, .. } if *uuid == a_uuid)
    })
    .await;
    match shout {
        Event::Shout { group, payload, .. } => {
            assert_eq!(group, "chat");
            assert_eq!(payload, vec![b"hi".to_vec()]);
        }
        _ => unreachable!(),
    }

    // A graceful stop announces departure via the farewell beacon.
    b.stop().await.unwrap();
    wait_for(&mut events_a, |e| {
        matches!(e, Event::Exit { uuid, .. } if *uuid == b_uuid)
    })
    .await;

    a.terminate().await.unwrap();
    b.terminate().await.unwrap();
}
