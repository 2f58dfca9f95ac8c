//! A named group: the set of remote peers currently in it.
//!
//! Groups hold UUID references into the node's peer table, never peers
//! themselves; the node mediates every lookup.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::peer::Peer;
use crate::protocol::ZreMsg;

#[derive(Debug, Default)]
pub struct Group {
    members: HashSet<Uuid>,
}

impl Group {
    pub fn new() -> Self {
        Group::default()
    }

    /// Add a peer. Returns false when it was already a member.
    pub fn join(&mut self, uuid: Uuid) -> bool {
        self.members.insert(uuid)
    }

    /// Remove a peer. Returns false when it was not a member.
    pub fn leave(&mut self, uuid: Uuid) -> bool {
        self.members.remove(&uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.members.contains(uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Fan a message out to every member. Each peer stamps its own sequence,
    /// so every recipient sees its own monotonic stream.
    pub fn send(&self, peers: &mut HashMap<Uuid, Peer>, msg: &ZreMsg) {
        for uuid in &self.members {
            if let Some(peer) = peers.get_mut(uuid) {
                peer.send(msg.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn peer_with_queue(uuid: Uuid) -> (Peer, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Peer::new(uuid, "tcp://127.0.0.1:1".to_string(), tx, CancellationToken::new()),
            rx,
        )
    }

    #[test]
    fn join_and_leave_track_membership() {
        let mut group = Group::new();
        let uuid = Uuid::new_v4();
        assert!(group.join(uuid));
        assert!(!group.join(uuid));
        assert!(group.contains(&uuid));
        assert!(group.leave(uuid));
        assert!(!group.leave(uuid));
        assert!(group.is_empty());
    }

    #[test]
    fn send_reaches_members_only() {
        let member = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        let (member_peer, mut member_rx) = peer_with_queue(member);
        let (outsider_peer, mut outsider_rx) = peer_with_queue(outsider);

        let mut peers = HashMap::new();
        peers.insert(member, member_peer);
        peers.insert(outsider, outsider_peer);

        let mut group = Group::new();
        group.join(member);
        group.send(
            &mut peers,
            &ZreMsg::Shout {
                seq: 0,
                group: "chat".to_string(),
                content: vec![b"hi".to_vec()],
            },
        );

        assert!(member_rx.try_recv().is_ok());
        assert!(outsider_rx.try_recv().is_err());
    }
}
