use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Network identity of a peer in the fixed membership.
///
/// `num` is the node's index in `[0, N)`; it seeds the node's proposal
/// numbers, so it must be unique across the membership.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeLocation {
    pub host: String,
    pub port: u16,
    pub num: usize,
}

impl NodeLocation {
    pub fn new<H: Into<String>>(host: H, port: u16, num: usize) -> Self {
        NodeLocation {
            host: host.into(),
            port,
            num,
        }
    }

    /// Address string suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{:>02}", self.num)
    }
}

/// Local copy of the fixed peer set, plus the advisory leader hint.
///
/// At most one node carries the leader flag at a time; rotating the
/// flag to a new node implicitly clears it everywhere else. The flag
/// only biases retransmission behavior and is never required for the
/// safety of consensus.
#[derive(Clone, Debug, Default)]
pub struct Membership {
    nodes: Vec<NodeLocation>,
    leader: Option<usize>,
}

impl Membership {
    /// Replace the peer set. The set should include the local node.
    pub fn set_nodes(&mut self, nodes: Vec<NodeLocation>) {
        self.nodes = nodes;
    }

    pub fn nodes(&self) -> &[NodeLocation] {
        &self.nodes
    }

    /// Total number of nodes in the membership.
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// Flag the node with the given `num` as leader, clearing all others.
    pub fn set_leader(&mut self, num: usize) {
        self.leader = Some(num);
    }

    pub fn is_leader(&self, num: usize) -> bool {
        self.leader == Some(num)
    }

    /// The node currently flagged leader, if it exists in the peer set.
    pub fn leader(&self) -> Option<&NodeLocation> {
        let num = self.leader?;
        self.nodes.iter().find(|node| node.num == num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(count: usize) -> Membership {
        let mut membership = Membership::default();
        membership.set_nodes(
            (0..count)
                .map(|num| NodeLocation::new("127.0.0.1", 9000 + num as u16, num))
                .collect(),
        );
        membership
    }

    #[test]
    fn leader_flag_is_singleton() {
        let mut membership = membership(3);
        assert!(membership.leader().is_none());

        membership.set_leader(0);
        assert!(membership.is_leader(0));

        membership.set_leader(2);
        assert!(membership.is_leader(2));
        assert!(!membership.is_leader(0));
        assert_eq!(membership.leader().map(|node| node.num), Some(2));
    }

    #[test]
    fn leader_outside_membership_has_no_location() {
        let mut membership = membership(3);
        membership.set_leader(7);
        assert!(membership.is_leader(7));
        assert!(membership.leader().is_none());
    }

    #[test]
    fn address_and_identity() {
        let location = NodeLocation::new("10.0.0.1", 4000, 2);
        assert_eq!(location.address(), "10.0.0.1:4000");
        assert_eq!(location.to_string(), "node-02");
    }
}
