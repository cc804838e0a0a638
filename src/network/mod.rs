//! A module with methods to communicate between the nodes of a cloud.
//!
//! Every node owns the receiving half of one `mpsc` channel and holds the
//! sending half of every node's channel (its own included). Messages are
//! wrapped in a [`Message`] envelope and serialized with `bincode` before they
//! are sent, so anything that crosses from one node to another is encoded and
//! decoded exactly as it would be on a socket.
use crate::error::LiquidError;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};

mod message;

/// A serialized frame travelling on a node's channel
pub type Frame = Vec<u8>;

/// A message for communication between nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message<T> {
    /// The id of this message. Replies carry the id of the request they
    /// answer.
    pub(crate) msg_id: usize,
    /// The id of the sender
    pub(crate) sender_id: usize,
    /// The id of the node this message is being sent to
    pub(crate) target_id: usize,
    /// The body of the message
    pub(crate) msg: T,
}

/// The outgoing side of a node's connections: one sender per node in the
/// cloud, indexed by node id.
#[derive(Debug, Clone)]
pub struct Network {
    /// The `id` of the node owning this `Network`
    pub id: usize,
    peers: Vec<Sender<Frame>>,
}

impl Network {
    /// Creates the connections for a cloud of `num_nodes` nodes. Returns one
    /// `Network` per node along with the receiving half of that node's
    /// channel, in node id order.
    pub fn connect(
        num_nodes: usize,
        capacity: usize,
    ) -> Vec<(Network, Receiver<Frame>)> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_nodes)
            .map(|_| mpsc::channel(capacity))
            .unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(id, receiver)| {
                let network = Network {
                    id,
                    peers: senders.clone(),
                };
                (network, receiver)
            })
            .collect()
    }

    /// The number of nodes reachable from this `Network`, including this one
    pub fn num_nodes(&self) -> usize {
        self.peers.len()
    }

    /// Serializes and sends the given `message` to `message.target_id`
    pub async fn send_msg<T: Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<(), LiquidError> {
        let target_id = message.target_id;
        let peer = self
            .peers
            .get(target_id)
            .ok_or(LiquidError::NodeUnreachable(target_id))?;
        let frame = message.encode()?;
        debug!(
            "Node {} sending message {} ({} bytes) to node {}",
            self.id,
            message.msg_id,
            frame.len(),
            target_id
        );
        peer.send(frame)
            .await
            .map_err(|_| LiquidError::NodeUnreachable(target_id))
    }
}
