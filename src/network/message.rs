//! Defines how messages are encoded on and decoded from a node's channel.
use crate::error::LiquidError;
use crate::network::{Frame, Message};
use bincode::{deserialize, serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;

impl<T> Message<T> {
    /// Creates a new `Message`.
    pub fn new(
        msg_id: usize,
        sender_id: usize,
        target_id: usize,
        msg: T,
    ) -> Self {
        Message {
            msg_id,
            sender_id,
            target_id,
            msg,
        }
    }
}

impl<T: Serialize> Message<T> {
    /// Serializes this message into a frame
    pub(crate) fn encode(&self) -> Result<Frame, LiquidError> {
        Ok(serialize(self)?)
    }
}

impl<T: DeserializeOwned> Message<T> {
    /// Deserializes a message from a frame read off a channel
    pub(crate) fn decode(frame: &[u8]) -> Result<Self, LiquidError> {
        Ok(deserialize(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;

    #[tokio::test]
    async fn test_send_reaches_target_channel() {
        let mut nodes = Network::connect(3, 4);
        let (_, mut rx2) = nodes.pop().unwrap();
        let (net0, _rx0) = nodes.remove(0);
        let msg = Message::new(7, 0, 2, String::from("hello"));
        net0.send_msg(msg.clone()).await.unwrap();
        let frame = rx2.recv().await.unwrap();
        let got: Message<String> = Message::decode(&frame).unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let mut nodes = Network::connect(1, 4);
        let (net, _rx) = nodes.remove(0);
        let err = net.send_msg(Message::new(0, 0, 5, 1u8)).await;
        assert!(matches!(err, Err(LiquidError::NodeUnreachable(5))));
    }
}
