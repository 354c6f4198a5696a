use std::sync::{Arc, Mutex};

use super::client::{self, Client};
use super::error::{Error, Result};
use super::message::Reassembler;
use super::socket::SocketApi;
use super::NodeId;

/// A bus participant. Sends whole messages and receives them reassembled.
pub struct Node {
    id: NodeId,
    client: Client,
}

impl Node {
    /// Connects to the router as `id`. `on_message` is called on the receive thread with the
    /// sender's id and the payload of each complete message addressed to this node or
    /// broadcast.
    pub fn connect<F>(
        id: NodeId,
        config: client::Config,
        sockets: Arc<dyn SocketApi>,
        on_message: F,
    ) -> Result<Self>
    where
        F: FnMut(NodeId, Box<[u8]>) + Send + 'static,
    {
        if id == 0 {
            return Err(Error::Configuration("node id 0 is reserved"));
        }

        let receiver = Mutex::new((Reassembler::new(), on_message));

        let client = Client::builder()
            .config(config)
            .sockets(sockets)
            .on_packet(move |packet| {
                let mut receiver = receiver.lock().unwrap();
                let (reassembler, on_message) = &mut *receiver;

                if let Some(message) = reassembler.insert(&packet) {
                    log::debug!(
                        "node {}: message from {} ({} bytes)",
                        id,
                        message.src,
                        message.data.len()
                    );
                    on_message(message.src, message.data);
                }
            })
            .build()?;

        client.connect_to_server(id)?;

        Ok(Self { id, client })
    }

    /// Sends `data` to `dst`, or to every other node if `broadcast` is set. An empty message
    /// sends nothing, and one over [`MESSAGE_BYTES_MAX`](crate::message::MESSAGE_BYTES_MAX)
    /// is refused.
    pub fn send_message(&self, data: &[u8], dst: NodeId, broadcast: bool) -> Result<()> {
        self.client.send_message(data, dst, self.id, broadcast)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.client.state() == client::State::Connected
    }

    pub fn close(&self) {
        self.client.close_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::socket::MemNetwork;

    #[test]
    fn reserved_id() {
        let net = Arc::new(MemNetwork::new());

        let result = Node::connect(0, Default::default(), net, |_, _| {});
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn no_router() {
        let net = Arc::new(MemNetwork::new());

        let result = Node::connect(3, Default::default(), net, |_, _| {});
        assert!(matches!(result, Err(Error::ConnectFailed(_))));
    }
}
