use std::net;
use std::sync::{Arc, Mutex};
use std::thread;

use super::error::{Errno, Error, Result};
use super::frame::{self, Packet};
use super::message;
use super::socket::{self, Fd, SocketApi};
use super::NodeId;

/// Invoked on the receive thread for every valid packet delivered by the router.
pub type PacketCallback = Arc<dyn Fn(Packet) + Send + Sync>;

/// Configuration for a [`Client`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the router.
    ///
    /// Default value: 127.0.0.1:8888
    pub router_addr: net::SocketAddrV4,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router_addr: net::SocketAddrV4::new(
                net::Ipv4Addr::LOCALHOST,
                super::ROUTER_PORT_DEFAULT,
            ),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.router_addr.port() == 0 {
            return Err(Error::Configuration("router port must be nonzero"));
        }

        Ok(())
    }
}

/// Connection state of a [`Client`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

enum Link {
    Disconnected,
    Connecting,
    Connected { id: NodeId, fd: Fd },
    Closed,
}

impl Link {
    fn state(&self) -> State {
        match self {
            Link::Disconnected => State::Disconnected,
            Link::Connecting => State::Connecting,
            Link::Connected { .. } => State::Connected,
            Link::Closed => State::Closed,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Link::Disconnected => "disconnected",
            Link::Connecting => "connecting",
            Link::Connected { .. } => "connected",
            Link::Closed => "closed",
        }
    }
}

struct ClientCore {
    // Saved configuration
    config: Config,
    // Socket capability
    sockets: Arc<dyn SocketApi>,
    // Receives every packet read from the router
    on_packet: PacketCallback,
    // Current connection; never held across a blocking call
    link: Mutex<Link>,
    // Held for the duration of a write. The socket is only closed under this lock.
    writer: Mutex<()>,
    // Receive loop thread, if one has been started
    receiver: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Connection from a bus participant to the router.
pub struct Client {
    core: Arc<ClientCore>,
}

/// Builds a [`Client`]. Both a socket capability and a packet callback are required.
#[derive(Default)]
pub struct Builder {
    config: Config,
    sockets: Option<Arc<dyn SocketApi>>,
    on_packet: Option<PacketCallback>,
}

impl Builder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn sockets(mut self, sockets: Arc<dyn SocketApi>) -> Self {
        self.sockets = Some(sockets);
        self
    }

    pub fn on_packet<F>(mut self, f: F) -> Self
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.on_packet = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate()?;

        let sockets = self
            .sockets
            .ok_or(Error::Configuration("client requires a socket capability"))?;
        let on_packet = self
            .on_packet
            .ok_or(Error::Configuration("client requires a packet callback"))?;

        Ok(Client {
            core: Arc::new(ClientCore {
                config: self.config,
                sockets,
                on_packet,
                link: Mutex::new(Link::Disconnected),
                writer: Mutex::new(()),
                receiver: Mutex::new(None),
            }),
        })
    }
}

impl ClientCore {
    /// Opens a socket to the router and announces `id`. The socket is released on failure.
    fn open(&self, id: NodeId) -> Result<Fd> {
        let api = &*self.sockets;

        let fd = api.socket();

        if fd < 0 {
            return Err(Error::SocketCreateFailed(Errno(-fd)));
        }

        let ret = api.connect(fd, &self.config.router_addr);

        if ret < 0 {
            api.close(fd);
            return Err(Error::ConnectFailed(Errno(-ret)));
        }

        if let Err(err) = socket::send_packet(api, fd, &Packet::init(id)) {
            api.close(fd);
            return Err(err);
        }

        Ok(fd)
    }

    fn is_connected_on(&self, fd: Fd) -> bool {
        matches!(*self.link.lock().unwrap(), Link::Connected { fd: link_fd, .. } if link_fd == fd)
    }

    /// Marks the connection on `fd` closed. Returns false if it had already been taken down.
    fn take_link(&self, fd: Fd) -> bool {
        let mut link = self.link.lock().unwrap();

        if matches!(*link, Link::Connected { fd: link_fd, .. } if link_fd == fd) {
            *link = Link::Closed;
            return true;
        }

        false
    }

    /// Joins the receive loop, unless called from it.
    fn join_receiver(&self) {
        let handle = {
            let mut receiver = self.receiver.lock().unwrap();

            match receiver.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => None,
                _ => receiver.take(),
            }
        };

        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Releases a socket whose link has already been marked closed.
    fn teardown(&self, fd: Fd) {
        self.sockets.shutdown(fd, socket::Shutdown::Both);
        self.join_receiver();
        self.release(fd);
    }

    /// Closes `fd` once no write is in progress on it.
    fn release(&self, fd: Fd) {
        let _writer = self.writer.lock().unwrap();
        self.sockets.close(fd);
    }
}

fn receive_loop(core: Arc<ClientCore>, fd: Fd) {
    while core.is_connected_on(fd) {
        match socket::recv_packet(&*core.sockets, fd) {
            Ok(Some(bytes)) => match frame::serial::read_packet(&bytes) {
                Ok(packet) => {
                    log::trace!(
                        "fd {} -> {}->{} psn {}/{}",
                        fd,
                        packet.src,
                        packet.dst,
                        packet.psn,
                        packet.tps
                    );
                    (core.on_packet)(packet);
                }
                Err(err) => {
                    log::debug!("fd {}: dropping packet: {}", fd, err);
                }
            },
            Ok(None) => {
                log::info!("router closed the connection");
                break;
            }
            Err(err) => {
                log::warn!("fd {}: {}", fd, err);
                break;
            }
        }
    }

    if core.take_link(fd) {
        // Not joined: this is the receive thread
        core.sockets.shutdown(fd, socket::Shutdown::Both);
        core.release(fd);
    }
}

impl Client {
    pub fn builder() -> Builder {
        Default::default()
    }

    /// Connects to the router and announces `id`, then starts the receive loop.
    ///
    /// Only valid from the `Disconnected` state. On failure the client returns to
    /// `Disconnected`.
    pub fn connect_to_server(&self, id: NodeId) -> Result<()> {
        {
            let mut link = self.core.link.lock().unwrap();

            match *link {
                Link::Disconnected => *link = Link::Connecting,
                ref other => return Err(Error::InvalidState(other.name())),
            }
        }

        let fd = match self.core.open(id) {
            Ok(fd) => fd,
            Err(err) => {
                let mut link = self.core.link.lock().unwrap();

                if let Link::Connecting = *link {
                    *link = Link::Disconnected;
                }

                log::warn!("node {} failed to connect: {}", id, err);
                return Err(err);
            }
        };

        let mut link = self.core.link.lock().unwrap();

        if !matches!(*link, Link::Connecting) {
            // Closed while connecting
            self.core.sockets.close(fd);
            return Err(Error::InvalidState(link.name()));
        }

        *link = Link::Connected { id, fd };

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name(format!("vbus-client-{id}"))
            .spawn(move || receive_loop(core, fd));

        match handle {
            Ok(handle) => {
                *self.core.receiver.lock().unwrap() = Some(handle);
            }
            Err(err) => {
                *link = Link::Closed;
                drop(link);
                self.core.sockets.close(fd);
                return Err(Error::Spawn(err));
            }
        }

        log::info!(
            "node {} connected to router at {}",
            id,
            self.core.config.router_addr
        );

        Ok(())
    }

    /// Writes one packet to the router. A failed write is never retried; a negative write
    /// result also closes the connection.
    ///
    /// Writes from several threads are serialized. The receive loop keeps reading while a write
    /// blocks.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        let writer = self.core.writer.lock().unwrap();

        let fd = match *self.core.link.lock().unwrap() {
            Link::Connected { fd, .. } => fd,
            ref other => return Err(Error::InvalidState(other.name())),
        };

        let result = socket::send_packet(&*self.core.sockets, fd, packet);

        drop(writer);

        if let Err(Error::SendFailed { written, .. }) = &result {
            log::warn!("fd {}: send failed ({})", fd, written);

            if *written < 0 && self.core.take_link(fd) {
                self.core.teardown(fd);
            }
        }

        result
    }

    /// Fragments `data` and sends each packet in order.
    ///
    /// Fails with [`Error::MessageTooLarge`] before writing anything if `data` is longer than
    /// [`message::MESSAGE_BYTES_MAX`].
    pub fn send_message(&self, data: &[u8], dst: NodeId, src: NodeId, broadcast: bool) -> Result<()> {
        if data.len() > message::MESSAGE_BYTES_MAX {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                max: message::MESSAGE_BYTES_MAX,
            });
        }

        for packet in message::fragment(src, dst, data, broadcast) {
            self.send_packet(&packet)?;
        }

        Ok(())
    }

    /// Closes the connection and waits for the receive loop to finish. Safe to call more than
    /// once, and from within the packet callback.
    pub fn close_connection(&self) {
        let previous = std::mem::replace(&mut *self.core.link.lock().unwrap(), Link::Closed);

        match previous {
            Link::Connected { id, fd } => {
                log::info!("node {} closing connection", id);
                self.core.teardown(fd);
            }
            _ => self.core.join_receiver(),
        }
    }

    pub fn state(&self) -> State {
        self.core.link.lock().unwrap().state()
    }

    /// Id announced to the router, while connected.
    pub fn id(&self) -> Option<NodeId> {
        match *self.core.link.lock().unwrap() {
            Link::Connected { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::time::Duration;

    use crate::frame::Flags;
    use crate::socket::MemNetwork;

    const PORT: u16 = 9100;

    fn config() -> Config {
        Config {
            router_addr: net::SocketAddrV4::new(net::Ipv4Addr::LOCALHOST, PORT),
        }
    }

    fn listen(net: &MemNetwork) -> Fd {
        let fd = net.socket();
        assert_eq!(net.bind(fd, &config().router_addr), 0);
        assert_eq!(net.listen(fd, 4), 0);
        fd
    }

    #[test]
    fn missing_dependencies() {
        let net: Arc<dyn SocketApi> = Arc::new(MemNetwork::new());

        let err = Client::builder().on_packet(|_| {}).build().err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Client::builder().sockets(net).build().err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn connect_refused() {
        let net = Arc::new(MemNetwork::new());

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(|_| {})
            .build()
            .unwrap();

        let err = client.connect_to_server(5).unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(Errno(libc::ECONNREFUSED))));
        assert_eq!(client.state(), State::Disconnected);
        assert_eq!(net.open_count(), 0);
    }

    #[test]
    fn send_requires_connection() {
        let net = Arc::new(MemNetwork::new());

        let client = Client::builder()
            .config(config())
            .sockets(net)
            .on_packet(|_| {})
            .build()
            .unwrap();

        let packet = Packet::new(1, 2, 0, 1, b"x", Flags::empty());
        assert!(matches!(
            client.send_packet(&packet),
            Err(Error::InvalidState("disconnected"))
        ));
    }

    #[test]
    fn init_then_traffic() {
        let net = Arc::new(MemNetwork::new());
        let lfd = listen(&net);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(move |packet| tx.lock().unwrap().send(packet).unwrap())
            .build()
            .unwrap();

        client.connect_to_server(5).unwrap();
        assert_eq!(client.state(), State::Connected);
        assert_eq!(client.id(), Some(5));

        let sfd = net.accept(lfd);

        let init = socket::recv_packet(&*net, sfd).unwrap().unwrap();
        let init = frame::serial::read_packet(&init).unwrap();
        assert!(init.is_init());
        assert_eq!(init.src, 5);

        client.send_message(b"0123456789", 9, 5, false).unwrap();

        for psn in 0..2 {
            let bytes = socket::recv_packet(&*net, sfd).unwrap().unwrap();
            let packet = frame::serial::read_packet(&bytes).unwrap();
            assert_eq!(packet.psn, psn);
            assert_eq!(packet.dst, 9);
        }

        let reply = Packet::new(9, 5, 0, 1, b"ok", Flags::empty());
        socket::send_packet(&*net, sfd, &reply).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received, reply);

        client.close_connection();
        client.close_connection();
        assert_eq!(client.state(), State::Closed);

        // Router side observes the disconnect
        assert!(socket::recv_packet(&*net, sfd).unwrap().is_none());
    }

    #[test]
    fn router_disconnect_tears_down() {
        let net = Arc::new(MemNetwork::new());
        let lfd = listen(&net);

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(|_| {})
            .build()
            .unwrap();

        client.connect_to_server(5).unwrap();

        let sfd = net.accept(lfd);
        net.close(sfd);

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while client.state() != State::Closed {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        client.close_connection();
        assert_eq!(net.open_count(), 1);
    }

    #[test]
    fn init_send_failure() {
        let net = Arc::new(MemNetwork::new());
        let lfd = listen(&net);

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(|_| {})
            .build()
            .unwrap();

        net.fail_send_after(0);

        let err = client.connect_to_server(5).unwrap_err();
        assert!(matches!(err, Error::SendFailed { written, .. } if written < 0));
        assert_eq!(client.state(), State::Disconnected);

        // Only the listener and the router side of the refused connection remain
        let sfd = net.accept(lfd);
        assert!(socket::recv_packet(&*net, sfd).unwrap().is_none());
        assert_eq!(net.open_count(), 2);

        // A later attempt starts over
        client.connect_to_server(5).unwrap();
        assert_eq!(client.state(), State::Connected);
    }

    #[test]
    fn short_write_keeps_connection() {
        let net = Arc::new(MemNetwork::new());
        let lfd = listen(&net);

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(|_| {})
            .build()
            .unwrap();

        client.connect_to_server(5).unwrap();
        let _sfd = net.accept(lfd);

        net.short_send_after(0);

        let packet = Packet::new(5, 9, 0, 1, b"x", Flags::empty());
        assert!(matches!(
            client.send_packet(&packet),
            Err(Error::SendFailed {
                written: 18,
                expected: frame::PACKET_SIZE
            })
        ));
        assert_eq!(client.state(), State::Connected);

        client.send_packet(&packet).unwrap();
    }

    #[test]
    fn oversize_message_rejected() {
        let net = Arc::new(MemNetwork::new());
        let lfd = listen(&net);

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(|_| {})
            .build()
            .unwrap();

        client.connect_to_server(5).unwrap();
        let _sfd = net.accept(lfd);

        let sends = net.send_count();
        let data = vec![0u8; message::MESSAGE_BYTES_MAX + 1];

        let err = client.send_message(&data, 9, 5, false).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { len, .. } if len == data.len()));
        assert_eq!(net.send_count(), sends);
        assert_eq!(client.state(), State::Connected);
    }

    #[test]
    fn failed_send_closes() {
        let net = Arc::new(MemNetwork::new());
        let lfd = listen(&net);

        let client = Client::builder()
            .config(config())
            .sockets(net.clone())
            .on_packet(|_| {})
            .build()
            .unwrap();

        client.connect_to_server(5).unwrap();
        let _sfd = net.accept(lfd);

        net.fail_send_after(0);

        let packet = Packet::new(5, 9, 0, 1, b"x", Flags::empty());
        assert!(matches!(
            client.send_packet(&packet),
            Err(Error::SendFailed { written, .. }) if written < 0
        ));
        assert_eq!(client.state(), State::Closed);
    }
}
