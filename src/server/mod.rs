mod peer;

use std::collections::HashMap;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::error::{Errno, Error, Result};
use super::frame::Packet;
use super::socket::{self, Fd, SocketApi};
use super::NodeId;

const BACKLOG_MAX: u32 = 4096;

/// Invoked on a connection's handler thread for every valid packet received from that
/// connection.
pub type PacketCallback = Arc<dyn Fn(&Server, Packet) + Send + Sync>;

/// Configuration for a [`Server`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the local interface to listen on.
    ///
    /// Default value: 127.0.0.1
    pub bind_addr: net::Ipv4Addr,

    /// Port to listen on.
    ///
    /// Minimum value: 1 \
    /// Default value: 8888
    pub port: u16,

    /// Maximum number of connections waiting to be accepted.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 4096 \
    /// Default value: 16
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: net::Ipv4Addr::LOCALHOST,
            port: super::ROUTER_PORT_DEFAULT,
            backlog: super::LISTEN_BACKLOG_DEFAULT,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Configuration("server port must be nonzero"));
        }
        if self.backlog == 0 || self.backlog > BACKLOG_MAX {
            return Err(Error::Configuration("server backlog must be within 1..=4096"));
        }

        Ok(())
    }

    fn local_addr(&self) -> net::SocketAddrV4 {
        net::SocketAddrV4::new(self.bind_addr, self.port)
    }
}

/// Lifecycle of a [`Server`]'s listening socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Listening,
    Accepting,
    Stopped,
}

struct ServerCore {
    // Saved configuration
    config: Config,
    // Socket capability
    sockets: Arc<dyn SocketApi>,
    // Receives every valid packet from every registered connection
    on_packet: PacketCallback,
    // Listening socket lifecycle
    state: Mutex<State>,
    // Cleared to stop the accept loop and every handler
    running: AtomicBool,
    // Listening socket, once bound
    listen_fd: Mutex<Option<Fd>>,
    // Connection -> declared id
    ids: Mutex<HashMap<Fd, NodeId>>,
    // Connections in their forwarding loop. Writes happen after this lock is released.
    live: Mutex<HashMap<Fd, Arc<peer::Connection>>>,
    // Handler threads not yet joined, with the connection each one reads
    handlers: Mutex<Vec<peer::Handler>>,
    // Accept loop thread
    acceptor: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Accepts connections from bus participants and delivers their packets to a callback.
///
/// `Server` is a cheap handle; clones refer to the same listening socket and registry.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

/// Builds a [`Server`]. Both a socket capability and a packet callback are required.
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
        F: Fn(&Server, Packet) + Send + Sync + 'static,
    {
        self.on_packet = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Server> {
        self.config.validate()?;

        let sockets = self
            .sockets
            .ok_or(Error::Configuration("server requires a socket capability"))?;
        let on_packet = self
            .on_packet
            .ok_or(Error::Configuration("server requires a packet callback"))?;

        Ok(Server {
            core: Arc::new(ServerCore {
                config: self.config,
                sockets,
                on_packet,
                state: Mutex::new(State::Idle),
                running: AtomicBool::new(false),
                listen_fd: Mutex::new(None),
                ids: Default::default(),
                live: Default::default(),
                handlers: Default::default(),
                acceptor: Mutex::new(None),
            }),
        })
    }
}

impl ServerCore {
    /// Creates, binds and listens on the configured address. The socket is released on failure.
    fn open_listener(&self) -> Result<Fd> {
        let api = &*self.sockets;

        let fd = api.socket();

        if fd < 0 {
            return Err(Error::SocketCreateFailed(Errno(-fd)));
        }

        let ret = api.setsockopt(fd, socket::SockOpt::ReuseAddr, true);

        if ret < 0 {
            api.close(fd);
            return Err(Error::SocketOptionFailed(Errno(-ret)));
        }

        let ret = api.bind(fd, &self.config.local_addr());

        if ret < 0 {
            api.close(fd);
            return Err(Error::BindFailed(Errno(-ret)));
        }

        let ret = api.listen(fd, self.config.backlog as i32);

        if ret < 0 {
            api.close(fd);
            return Err(Error::ListenFailed(Errno(-ret)));
        }

        Ok(fd)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn fd_of(&self, id: NodeId) -> Option<Fd> {
        self.ids
            .lock()
            .unwrap()
            .iter()
            .find(|&(_, &registered)| registered == id)
            .map(|(&fd, _)| fd)
    }

    /// Joins a handler and drops its reference to the connection.
    fn finish_handler(&self, handler: peer::Handler) {
        if handler.thread.thread().id() == thread::current().id() {
            // Stopped from within the packet callback; the connection closes when it returns
            log::debug!("fd {}: handler stopped from its own thread", handler.conn.fd);
            return;
        }

        let _ = handler.thread.join();
    }

    /// Live connection registered under `id`.
    fn connection_of(&self, id: NodeId) -> Option<Arc<peer::Connection>> {
        let fd = self.fd_of(id)?;
        self.live.lock().unwrap().get(&fd).cloned()
    }

    /// Joins and releases every handler whose connection has already ended.
    fn reap_handlers(&self) {
        let finished = {
            let mut handlers = self.handlers.lock().unwrap();

            let (finished, active): (Vec<_>, Vec<_>) = std::mem::take(&mut *handlers)
                .into_iter()
                .partition(|handler| handler.thread.is_finished());

            *handlers = active;

            finished
        };

        for handler in finished {
            log::debug!("fd {}: reaped", handler.conn.fd);
            self.finish_handler(handler);
        }
    }
}

fn accept_loop(core: Arc<ServerCore>, listen_fd: Fd) {
    while core.is_running() {
        let fd = core.sockets.accept(listen_fd);

        if fd < 0 {
            if core.is_running() {
                log::error!("{}", Error::AcceptFailed(Errno(-fd)));
            }
            break;
        }

        if !core.is_running() {
            core.sockets.close(fd);
            break;
        }

        core.reap_handlers();

        let conn = Arc::new(peer::Connection::new(fd, Arc::clone(&core.sockets)));

        match peer::spawn(Arc::clone(&core), conn) {
            Ok(handler) => {
                log::debug!("fd {}: accepted", fd);
                core.handlers.lock().unwrap().push(handler);
            }
            Err(err) => {
                // Dropping the connection closes it
                log::warn!("fd {}: {}", fd, Error::Spawn(err));
            }
        }
    }

    log::debug!("accept loop finished");
}

impl Server {
    pub fn builder() -> Builder {
        Default::default()
    }

    /// Binds and listens on the configured address, then starts accepting connections on a
    /// background thread.
    pub fn start_connection(&self) -> Result<()> {
        let core = &self.core;

        {
            let mut state = core.state.lock().unwrap();

            if *state != State::Idle {
                return Err(Error::InvalidState("server already started"));
            }

            *state = State::Listening;
        }

        let listen_fd = match core.open_listener() {
            Ok(fd) => fd,
            Err(err) => {
                *core.state.lock().unwrap() = State::Idle;
                log::error!("failed to listen on {}: {}", core.config.local_addr(), err);
                return Err(err);
            }
        };

        *core.listen_fd.lock().unwrap() = Some(listen_fd);
        core.running.store(true, Ordering::Release);

        let accept_core = Arc::clone(core);
        let handle = thread::Builder::new()
            .name("vbus-accept".into())
            .spawn(move || accept_loop(accept_core, listen_fd));

        match handle {
            Ok(handle) => {
                *core.acceptor.lock().unwrap() = Some(handle);
                *core.state.lock().unwrap() = State::Accepting;
            }
            Err(err) => {
                core.running.store(false, Ordering::Release);
                core.listen_fd.lock().unwrap().take();
                core.sockets.close(listen_fd);
                *core.state.lock().unwrap() = State::Idle;
                return Err(Error::Spawn(err));
            }
        }

        log::info!("listening on {}", core.config.local_addr());

        Ok(())
    }

    /// Writes a packet to the connection registered under `packet.dst`. Registry locks are
    /// released before writing, so a slow reader only holds up writes addressed to it.
    pub fn send_destination(&self, packet: &Packet) -> Result<()> {
        let conn = self
            .core
            .connection_of(packet.dst)
            .ok_or(Error::InvalidClientId(packet.dst))?;

        conn.send(packet)
    }

    /// Writes a packet to every live connection except the one registered under `packet.src`.
    /// The first failed write aborts the remaining writes.
    ///
    /// Packets forwarded by the router always carry their sender's registered id, so the
    /// excluded connection is the one the packet arrived on.
    pub fn send_broadcast(&self, packet: &Packet) -> Result<()> {
        let origin = self.core.fd_of(packet.src);

        let targets: Vec<Arc<peer::Connection>> = self
            .core
            .live
            .lock()
            .unwrap()
            .iter()
            .filter(|&(&fd, _)| Some(fd) != origin)
            .map(|(_, conn)| Arc::clone(conn))
            .collect();

        for conn in targets {
            conn.send(packet)?;
        }

        Ok(())
    }

    /// Stops accepting, disconnects every client and joins all threads. Safe to call more than
    /// once.
    pub fn stop_server(&self) {
        let core = &self.core;

        {
            let mut state = core.state.lock().unwrap();

            let previous = std::mem::replace(&mut *state, State::Stopped);

            if previous == State::Stopped || previous == State::Idle {
                return;
            }
        }

        core.running.store(false, Ordering::Release);

        let listen_fd = core.listen_fd.lock().unwrap().take();

        if let Some(fd) = listen_fd {
            core.sockets.shutdown(fd, socket::Shutdown::Both);
        }

        let acceptor = core.acceptor.lock().unwrap().take();

        if let Some(handle) = acceptor {
            let _ = handle.join();
        }

        for conn in core.live.lock().unwrap().values() {
            conn.shutdown();
        }

        let handlers = std::mem::take(&mut *core.handlers.lock().unwrap());

        // Connections still waiting for their init packet are not live yet
        for handler in handlers.iter() {
            handler.conn.shutdown();
        }

        for handler in handlers {
            core.finish_handler(handler);
        }

        if let Some(fd) = listen_fd {
            core.sockets.close(fd);
        }

        core.live.lock().unwrap().clear();
        core.ids.lock().unwrap().clear();

        log::info!("server on {} stopped", core.config.local_addr());
    }

    pub fn state(&self) -> State {
        *self.core.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Number of connections currently forwarding packets.
    pub fn client_count(&self) -> usize {
        self.core.live.lock().unwrap().len()
    }

    /// Ids of all registered connections, in ascending order.
    pub fn connected_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.core.ids.lock().unwrap().values().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }
}
