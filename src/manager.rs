//! The router: a single [`Server`] whose packet callback forwards every packet to its
//! destination, or to every other connection for broadcasts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use super::error::Result;
use super::frame::Packet;
use super::server::{self, Server};
use super::socket::SocketApi;
use super::NodeId;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const SIGNAL_POLL: time::Duration = time::Duration::from_millis(100);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Routes SIGINT and SIGTERM to [`run_until_signal`].
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

/// True once SIGINT or SIGTERM has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// Collision handling between two packets contending for the bus. Not consulted by the router's
/// dispatch.
pub trait Arbitration: Send + Sync {
    /// Returns true if `a` and `b` collide.
    fn detect_collision(&self, a: &Packet, b: &Packet) -> bool;

    /// Returns the packet that wins arbitration. The lower source id has priority.
    fn priority<'a>(&self, a: &'a Packet, b: &'a Packet) -> &'a Packet {
        if b.src < a.src {
            b
        } else {
            a
        }
    }
}

/// Never reports a collision.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoArbitration;

impl Arbitration for NoArbitration {
    fn detect_collision(&self, _a: &Packet, _b: &Packet) -> bool {
        false
    }
}

/// Delivers one packet. Failures are logged and otherwise ignored.
pub fn route(server: &Server, packet: Packet) {
    let result = if packet.is_broadcast() {
        server.send_broadcast(&packet)
    } else {
        server.send_destination(&packet)
    };

    if let Err(err) = result {
        log::warn!(
            "failed to route packet {}->{} psn {}/{}: {}",
            packet.src,
            packet.dst,
            packet.psn,
            packet.tps,
            err
        );
    }
}

pub struct Manager {
    server: Server,
    arbitration: Box<dyn Arbitration>,
}

impl Manager {
    /// Starts a router listening according to `config`.
    pub fn start(config: server::Config, sockets: Arc<dyn SocketApi>) -> Result<Arc<Self>> {
        Self::start_with_arbitration(config, sockets, Box::new(NoArbitration))
    }

    pub fn start_with_arbitration(
        config: server::Config,
        sockets: Arc<dyn SocketApi>,
        arbitration: Box<dyn Arbitration>,
    ) -> Result<Arc<Self>> {
        let server = Server::builder()
            .config(config)
            .sockets(sockets)
            .on_packet(route)
            .build()?;

        server.start_connection()?;

        Ok(Arc::new(Self {
            server,
            arbitration,
        }))
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn arbitration(&self) -> &dyn Arbitration {
        &*self.arbitration
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.server.connected_ids()
    }

    /// Blocks until SIGINT or SIGTERM is received, or the server stops on its own, then stops
    /// the server.
    pub fn run_until_signal(&self) {
        while !shutdown_requested() && self.server.is_running() {
            thread::sleep(SIGNAL_POLL);
        }

        log::info!("shutting down router");

        self.stop();
    }

    pub fn stop(&self) {
        self.server.stop_server();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}
