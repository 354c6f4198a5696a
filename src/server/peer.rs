use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::Result;
use crate::frame::{self, Packet};
use crate::socket::{self, Fd, SocketApi};
use crate::NodeId;

use super::{Server, ServerCore};

/// An accepted connection. The descriptor is closed when the last reference is dropped, so a
/// writer holding one never races the close.
pub(super) struct Connection {
    pub fd: Fd,
    sockets: Arc<dyn SocketApi>,
    // Serializes unicast and broadcast writes to this connection
    pub(super) writer: Mutex<()>,
}

impl Connection {
    pub fn new(fd: Fd, sockets: Arc<dyn SocketApi>) -> Self {
        Self {
            fd,
            sockets,
            writer: Mutex::new(()),
        }
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        let _writer = self.writer.lock().unwrap();
        socket::send_packet(&*self.sockets, self.fd, packet)
    }

    pub fn shutdown(&self) {
        self.sockets.shutdown(self.fd, socket::Shutdown::Both);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.sockets.close(self.fd);
    }
}

/// A connection's handler thread and the connection it reads.
pub(super) struct Handler {
    pub conn: Arc<Connection>,
    pub thread: thread::JoinHandle<()>,
}

pub(super) fn spawn(core: Arc<ServerCore>, conn: Arc<Connection>) -> io::Result<Handler> {
    let thread_conn = Arc::clone(&conn);

    let thread = thread::Builder::new()
        .name(format!("vbus-peer-{}", conn.fd))
        .spawn(move || run(core, thread_conn))?;

    Ok(Handler { conn, thread })
}

fn read_packet(core: &ServerCore, fd: Fd) -> Option<Result<Packet>> {
    match socket::recv_packet(&*core.sockets, fd) {
        Ok(Some(bytes)) => Some(frame::serial::read_packet(&bytes)),
        Ok(None) => None,
        Err(err) => {
            if core.is_running() {
                log::warn!("fd {}: {}", fd, err);
            }
            None
        }
    }
}

/// Reads the init packet and registers its id. Returns `None` if the connection must be
/// dropped.
fn handshake(core: &ServerCore, conn: &Arc<Connection>) -> Option<NodeId> {
    let fd = conn.fd;

    let packet = match read_packet(core, fd)? {
        Ok(packet) => packet,
        Err(err) => {
            log::warn!("fd {}: invalid init packet: {}", fd, err);
            return None;
        }
    };

    if !packet.is_init() {
        log::warn!("fd {}: first packet is not an init packet", fd);
        return None;
    }

    let id = packet.src;

    if id == 0 {
        log::warn!("fd {}: id 0 is reserved", fd);
        return None;
    }

    {
        let mut ids = core.ids.lock().unwrap();

        if ids.values().any(|&registered| registered == id) {
            log::warn!("fd {}: id {} is already registered", fd, id);
            return None;
        }

        ids.insert(fd, id);
    }

    core.live.lock().unwrap().insert(fd, Arc::clone(conn));

    Some(id)
}

fn unregister(core: &ServerCore, fd: Fd) {
    core.live.lock().unwrap().remove(&fd);
    core.ids.lock().unwrap().remove(&fd);
}

fn run(core: Arc<ServerCore>, conn: Arc<Connection>) {
    let fd = conn.fd;

    let id = match handshake(&core, &conn) {
        Some(id) => id,
        None => {
            conn.shutdown();
            return;
        }
    };

    log::info!("node {} registered on fd {}", id, fd);

    let server = Server {
        core: Arc::clone(&core),
    };

    while let Some(result) = read_packet(&core, fd) {
        match result {
            Ok(packet) if packet.is_init() => {
                log::debug!("node {}: ignoring repeated init packet", id);
            }
            Ok(packet) if packet.src != id => {
                log::warn!(
                    "node {}: dropping packet claiming source {}",
                    id,
                    packet.src
                );
            }
            Ok(packet) => {
                log::trace!(
                    "node {} -> {}->{} psn {}/{}",
                    id,
                    packet.src,
                    packet.dst,
                    packet.psn,
                    packet.tps
                );
                (core.on_packet)(&server, packet);
            }
            Err(err) => {
                log::debug!("node {}: dropping packet: {}", id, err);
            }
        }
    }

    unregister(&core, fd);
    conn.shutdown();

    log::info!("node {} disconnected", id);
}
