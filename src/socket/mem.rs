use std::collections::{HashMap, VecDeque};
use std::net;
use std::sync::{Condvar, Mutex, MutexGuard};

use rand::Rng;

use super::{Fd, Shutdown, SockOpt, SocketApi};

enum SockState {
    Fresh,
    Bound(u16),
    Listening {
        port: u16,
        backlog: usize,
        pending: VecDeque<Fd>,
    },
    Connected {
        peer: Fd,
    },
}

struct Sock {
    state: SockState,
    // Bytes written by the peer and not yet read
    inbox: VecDeque<u8>,
    // Set once the peer has closed or shut down its write side
    read_closed: bool,
    // Set once this side has been shut down
    shut: bool,
}

impl Sock {
    fn new(state: SockState) -> Self {
        Self {
            state,
            inbox: VecDeque::new(),
            read_closed: false,
            shut: false,
        }
    }
}

#[derive(Default)]
struct Faults {
    // Number of sends that still succeed before one is failed
    fail_after: Option<usize>,
    // Number of sends that still complete before one writes only half its buffer
    short_after: Option<usize>,
    // Probability that a send is silently discarded
    loss: f64,
    // Total number of send calls observed
    sends: usize,
}

struct NetState {
    next_fd: Fd,
    socks: HashMap<Fd, Sock>,
    ports: HashMap<u16, Fd>,
    faults: Faults,
}

/// In-memory [`SocketApi`] implementation. Sockets only reach other sockets created by the same
/// `MemNetwork`; ports are a flat namespace and addresses are otherwise ignored.
///
/// Faults can be injected to exercise error paths deterministically.
pub struct MemNetwork {
    state: Mutex<NetState>,
    changed: Condvar,
}

impl Default for MemNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemNetwork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NetState {
                next_fd: 3,
                socks: HashMap::new(),
                ports: HashMap::new(),
                faults: Default::default(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    /// Lets `n` further sends succeed, then fails the next one with `EPIPE`.
    pub fn fail_send_after(&self, n: usize) {
        self.lock().faults.fail_after = Some(n);
    }

    /// Lets `n` further sends complete, then makes the next one write only the first half of its
    /// buffer.
    pub fn short_send_after(&self, n: usize) {
        self.lock().faults.short_after = Some(n);
    }

    /// Discards each subsequent send with probability `p` while still reporting success.
    pub fn set_loss(&self, p: f64) {
        self.lock().faults.loss = p.clamp(0.0, 1.0);
    }

    /// Total number of send calls made on this network, including failed and dropped ones.
    pub fn send_count(&self) -> usize {
        self.lock().faults.sends
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.lock().socks.len()
    }
}

impl NetState {
    fn alloc(&mut self, sock: Sock) -> Fd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.socks.insert(fd, sock);
        fd
    }

    fn mark_read_closed(&mut self, fd: Fd) {
        if let Some(sock) = self.socks.get_mut(&fd) {
            sock.read_closed = true;
        }
    }
}

impl SocketApi for MemNetwork {
    fn socket(&self) -> Fd {
        self.lock().alloc(Sock::new(SockState::Fresh))
    }

    fn setsockopt(&self, fd: Fd, _opt: SockOpt, _value: bool) -> i32 {
        if self.lock().socks.contains_key(&fd) {
            0
        } else {
            -libc::EBADF
        }
    }

    fn bind(&self, fd: Fd, addr: &net::SocketAddrV4) -> i32 {
        let mut guard = self.lock();
        let state = &mut *guard;

        let port = addr.port();

        if state.ports.contains_key(&port) {
            return -libc::EADDRINUSE;
        }

        match state.socks.get_mut(&fd) {
            Some(sock) => match sock.state {
                SockState::Fresh => {
                    sock.state = SockState::Bound(port);
                    state.ports.insert(port, fd);
                    0
                }
                _ => -libc::EINVAL,
            },
            None => -libc::EBADF,
        }
    }

    fn listen(&self, fd: Fd, backlog: i32) -> i32 {
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.socks.get_mut(&fd) {
            Some(sock) => match sock.state {
                SockState::Bound(port) => {
                    sock.state = SockState::Listening {
                        port,
                        backlog: backlog.max(1) as usize,
                        pending: VecDeque::new(),
                    };
                    0
                }
                _ => -libc::EINVAL,
            },
            None => -libc::EBADF,
        }
    }

    fn accept(&self, fd: Fd) -> Fd {
        let mut state = self.lock();

        loop {
            match state.socks.get_mut(&fd) {
                None => return -libc::EBADF,
                Some(sock) => {
                    if sock.shut {
                        return -libc::EINVAL;
                    }

                    match &mut sock.state {
                        SockState::Listening { pending, .. } => {
                            if let Some(conn_fd) = pending.pop_front() {
                                return conn_fd;
                            }
                        }
                        _ => return -libc::EINVAL,
                    }
                }
            }

            state = self.changed.wait(state).unwrap();
        }
    }

    fn connect(&self, fd: Fd, addr: &net::SocketAddrV4) -> i32 {
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.socks.get(&fd) {
            None => return -libc::EBADF,
            Some(sock) => match sock.state {
                SockState::Fresh | SockState::Bound(_) => (),
                _ => return -libc::EISCONN,
            },
        }

        let listener_fd = match state.ports.get(&addr.port()) {
            Some(&listener_fd) => listener_fd,
            None => return -libc::ECONNREFUSED,
        };

        let accepting = match state.socks.get(&listener_fd) {
            Some(Sock {
                state: SockState::Listening {
                    backlog, pending, ..
                },
                shut: false,
                ..
            }) => pending.len() < *backlog,
            _ => false,
        };

        if !accepting {
            return -libc::ECONNREFUSED;
        }

        let conn_fd = state.alloc(Sock::new(SockState::Connected { peer: fd }));

        if let Some(sock) = state.socks.get_mut(&fd) {
            sock.state = SockState::Connected { peer: conn_fd };
        }

        if let Some(Sock {
            state: SockState::Listening { pending, .. },
            ..
        }) = state.socks.get_mut(&listener_fd)
        {
            pending.push_back(conn_fd);
        }

        self.changed.notify_all();

        0
    }

    fn send(&self, fd: Fd, buf: &[u8]) -> isize {
        let mut guard = self.lock();
        let state = &mut *guard;

        state.faults.sends += 1;

        if let Some(n) = state.faults.fail_after {
            if n == 0 {
                state.faults.fail_after = None;
                return -(libc::EPIPE as isize);
            }
            state.faults.fail_after = Some(n - 1);
        }

        let len = match state.faults.short_after {
            Some(0) => {
                state.faults.short_after = None;
                buf.len() / 2
            }
            Some(n) => {
                state.faults.short_after = Some(n - 1);
                buf.len()
            }
            None => buf.len(),
        };

        let peer = match state.socks.get(&fd) {
            None => return -(libc::EBADF as isize),
            Some(sock) if sock.shut => return -(libc::EPIPE as isize),
            Some(sock) => match sock.state {
                SockState::Connected { peer } => peer,
                _ => return -(libc::ENOTCONN as isize),
            },
        };

        if state.faults.loss > 0.0 && rand::thread_rng().gen_bool(state.faults.loss) {
            return len as isize;
        }

        match state.socks.get_mut(&peer) {
            Some(peer_sock) if !peer_sock.shut => {
                peer_sock.inbox.extend(buf[..len].iter().copied());
            }
            _ => return -(libc::EPIPE as isize),
        }

        self.changed.notify_all();

        len as isize
    }

    fn recv(&self, fd: Fd, buf: &mut [u8]) -> isize {
        let mut state = self.lock();

        loop {
            match state.socks.get_mut(&fd) {
                None => return -(libc::EBADF as isize),
                Some(sock) => {
                    if !sock.inbox.is_empty() {
                        let n = buf.len().min(sock.inbox.len());

                        for (dst, src) in buf.iter_mut().zip(sock.inbox.drain(..n)) {
                            *dst = src;
                        }

                        return n as isize;
                    }

                    if sock.read_closed || sock.shut {
                        return 0;
                    }

                    if !matches!(sock.state, SockState::Connected { .. }) {
                        return -(libc::ENOTCONN as isize);
                    }
                }
            }

            state = self.changed.wait(state).unwrap();
        }
    }

    fn shutdown(&self, fd: Fd, how: Shutdown) -> i32 {
        let mut guard = self.lock();
        let state = &mut *guard;

        let peer = match state.socks.get_mut(&fd) {
            None => return -libc::EBADF,
            Some(sock) => {
                if how != Shutdown::Write {
                    sock.shut = true;
                }

                match sock.state {
                    SockState::Connected { peer } => Some(peer),
                    _ => None,
                }
            }
        };

        if how != Shutdown::Read {
            if let Some(peer) = peer {
                state.mark_read_closed(peer);
            }
        }

        self.changed.notify_all();

        0
    }

    fn close(&self, fd: Fd) -> i32 {
        let mut guard = self.lock();
        let state = &mut *guard;

        let sock = match state.socks.remove(&fd) {
            Some(sock) => sock,
            None => return -libc::EBADF,
        };

        match sock.state {
            SockState::Fresh => (),
            SockState::Bound(port) => {
                state.ports.remove(&port);
            }
            SockState::Listening { port, pending, .. } => {
                state.ports.remove(&port);

                // Unaccepted connections are reset
                for conn_fd in pending {
                    if let Some(conn) = state.socks.remove(&conn_fd) {
                        if let SockState::Connected { peer } = conn.state {
                            state.mark_read_closed(peer);
                        }
                    }
                }
            }
            SockState::Connected { peer } => {
                state.mark_read_closed(peer);
            }
        }

        self.changed.notify_all();

        0
    }
}
