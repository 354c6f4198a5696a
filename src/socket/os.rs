use std::io;
use std::mem;
use std::net;
use std::ptr;

use libc::c_int;

use super::{Fd, Shutdown, SockOpt, SocketApi};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

/// [`SocketApi`] backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsSockets;

fn errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

fn check(ret: c_int) -> i32 {
    if ret < 0 {
        -errno()
    } else {
        ret
    }
}

fn check_size(ret: isize) -> isize {
    if ret < 0 {
        -(errno() as isize)
    } else {
        ret
    }
}

/// Repeats a call for as long as it is interrupted by a signal.
fn retry_eintr<T, F>(mut f: F) -> T
where
    T: Copy + PartialOrd + Default,
    F: FnMut() -> T,
{
    loop {
        let ret = f();

        if ret < T::default() && errno() == libc::EINTR {
            continue;
        }

        return ret;
    }
}

fn sockaddr_in(addr: &net::SocketAddrV4) -> libc::sockaddr_in {
    // sockaddr_in carries platform-specific padding (and sin_len on BSDs)
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };

    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };

    sa
}

impl SocketApi for OsSockets {
    fn socket(&self) -> Fd {
        check(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })
    }

    fn setsockopt(&self, fd: Fd, opt: SockOpt, value: bool) -> i32 {
        let name = match opt {
            SockOpt::ReuseAddr => libc::SO_REUSEADDR,
            SockOpt::ReusePort => libc::SO_REUSEPORT,
        };

        let value = value as c_int;

        check(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                &value as *const c_int as *const libc::c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        })
    }

    fn bind(&self, fd: Fd, addr: &net::SocketAddrV4) -> i32 {
        let sa = sockaddr_in(addr);

        check(unsafe {
            libc::bind(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })
    }

    fn listen(&self, fd: Fd, backlog: i32) -> i32 {
        check(unsafe { libc::listen(fd, backlog) })
    }

    fn accept(&self, fd: Fd) -> Fd {
        check(retry_eintr(|| unsafe {
            libc::accept(fd, ptr::null_mut(), ptr::null_mut())
        }))
    }

    fn connect(&self, fd: Fd, addr: &net::SocketAddrV4) -> i32 {
        let sa = sockaddr_in(addr);

        check(unsafe {
            libc::connect(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })
    }

    fn send(&self, fd: Fd, buf: &[u8]) -> isize {
        check_size(retry_eintr(|| unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS)
        }))
    }

    fn recv(&self, fd: Fd, buf: &mut [u8]) -> isize {
        check_size(retry_eintr(|| unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        }))
    }

    fn shutdown(&self, fd: Fd, how: Shutdown) -> i32 {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };

        check(unsafe { libc::shutdown(fd, how) })
    }

    fn close(&self, fd: Fd) -> i32 {
        check(unsafe { libc::close(fd) })
    }
}
