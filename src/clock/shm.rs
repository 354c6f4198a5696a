use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::ptr;
use std::thread;
use std::time;

const MODE: libc::mode_t = 0o600;

// Attachers wait this long for the creator to size the segment
const SIZE_WAIT: time::Duration = time::Duration::from_secs(1);
const SIZE_POLL: time::Duration = time::Duration::from_millis(1);

/// A named POSIX shared-memory segment mapped into this process.
pub struct Segment {
    name: CString,
    fd: libc::c_int,
    ptr: *mut libc::c_void,
    len: usize,
    // True if this process created the segment
    created: bool,
}

// The mapping is plain shared memory; synchronisation is the caller's concern
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

fn segment_size(fd: libc::c_int) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };

    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        return Err(last_error());
    }

    Ok(stat.st_size.max(0) as usize)
}

impl Segment {
    /// Creates the segment exclusively, or attaches to it if it already exists. A created
    /// segment is zero-filled.
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        let name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let (fd, created) = loop {
            let fd = unsafe {
                libc::shm_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    MODE,
                )
            };

            if fd >= 0 {
                break (fd, true);
            }

            let err = last_error();

            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }

            let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, MODE) };

            if fd >= 0 {
                break (fd, false);
            }

            let err = last_error();

            // Unlinked between the two calls
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        };

        let sized = if created {
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
                Err(last_error())
            } else {
                Ok(())
            }
        } else {
            wait_for_size(fd, len)
        };

        if let Err(err) = sized {
            unsafe {
                libc::close(fd);

                if created {
                    libc::shm_unlink(name.as_ptr());
                }
            }
            return Err(err);
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = last_error();

            unsafe {
                libc::close(fd);

                if created {
                    libc::shm_unlink(name.as_ptr());
                }
            }
            return Err(err);
        }

        Ok(Self {
            name,
            fd,
            ptr,
            len,
            created,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    /// Unmaps the segment and closes its descriptor. The segment itself persists.
    pub fn unmap(&mut self) {
        if self.ptr.is_null() {
            return;
        }

        unsafe {
            libc::munmap(self.ptr, self.len);
            libc::close(self.fd);
        }

        self.ptr = ptr::null_mut();
        self.fd = -1;
    }

    pub fn is_mapped(&self) -> bool {
        !self.ptr.is_null()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.unmap();
    }
}

fn wait_for_size(fd: libc::c_int, len: usize) -> io::Result<()> {
    let begin = time::Instant::now();

    while segment_size(fd)? < len {
        if begin.elapsed() >= SIZE_WAIT {
            return Err(io::ErrorKind::TimedOut.into());
        }

        thread::sleep(SIZE_POLL);
    }

    Ok(())
}

/// Removes a named segment. Existing mappings remain valid. A missing segment is not an error.
pub fn unlink(name: &CStr) -> io::Result<()> {
    if unsafe { libc::shm_unlink(name.as_ptr()) } < 0 {
        let err = last_error();

        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
    }

    Ok(())
}
