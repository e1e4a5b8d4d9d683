//! Self-pipe wake channel for the worker's event loop.
//!
//! The worker blocks in `libc::poll()` on `WakeReceiver::raw_fd()`. Producer
//! threads signal through their own `WakeEndpoint`, a `dup` of the pipe's write
//! end cached in thread-local storage; it is closed when the thread exits. The
//! channel keeps only weak references to endpoints, so `release_all` can close
//! whatever is still open once the worker thread has been joined.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENDPOINTS: RefCell<FxHashMap<u64, Arc<WakeEndpoint>>> =
        RefCell::new(FxHashMap::default());
}

/// RAII wrapper for a raw fd that closes on drop.
struct OwnedFd(RawFd);

impl Drop for OwnedFd {
    fn drop(&mut self) {
        // SAFETY: fd is a valid pipe end created by pipe().
        unsafe {
            libc::close(self.0);
        }
    }
}

/// One thread's sending end. Payload content is never interpreted, only its
/// arrival matters.
#[derive(Debug)]
pub struct WakeEndpoint {
    fd: AtomicI32,
}

impl WakeEndpoint {
    /// Write a single byte to wake the polling thread.
    /// Errors (EAGAIN, EPIPE) are ignored: a full pipe already guarantees a
    /// pending wake-up, and a released endpoint has nobody left to wake.
    pub fn wake(&self) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        // SAFETY: fd is a valid non-blocking pipe write end; buf is a valid 1-byte slice.
        unsafe {
            libc::write(fd, [0u8].as_ptr().cast(), 1);
        }
    }

    pub fn is_released(&self) -> bool {
        self.fd.load(Ordering::Acquire) < 0
    }

    fn release(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was produced by dup() and is closed exactly once thanks to the swap.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl Drop for WakeEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// Shared sending side: hands out per-thread endpoints.
pub struct WakeChannel {
    id: u64,
    write_fd: OwnedFd,
    endpoints: Mutex<Vec<Weak<WakeEndpoint>>>,
}

/// Read end of the wake pipe. Exposes `raw_fd()` for use with `libc::poll()`
/// and `drain()` to consume all pending wake bytes.
pub struct WakeReceiver {
    fd: OwnedFd,
}

/// Create a wake channel.
///
/// Both ends are non-blocking: `drain()` never blocks the worker and `wake()`
/// never blocks a producer. Both are close-on-exec so spawned commands do not
/// inherit them.
pub fn wake_channel() -> io::Result<(WakeChannel, WakeReceiver)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid 2-element array.
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    let read_fd = OwnedFd(fds[0]);
    let write_fd = OwnedFd(fds[1]);

    set_nonblocking_cloexec(read_fd.0)?;
    set_nonblocking_cloexec(write_fd.0)?;

    Ok((
        WakeChannel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            write_fd,
            endpoints: Mutex::new(Vec::new()),
        },
        WakeReceiver { fd: read_fd },
    ))
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl WakeChannel {
    /// The calling thread's endpoint, created on first use.
    ///
    /// A cached endpoint that was released by `release_all` is replaced, so a
    /// worker can be restarted after `stop()`.
    pub fn endpoint(&self) -> io::Result<Arc<WakeEndpoint>> {
        let cached = ENDPOINTS
            .try_with(|map| map.borrow().get(&self.id).cloned())
            .ok()
            .flatten();
        if let Some(endpoint) = cached.filter(|ep| !ep.is_released()) {
            return Ok(endpoint);
        }

        let endpoint = self.new_endpoint()?;
        // Thread-local storage may already be torn down while the thread is
        // exiting; the endpoint is then used once and dropped by the caller.
        let _ = ENDPOINTS.try_with(|map| {
            map.borrow_mut().insert(self.id, endpoint.clone());
        });
        Ok(endpoint)
    }

    /// Wake the receiver from the calling thread.
    pub fn wake(&self) -> io::Result<()> {
        self.endpoint()?.wake();
        Ok(())
    }

    fn new_endpoint(&self) -> io::Result<Arc<WakeEndpoint>> {
        // SAFETY: write_fd is the valid write end of our pipe.
        let fd = unsafe { libc::dup(self.write_fd.0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just produced by dup().
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is ours and not shared yet.
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }

        let endpoint = Arc::new(WakeEndpoint {
            fd: AtomicI32::new(fd),
        });
        let mut registry = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&endpoint));
        Ok(endpoint)
    }

    /// Close every endpoint that is still open, in whichever thread created it.
    ///
    /// Only call this after the worker thread has been joined: endpoints may be
    /// used by other threads only while the worker is alive.
    pub fn release_all(&self) -> usize {
        let mut registry = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut released = 0;
        for weak in registry.drain(..) {
            if let Some(endpoint) = weak.upgrade() {
                if !endpoint.is_released() {
                    endpoint.release();
                    released += 1;
                }
            }
        }
        released
    }

    /// Number of endpoints still alive (held by some thread).
    pub fn live_endpoints(&self) -> usize {
        let registry = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|ep| !ep.is_released())
            .count()
    }
}

impl WakeReceiver {
    /// Return the raw fd for use with `libc::poll()`.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.0
    }

    /// Drain all pending bytes from the pipe (non-blocking).
    /// Returns true if at least one wake-up was pending.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut woke = false;
        loop {
            // SAFETY: fd is a valid non-blocking pipe read end; buf is valid.
            let n = unsafe { libc::read(self.fd.0, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            woke = true;
        }
        woke
    }
}

#[cfg(test)]
#[path = "../tests/unit/wake.rs"]
mod tests;
