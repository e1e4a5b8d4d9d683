//! Descriptor redirection.
//!
//! Native code and child processes write straight to fd 1/2, bypassing the
//! stream object. `FdWatch` swaps such a descriptor for the write end of a
//! pipe and runs a reader thread that forwards what arrives into the stream
//! and re-emits the raw bytes to a duplicate of the original descriptor, so a
//! real terminal still sees the output.

use crate::diag::write_all_fd;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Set to any value to never redirect descriptors, e.g. under a harness that
/// already captures them.
pub const DISABLE_ENV: &str = "IOPUB_DISABLE_FD_WATCH";

pub struct FdWatch {
    fd: RawFd,
    original: Arc<OwnedFd>,
    should_watch: Arc<AtomicBool>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

/// Whether descriptor redirection may be engaged in this process.
pub fn watch_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos")) && std::env::var_os(DISABLE_ENV).is_none()
}

impl FdWatch {
    /// Redirect `fd` into a pipe and start forwarding its text to `sink`.
    pub fn start<F>(fd: RawFd, chunk: usize, sink: F) -> io::Result<Self>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid 2-element array.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both ends were just created by pipe() and are owned here.
        let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(read_end.as_raw_fd())?;

        // SAFETY: fd is a descriptor the caller asked us to watch.
        let original = unsafe { libc::dup(fd) };
        if original < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: original was just produced by dup().
        let original = Arc::new(unsafe { OwnedFd::from_raw_fd(original) });
        set_cloexec(original.as_raw_fd())?;

        // SAFETY: both descriptors are valid; dup2 atomically replaces fd.
        if unsafe { libc::dup2(write_end.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // fd now holds the only write end.
        drop(write_end);

        let should_watch = Arc::new(AtomicBool::new(true));
        let spawned = std::thread::Builder::new()
            .name(format!("iopub-watch-fd{fd}"))
            .spawn({
                let original = Arc::clone(&original);
                let should_watch = Arc::clone(&should_watch);
                move || watch_loop(File::from(read_end), &original, chunk.max(1), &should_watch, sink)
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                restore(fd, &original);
                return Err(e);
            }
        };

        tracing::debug!(fd, "descriptor watch started");
        Ok(Self {
            fd,
            original,
            should_watch,
            thread: Some(thread),
        })
    }

    /// Duplicate of the descriptor as it was before redirection.
    pub fn original_fd(&self) -> RawFd {
        self.original.as_raw_fd()
    }

    pub fn watched_fd(&self) -> RawFd {
        self.fd
    }

    /// Stop forwarding and put the original descriptor back.
    ///
    /// Restoring drops our pipe write end. The reader forwards whatever is
    /// still buffered in the pipe, then exits at end-of-file or, if another
    /// process still holds the write end, once the pipe is empty. Returns
    /// whatever error the reader hit.
    pub fn stop(mut self) -> io::Result<()> {
        restore(self.fd, &self.original);
        self.should_watch.store(false, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("descriptor watch thread panicked")),
        }
    }
}

impl Drop for FdWatch {
    fn drop(&mut self) {
        if self.thread.take().is_some() {
            // Detach: the reader exits on its own once the pipe closes.
            self.should_watch.store(false, Ordering::SeqCst);
            restore(self.fd, &self.original);
        }
    }
}

fn restore(fd: RawFd, original: &OwnedFd) {
    // SAFETY: both descriptors are valid for the lifetime of the watch.
    if unsafe { libc::dup2(original.as_raw_fd(), fd) } < 0 {
        tracing::warn!(fd, error = %io::Error::last_os_error(), "failed to restore descriptor");
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid descriptor owned by the caller.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn watch_loop<F>(
    mut pipe: File,
    original: &OwnedFd,
    chunk: usize,
    should_watch: &AtomicBool,
    mut sink: F,
) -> io::Result<()>
where
    F: FnMut(&str),
{
    let mut buf = vec![0u8; chunk];
    let mut pending = Vec::new();
    loop {
        // Once stopped, keep forwarding only what is already in the pipe.
        if !should_watch.load(Ordering::SeqCst) && !readable_now(pipe.as_raw_fd()) {
            break;
        }
        let n = match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_text(&mut pending);
        if !text.is_empty() {
            sink(&text);
        }
        write_all_fd(original.as_raw_fd(), &buf[..n])?;
    }
    if !pending.is_empty() {
        sink(&String::from_utf8_lossy(&pending));
    }
    Ok(())
}

/// Whether a read on `fd` would return without blocking (data or EOF).
fn readable_now(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a single valid pollfd; a zero timeout never blocks.
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return ret > 0 && pfd.revents != 0;
    }
}

/// Take the decodable prefix of `pending`, leaving an incomplete trailing
/// UTF-8 sequence for the next read.
fn take_text(pending: &mut Vec<u8>) -> String {
    let end = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..end]).into_owned();
    pending.drain(..end);
    text
}

#[cfg(test)]
#[path = "../../tests/unit/stream/watch.rs"]
mod tests;
