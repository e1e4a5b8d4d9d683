//! Last-resort diagnostics.
//!
//! When the captured streams themselves misbehave they cannot be used to
//! report it. Reports go to a duplicate of the process's stderr taken before
//! any descriptor redirection, and are mirrored to `tracing`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

static ORIGINAL_STDERR: OnceLock<RawFd> = OnceLock::new();

/// Duplicate fd 2 once, before anything redirects it.
pub fn capture_original_stderr() -> RawFd {
    *ORIGINAL_STDERR.get_or_init(|| {
        // SAFETY: dup of the process's stderr; -1 on failure is handled by callers.
        let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
        if fd >= 0 {
            // SAFETY: fd was just produced by dup().
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        fd
    })
}

pub fn report(msg: &str) {
    tracing::warn!(target: "iopub::diag", "{msg}");
    let fd = ORIGINAL_STDERR
        .get()
        .copied()
        .filter(|fd| *fd >= 0)
        .unwrap_or(libc::STDERR_FILENO);
    let line = format!("{msg}\n");
    let _ = write_all_fd(fd, line.as_bytes());
}

pub(crate) fn write_all_fd(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        // SAFETY: bytes is a valid slice; fd validity is the caller's contract.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}
