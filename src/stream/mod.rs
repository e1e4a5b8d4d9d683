//! Text streams published over the bus.
//!
//! `OutStream` may be written from any number of threads without blocking.
//! Text is appended to the accumulator by tasks on the worker thread only,
//! and flushed into one `stream` message per flush.

mod error;
pub mod watch;

pub use error::StreamError;

use crate::config::IoPubConfig;
use crate::diag;
use crate::envelope::{extract_header, Envelope, StreamContent};
use crate::worker::Worker;
use serde_json::{json, Value};
use std::cell::Cell;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use watch::FdWatch;

thread_local! {
    static NO_FLUSH_WAIT: Cell<u32> = const { Cell::new(0) };
}

/// Run `f` with `flush()` on this thread scheduling without waiting for the
/// worker. Use it where waiting could deadlock, e.g. while holding a lock a
/// scheduled task may need.
pub fn without_flush_wait<R>(f: impl FnOnce() -> R) -> R {
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            NO_FLUSH_WAIT.with(|depth| depth.set(depth.get().saturating_sub(1)));
        }
    }
    NO_FLUSH_WAIT.with(|depth| depth.set(depth.get() + 1));
    let _reset = Reset;
    f()
}

fn flush_wait_allowed() -> bool {
    NO_FLUSH_WAIT
        .try_with(|depth| depth.get() == 0)
        .unwrap_or(false)
}

type Echo = Mutex<Box<dyn Write + Send>>;

pub struct OutStream {
    inner: Arc<StreamInner>,
    watch: Mutex<Option<FdWatch>>,
}

struct StreamInner {
    name: String,
    topic: Vec<u8>,
    /// `None` once closed.
    worker: RwLock<Option<Worker>>,
    /// Only locked from tasks running on the worker thread (or inline when
    /// the worker is gone, e.g. after a fork).
    buffer: Mutex<String>,
    parent: Mutex<Value>,
    envelope: Arc<dyn Envelope>,
    echo: Option<Echo>,
    flush_pending: AtomicBool,
    subprocess_flush_pending: AtomicBool,
    master_pid: u32,
    flush_interval: Duration,
    flush_timeout: Duration,
    is_atty: AtomicBool,
}

impl OutStream {
    /// Create the stream `name` (e.g. "stdout") publishing through `worker`.
    ///
    /// With `config.watch_fd`, "stdout"/"stderr" also capture writes made
    /// directly to fd 1/2 where the platform allows it.
    pub fn new(
        name: &str,
        worker: &Worker,
        envelope: Arc<dyn Envelope>,
        config: &IoPubConfig,
    ) -> io::Result<Self> {
        Self::build(name, worker, envelope, config, None)
    }

    /// Like `new`, mirroring every write and flush to `echo`.
    pub fn with_echo(
        name: &str,
        worker: &Worker,
        envelope: Arc<dyn Envelope>,
        config: &IoPubConfig,
        echo: Box<dyn Write + Send>,
    ) -> io::Result<Self> {
        Self::build(name, worker, envelope, config, Some(echo))
    }

    fn build(
        name: &str,
        worker: &Worker,
        envelope: Arc<dyn Envelope>,
        config: &IoPubConfig,
        echo: Option<Box<dyn Write + Send>>,
    ) -> io::Result<Self> {
        diag::capture_original_stderr();
        let stream = Self {
            inner: Arc::new(StreamInner {
                name: name.to_string(),
                topic: format!("stream.{name}").into_bytes(),
                worker: RwLock::new(Some(worker.clone())),
                buffer: Mutex::new(String::new()),
                parent: Mutex::new(json!({})),
                envelope,
                echo: echo.map(Mutex::new),
                flush_pending: AtomicBool::new(false),
                subprocess_flush_pending: AtomicBool::new(false),
                master_pid: std::process::id(),
                flush_interval: config.flush_interval(),
                flush_timeout: config.flush_timeout(),
                is_atty: AtomicBool::new(false),
            }),
            watch: Mutex::new(None),
        };

        if config.watch_fd && watch::watch_supported() {
            if let Some(fd) = std_fd(name) {
                stream.watch_descriptor(fd, config.watch_chunk)?;
            }
        }
        Ok(stream)
    }

    /// Mark the stream as terminal-capable (colors etc.).
    pub fn set_atty(&self, is_atty: bool) {
        self.inner.is_atty.store(is_atty, Ordering::Relaxed);
    }

    /// Capture writes made directly to `fd`, forwarding them into this stream.
    pub fn watch_descriptor(&self, fd: RawFd, chunk: usize) -> io::Result<()> {
        let mut slot = lock(&self.watch);
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "stream already watches a descriptor",
            ));
        }
        let inner = Arc::clone(&self.inner);
        let watch = FdWatch::start(fd, chunk, move |text| {
            // The stream may be closing underneath the watcher.
            if let Err(e) = StreamInner::write_str(&inner, text) {
                tracing::debug!(
                    stream = %inner.name,
                    bytes = text.len(),
                    error = %e,
                    "dropping descriptor output"
                );
            }
        })?;
        *slot = Some(watch);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bus topic, `stream.<name>`.
    pub fn topic(&self) -> &[u8] {
        &self.inner.topic
    }

    pub fn is_atty(&self) -> bool {
        self.inner.is_atty.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> bool {
        self.inner.worker().is_none()
    }

    /// The original descriptor behind a watched stream, for code that wants to
    /// write to the real terminal.
    pub fn fileno(&self) -> io::Result<RawFd> {
        lock(&self.watch)
            .as_ref()
            .map(FdWatch::original_fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "fileno"))
    }

    /// Parent header attached to subsequent messages.
    pub fn set_parent(&self, parent: &Value) {
        *lock(&self.inner.parent) = extract_header(parent);
    }

    /// Queue `text` for publishing. Never blocks on the bus.
    ///
    /// Returns the number of characters accepted, always all of them.
    pub fn write_str(&self, text: &str) -> Result<usize, StreamError> {
        StreamInner::write_str(&self.inner, text)
    }

    /// Bytes must be valid UTF-8; anything else is rejected, not queued.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        let text = std::str::from_utf8(bytes).map_err(StreamError::NotText)?;
        self.write_str(text)
    }

    pub fn writelines<I, S>(&self, lines: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.closed() {
            return Err(StreamError::Closed);
        }
        for line in lines {
            self.write_str(line.as_ref())?;
        }
        Ok(())
    }

    /// Publish whatever is buffered.
    ///
    /// Off the worker thread this waits, up to the flush timeout, for the
    /// message to be handed to the socket. A timeout is reported and the call
    /// returns normally.
    pub fn flush(&self) {
        let Some(worker) = self.inner.worker() else {
            return;
        };
        if !worker.is_alive() || worker.is_worker_thread() {
            self.inner.flush_now();
            return;
        }

        let inner = Arc::clone(&self.inner);
        if !flush_wait_allowed() {
            worker.schedule(move || inner.flush_now());
            return;
        }

        let (tx, rx) = mpsc::channel();
        let acker = worker.clone();
        worker.schedule(move || {
            inner.flush_now();
            // Queued behind the send that flush_now scheduled.
            acker.schedule(move || {
                let _ = tx.send(());
            });
        });
        if rx.recv_timeout(self.inner.flush_timeout).is_err() {
            diag::report("IOStream.flush timed out");
        }
    }

    /// Stop any descriptor watch, flush, and detach from the worker. Writes
    /// after this fail with `StreamError::Closed`.
    pub fn close(&self) {
        if let Some(watch) = lock(&self.watch).take() {
            if let Err(e) = watch.stop() {
                diag::report(&format!("{} descriptor watch failed: {e}", self.inner.name));
            }
        }
        if self.closed() {
            return;
        }
        self.flush();
        *self
            .inner
            .worker
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        tracing::debug!(stream = %self.inner.name, "stream closed");
    }
}

impl StreamInner {
    fn worker(&self) -> Option<Worker> {
        self.worker
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn is_master_process(&self) -> bool {
        std::process::id() == self.master_pid
    }

    fn write_str(this: &Arc<Self>, text: &str) -> Result<usize, StreamError> {
        let Some(worker) = this.worker() else {
            return Err(StreamError::Closed);
        };

        if let Some(echo) = this.echo.as_ref() {
            if let Err(e) = lock(echo).write_all(text.as_bytes()) {
                diag::report(&format!("Write failed: {e}"));
            }
        }

        // Only touch the buffer on the worker thread.
        let inner = Arc::clone(this);
        let owned = text.to_owned();
        worker.schedule(move || inner.lock_buffer().push_str(&owned));

        if this.is_master_process() {
            this.schedule_flush(&worker);
        } else if !this.subprocess_flush_pending.swap(true, Ordering::SeqCst) {
            // No timers in a descendant; flush right away, once per burst.
            let inner = Arc::clone(this);
            worker.schedule(move || inner.flush_now());
        }

        Ok(text.chars().count())
    }

    /// Arm the debounced flush. Writes before it fires do not re-arm it.
    fn schedule_flush(self: &Arc<Self>, worker: &Worker) {
        if self.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        worker.call_later(self.flush_interval, move || inner.flush_now());
    }

    /// Publish the accumulated text. Runs on the worker thread, or inline when
    /// there is no worker thread.
    fn flush_now(&self) {
        // Cleared first: writes racing with this flush arm a new one.
        self.flush_pending.store(false, Ordering::SeqCst);
        self.subprocess_flush_pending.store(false, Ordering::SeqCst);

        if let Some(echo) = self.echo.as_ref() {
            if let Err(e) = lock(echo).flush() {
                diag::report(&format!("Flush failed: {e}"));
            }
        }

        let text = std::mem::take(&mut *self.lock_buffer());
        if text.is_empty() {
            return;
        }
        let Some(worker) = self.worker() else {
            tracing::debug!(stream = %self.name, bytes = text.len(), "dropping output of closed stream");
            return;
        };

        let parent = lock(&self.parent).clone();
        let content = StreamContent {
            name: self.name.clone(),
            text,
        };
        let frames = self.envelope.stream_message(&parent, &self.topic, &content);
        worker.send_multipart(frames);
    }

    fn lock_buffer(&self) -> MutexGuard<'_, String> {
        lock(&self.buffer)
    }
}

impl Write for &OutStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutStream::write_bytes(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutStream::flush(self);
        Ok(())
    }
}

impl Write for OutStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        OutStream::flush(self);
        Ok(())
    }
}

fn std_fd(name: &str) -> Option<RawFd> {
    match name {
        "stdout" => Some(libc::STDOUT_FILENO),
        "stderr" => Some(libc::STDERR_FILENO),
        _ => None,
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "../../tests/unit/stream/mod.rs"]
mod tests;
