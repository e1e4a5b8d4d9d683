//! The IOPub worker: one thread that owns the bus socket.
//!
//! Every send and every mutation of stream buffers happens on this thread.
//! Other threads only get `schedule`, which queues a task and wakes the
//! event loop through the thread's own wake endpoint.

mod event_loop;
mod pipe;
mod timers;

use crate::bus::{BusSocket, PipeOut};
use crate::config::IoPubConfig;
use crate::diag;
use crate::fork::{ForkGuard, PipeTarget, ProcessMode};
use crate::queue::{Task, TaskQueue};
use crate::wake::{wake_channel, WakeChannel};
use crate::wire::Frame;
use event_loop::LoopState;
use pipe::PipeIn;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use timers::Timers;

const THREAD_NAME: &str = "iopub-worker";

/// Bounds the shutdown drain when tasks keep scheduling more tasks.
const MAX_SHUTDOWN_DRAINS: usize = 64;

/// Cheap handle to the worker; clones share the same thread and socket.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct RunningThread {
    handle: JoinHandle<()>,
    id: ThreadId,
    pid: u32,
}

struct WorkerInner {
    socket: Mutex<Option<Box<dyn BusSocket>>>,
    queue: TaskQueue,
    wake: WakeChannel,
    /// Held by the worker thread for as long as its loop runs.
    loop_state: Mutex<LoopState>,
    timers: Arc<Timers>,
    fork: ForkGuard,
    pipe_linger: Duration,
    thread: Mutex<Option<RunningThread>>,
    stop_requested: AtomicBool,
}

impl Worker {
    /// Create a worker that sends on `socket`. Nothing runs until `start()`.
    ///
    /// With `config.pipe` set, a loopback listener is bound for output piped
    /// from forked descendants. A bind failure disables piping for the life of
    /// the process and is reported, not returned.
    pub fn new<S: BusSocket>(socket: S, config: &IoPubConfig) -> io::Result<Self> {
        let pipe_in = if config.pipe {
            match PipeIn::bind() {
                Ok(pipe_in) => Some(pipe_in),
                Err(e) => {
                    diag::report(&format!(
                        "Couldn't bind IOPub pipe to 127.0.0.1: {e}\nsubprocess output will be unavailable."
                    ));
                    None
                }
            }
        } else {
            None
        };
        let target = pipe_in.as_ref().map(PipeIn::target);
        Self::build(
            Box::new(socket),
            ForkGuard::new(target),
            pipe_in,
            config.pipe_linger(),
        )
    }

    /// Create a worker around an explicit fork guard, without a pipe-in
    /// listener of its own. A guard whose master pid is not this process makes
    /// every send take the descendant path to `guard.pipe()`.
    pub fn with_fork_guard<S: BusSocket>(
        socket: S,
        guard: ForkGuard,
        pipe_linger: Duration,
    ) -> io::Result<Self> {
        Self::build(Box::new(socket), guard, None, pipe_linger)
    }

    fn build(
        socket: Box<dyn BusSocket>,
        fork: ForkGuard,
        pipe_in: Option<PipeIn>,
        pipe_linger: Duration,
    ) -> io::Result<Self> {
        let (wake, receiver) = wake_channel()?;
        Ok(Self {
            inner: Arc::new(WorkerInner {
                socket: Mutex::new(Some(socket)),
                queue: TaskQueue::new(),
                wake,
                loop_state: Mutex::new(LoopState::new(receiver, pipe_in)),
                timers: Arc::new(Timers::default()),
                fork,
                pipe_linger,
                thread: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
            }),
        })
    }

    /// Spawn the worker thread. A no-op if it is already running.
    pub fn start(&self) -> io::Result<()> {
        let mut thread = lock(&self.inner.thread);
        if let Some(running) = thread.as_ref() {
            if running.pid != std::process::id() {
                // Forked: the loop state belongs to a thread that no longer exists.
                tracing::warn!("worker cannot be restarted in a forked process");
                return Ok(());
            }
            if !running.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = thread.take() {
            reap(stale);
        }

        self.inner.stop_requested.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || event_loop::thread_main(inner))?;
        *thread = Some(RunningThread {
            id: handle.thread().id(),
            handle,
            pid: std::process::id(),
        });
        drop(thread);

        register_exit_hook(&self.inner);
        tracing::debug!(pid = std::process::id(), "worker started");
        Ok(())
    }

    /// Stop the loop and join the thread, then release every wake endpoint
    /// any thread ever created. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// True while the worker thread runs in this process.
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    pub fn is_worker_thread(&self) -> bool {
        self.inner.is_worker_thread()
    }

    /// Run `task` on the worker thread, or right here if the thread is not
    /// running (e.g. in a forked descendant).
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.schedule(Box::new(task));
    }

    /// Run `task` on the worker thread after `delay`. Without a running
    /// worker there is no loop to wait in, so the task runs immediately.
    pub fn call_later<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        WorkerInner::call_later(&self.inner, delay, Box::new(task));
    }

    pub fn send_multipart(&self, frames: Vec<Frame>) {
        WorkerInner::send_multipart(&self.inner, frames);
    }

    pub fn send(&self, frame: Frame) {
        self.send_multipart(vec![frame]);
    }

    /// Close the bus socket. Later sends are dropped.
    pub fn close(&self) {
        if let Some(mut socket) = lock(&self.inner.socket).take() {
            socket.close();
        }
    }

    pub fn closed(&self) -> bool {
        lock(&self.inner.socket).is_none()
    }

    pub fn fork_guard(&self) -> &ForkGuard {
        &self.inner.fork
    }

    /// Where descendants should pipe, if piping is enabled.
    pub fn pipe_target(&self) -> Option<PipeTarget> {
        self.inner.fork.pipe().cloned()
    }

    pub fn pipe_port(&self) -> Option<u16> {
        self.inner.fork.pipe().map(|p| p.port)
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.len()
    }
}

impl WorkerInner {
    fn is_alive(&self) -> bool {
        lock(&self.thread).as_ref().is_some_and(|running| {
            running.pid == std::process::id() && !running.handle.is_finished()
        })
    }

    fn is_worker_thread(&self) -> bool {
        let current = std::thread::current().id();
        lock(&self.thread).as_ref().is_some_and(|running| {
            running.id == current && running.pid == std::process::id()
        })
    }

    fn schedule(&self, task: Task) {
        if !self.is_alive() {
            task();
            return;
        }
        self.queue.push(task);
        // Message content is ignored; the arrival is the signal.
        if let Err(e) = self.wake.wake() {
            tracing::warn!(error = %e, "wake endpoint unavailable; task waits for the next wake-up");
        }
    }

    fn call_later(this: &Arc<Self>, delay: Duration, task: Task) {
        if !this.is_alive() {
            task();
            return;
        }
        let deadline = Instant::now() + delay;
        if this.is_worker_thread() && !this.stop_requested.load(Ordering::SeqCst) {
            this.timers.insert_at(deadline, task);
            return;
        }
        // The insertion itself must happen on the worker thread. If the loop
        // is already shutting down when it runs, no timer would ever fire.
        let inner = Arc::clone(this);
        this.schedule(Box::new(move || {
            if inner.stop_requested.load(Ordering::SeqCst) {
                task();
            } else {
                inner.timers.insert_at(deadline, task);
            }
        }));
    }

    /// Run queued tasks and pending timers until both are empty. Returns the
    /// number of tasks and timers run.
    fn run_leftovers(&self) -> (usize, usize) {
        let mut drained = 0;
        let mut timers = 0;
        for _ in 0..MAX_SHUTDOWN_DRAINS {
            if self.queue.is_empty() && self.timers.is_empty() {
                break;
            }
            drained += self.queue.run_snapshot();
            timers += self.timers.run_all();
        }
        (drained, timers)
    }

    fn send_multipart(this: &Arc<Self>, frames: Vec<Frame>) {
        let inner = Arc::clone(this);
        this.schedule(Box::new(move || inner.really_send(frames)));
    }

    fn really_send(&self, frames: Vec<Frame>) {
        match self.fork.mode() {
            ProcessMode::Master => {
                let mut socket = lock(&self.socket);
                let Some(socket) = socket.as_mut() else {
                    tracing::debug!(frames = frames.len(), "dropping message for closed socket");
                    return;
                };
                if let Err(e) = socket.send_multipart(frames) {
                    tracing::warn!(error = %e, "bus send failed");
                }
            }
            ProcessMode::Child => {
                let Some(target) = self.fork.pipe() else {
                    return;
                };
                let result = PipeOut::connect(target.port, self.pipe_linger)
                    .and_then(|pipe_out| pipe_out.send(&target.secret, frames));
                if let Err(e) = result {
                    tracing::warn!(error = %e, port = target.port, "pipe to master failed");
                }
            }
        }
    }

    /// Inbound message on the pipe-in listener.
    fn handle_pipe_msg(this: &Arc<Self>, mut frames: Vec<Frame>) {
        let Some(target) = this.fork.pipe() else {
            return;
        };
        if !this.fork.is_master() {
            return;
        }
        if frames.first().map(Vec::as_slice) != Some(&target.secret[..]) {
            tracing::warn!(frames = frames.len(), "dropping pipe message with bad secret");
            diag::report(&format!("Bad pipe message: {} frames", frames.len()));
            return;
        }
        frames.remove(0);
        Self::send_multipart(this, frames);
    }

    fn stop(&self) {
        if self.is_worker_thread() {
            // Cannot join ourselves; the loop exits after the current drain.
            self.stop_requested.store(true, Ordering::SeqCst);
            return;
        }
        let running = {
            let mut thread = lock(&self.thread);
            // Also reaps a thread that ended on its own after a task panicked.
            if !thread
                .as_ref()
                .is_some_and(|running| running.pid == std::process::id())
            {
                return;
            }
            thread.take()
        };
        let Some(running) = running else {
            return;
        };

        self.stop_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.wake.wake() {
            tracing::warn!(error = %e, "failed to wake worker for stop");
        }
        reap(running);

        // Anything scheduled or armed between the loop's last drain and the join.
        let (drained, timers) = self.run_leftovers();
        if drained + timers > 0 {
            tracing::debug!(drained, timers, "ran work left after worker exit");
        }

        // Endpoints are only used by other threads while the worker is alive,
        // so after the join this is safe.
        let released = self.wake.release_all();
        tracing::debug!(released, "worker stopped");
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        self.wake.release_all();
        if let Some(mut socket) = lock(&self.socket).take() {
            socket.close();
        }
    }
}

fn reap(running: RunningThread) {
    if running.handle.join().is_err() {
        tracing::error!("worker thread panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static LIVE_WORKERS: OnceLock<Mutex<Vec<Weak<WorkerInner>>>> = OnceLock::new();

/// Stop workers at process exit so buffered output is not lost.
fn register_exit_hook(inner: &Arc<WorkerInner>) {
    let mut first = false;
    let workers = LIVE_WORKERS.get_or_init(|| {
        first = true;
        Mutex::new(Vec::new())
    });
    {
        let mut workers = lock(workers);
        workers.retain(|weak| weak.strong_count() > 0);
        if !workers.iter().any(|weak| weak.as_ptr() == Arc::as_ptr(inner)) {
            workers.push(Arc::downgrade(inner));
        }
    }
    if first {
        // SAFETY: registers a plain `extern "C"` function with no captured state.
        if unsafe { libc::atexit(stop_all_workers) } != 0 {
            tracing::warn!("failed to register worker exit hook");
        }
    }
}

extern "C" fn stop_all_workers() {
    let Some(workers) = LIVE_WORKERS.get() else {
        return;
    };
    let workers: Vec<_> = lock(workers).iter().filter_map(Weak::upgrade).collect();
    for worker in workers {
        worker.stop();
    }
}

#[cfg(test)]
#[path = "../../tests/unit/worker/mod.rs"]
mod tests;
