use super::pipe::PipeIn;
use super::WorkerInner;
use crate::wake::WakeReceiver;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub(super) struct LoopState {
    receiver: WakeReceiver,
    pipe_in: Option<PipeIn>,
    fds: Vec<libc::pollfd>,
}

impl LoopState {
    pub(super) fn new(receiver: WakeReceiver, pipe_in: Option<PipeIn>) -> Self {
        Self {
            receiver,
            pipe_in,
            fds: Vec::with_capacity(4),
        }
    }
}

pub(super) fn thread_main(inner: Arc<WorkerInner>) {
    let Ok(mut state) = inner.loop_state.try_lock() else {
        tracing::error!("worker loop state is held elsewhere; not starting");
        return;
    };
    tracing::debug!("worker loop running");
    run(&inner, &mut state);

    let (drained, timers) = inner.run_leftovers();
    tracing::debug!(drained, timers, "worker loop exited");
}

fn run(inner: &Arc<WorkerInner>, state: &mut LoopState) {
    loop {
        state.fds.clear();
        state.fds.push(libc::pollfd {
            fd: state.receiver.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        if let Some(pipe_in) = state.pipe_in.as_ref() {
            pipe_in.register(&mut state.fds);
        }

        let timeout = inner.timers.poll_timeout_ms(Instant::now());
        // SAFETY: fds is a valid, initialized slice of pollfd for the duration of the call.
        let ret = unsafe {
            libc::poll(
                state.fds.as_mut_ptr(),
                state.fds.len() as libc::nfds_t,
                timeout,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!(error = %err, "worker poll failed");
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            continue;
        }

        if state.fds[0].revents != 0 && state.receiver.drain() {
            inner.queue.run_snapshot();
        }

        let pipe_ready = state.fds[1..].iter().any(|fd| fd.revents != 0);
        if pipe_ready {
            if let Some(pipe_in) = state.pipe_in.as_mut() {
                pipe_in.service(|frames| WorkerInner::handle_pipe_msg(inner, frames));
            }
        }

        inner.timers.run_due(Instant::now());

        if inner.stop_requested.load(Ordering::SeqCst) {
            break;
        }
    }
}
