use std::collections::VecDeque;
use std::sync::Mutex;

/// A zero-argument callable that must run on the worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of pending tasks. Producers append, only the worker pops.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Task) {
        self.lock().push_back(task);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pop_front(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    /// Run exactly the tasks that are queued right now, in order.
    ///
    /// The count is frozen on entry, so tasks appended while draining (including
    /// by the tasks themselves) wait for the next call. The lock is never held
    /// while a task runs.
    pub fn run_snapshot(&self) -> usize {
        let n = self.len();
        let mut ran = 0;
        for _ in 0..n {
            let Some(task) = self.pop_front() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "../tests/unit/queue.rs"]
mod tests;
