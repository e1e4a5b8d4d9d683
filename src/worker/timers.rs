use crate::queue::Task;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// Delayed tasks, touched only from the worker thread.
#[derive(Default)]
pub(super) struct Timers {
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    seq: u64,
    entries: BTreeMap<(Instant, u64), Task>,
}

impl Timers {
    pub(super) fn insert_at(&self, deadline: Instant, task: Task) {
        let mut state = self.lock();
        let seq = state.seq;
        state.seq = seq.wrapping_add(1);
        state.entries.insert((deadline, seq), task);
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// `poll()` timeout until the earliest deadline; -1 waits indefinitely.
    pub(super) fn poll_timeout_ms(&self, now: Instant) -> i32 {
        let state = self.lock();
        let Some((deadline, _)) = state.entries.keys().next() else {
            return -1;
        };
        let remaining = deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            return 0;
        }
        // Round up so we never wake just before the deadline and spin.
        let ms = remaining.as_millis() + u128::from(remaining.subsec_nanos() % 1_000_000 != 0);
        ms.min(i32::MAX as u128) as i32
    }

    /// Run every task whose deadline has passed, earliest first.
    pub(super) fn run_due(&self, now: Instant) -> usize {
        let mut ran = 0;
        loop {
            let task = {
                let mut state = self.lock();
                let Some(entry) = state.entries.first_entry() else {
                    break;
                };
                if entry.key().0 > now {
                    break;
                }
                entry.remove()
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Run everything regardless of deadline, used when the loop shuts down.
    pub(super) fn run_all(&self) -> usize {
        let entries = std::mem::take(&mut self.lock().entries);
        let ran = entries.len();
        for task in entries.into_values() {
            task();
        }
        ran
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
