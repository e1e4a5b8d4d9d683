use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn run_snapshot_runs_in_fifo_order() {
    let queue = TaskQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let seen = Arc::clone(&seen);
        queue.push(Box::new(move || seen.lock().unwrap().push(i)));
    }

    assert_eq!(queue.run_snapshot(), 5);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(queue.is_empty());
}

#[test]
fn tasks_scheduled_while_draining_wait_for_next_snapshot() {
    let queue = Arc::new(TaskQueue::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let n = 4;

    for _ in 0..n {
        let queue_for_task = Arc::clone(&queue);
        let counter = Arc::clone(&counter);
        queue.push(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = Arc::clone(&counter);
            queue_for_task.push(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }));
    }

    assert_eq!(queue.run_snapshot(), n);
    assert_eq!(counter.load(Ordering::SeqCst), n);
    assert_eq!(queue.len(), n);

    assert_eq!(queue.run_snapshot(), n);
    assert_eq!(counter.load(Ordering::SeqCst), 2 * n);
    assert!(queue.is_empty());
}

#[test]
fn run_snapshot_on_empty_queue_is_a_no_op() {
    let queue = TaskQueue::new();
    assert_eq!(queue.run_snapshot(), 0);
}
