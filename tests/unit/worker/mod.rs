use super::*;
use crate::bus::PipeOut;
use crate::wire::encode_multipart;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc;

#[derive(Clone, Default)]
struct RecordingBus {
    sent: Arc<Mutex<Vec<Vec<Frame>>>>,
    closes: Arc<AtomicUsize>,
}

impl RecordingBus {
    fn sent(&self) -> Vec<Vec<Frame>> {
        self.sent.lock().unwrap().clone()
    }
}

impl BusSocket for RecordingBus {
    fn send_multipart(&mut self, frames: Vec<Frame>) -> io::Result<()> {
        self.sent.lock().unwrap().push(frames);
        Ok(())
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn started_worker(bus: &RecordingBus, config: &IoPubConfig) -> Worker {
    let worker = Worker::new(bus.clone(), config).unwrap();
    worker.start().unwrap();
    worker
}

#[test]
fn scheduled_tasks_run_on_worker_thread_in_order() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());
    let (tx, rx) = mpsc::channel();

    for i in 0..10 {
        let tx = tx.clone();
        let probe = worker.clone();
        worker.schedule(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send((i, name, probe.is_worker_thread())).unwrap();
        });
    }

    for expected in 0..10 {
        let (i, name, on_worker) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(i, expected);
        assert_eq!(name.as_deref(), Some(THREAD_NAME));
        assert!(on_worker);
    }
    assert!(!worker.is_worker_thread());
    worker.stop();
}

#[test]
fn schedule_without_thread_runs_inline() {
    let worker = Worker::new(RecordingBus::default(), &IoPubConfig::default()).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);

    worker.schedule(move || flag.store(true, Ordering::SeqCst));

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(worker.pending_tasks(), 0);
}

#[test]
fn send_reaches_socket_in_order() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());

    worker.send(b"one".to_vec());
    worker.send_multipart(vec![b"two".to_vec(), b"three".to_vec()]);

    assert!(wait_until(Duration::from_secs(2), || bus.sent().len() == 2));
    assert_eq!(
        bus.sent(),
        vec![
            vec![b"one".to_vec()],
            vec![b"two".to_vec(), b"three".to_vec()]
        ]
    );
    worker.stop();
}

#[test]
fn stop_start_stop_is_safe() {
    let bus = RecordingBus::default();
    let worker = Worker::new(bus.clone(), &IoPubConfig::default()).unwrap();

    worker.stop();
    worker.start().unwrap();
    worker.start().unwrap();
    assert!(worker.is_alive());

    worker.stop();
    worker.stop();
    assert!(!worker.is_alive());

    worker.start().unwrap();
    worker.send(b"again".to_vec());
    assert!(wait_until(Duration::from_secs(2), || bus.sent().len() == 1));
    worker.stop();
}

#[test]
fn stop_releases_every_wake_endpoint() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());

    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let remote = worker.clone();
    let helper = std::thread::spawn(move || {
        remote.schedule(|| {});
        tx.send(()).unwrap();
        let _ = done_rx.recv();
    });
    rx.recv().unwrap();
    worker.schedule(|| {});
    assert!(worker.inner.wake.live_endpoints() >= 2);

    worker.stop();
    assert_eq!(worker.inner.wake.live_endpoints(), 0);

    done_tx.send(()).unwrap();
    helper.join().unwrap();
}

#[test]
fn tasks_scheduled_by_tasks_still_run() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());
    let counter = Arc::new(AtomicUsize::new(0));
    let n = 5;

    for _ in 0..n {
        let counter = Arc::clone(&counter);
        let again = worker.clone();
        worker.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            again.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });
    }

    assert!(wait_until(Duration::from_secs(2), || {
        counter.load(Ordering::SeqCst) == 2 * n
    }));
    worker.stop();
}

#[test]
fn call_later_waits_for_its_delay() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());
    let (tx, rx) = mpsc::channel();
    let scheduled = Instant::now();

    worker.call_later(Duration::from_millis(80), move || {
        tx.send(Instant::now()).unwrap();
    });

    let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(fired.duration_since(scheduled) >= Duration::from_millis(80));
    assert_eq!(worker.inner.timers.len(), 0);
    worker.stop();
}

#[test]
fn stop_fires_pending_timers() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);

    worker.call_later(Duration::from_secs(60), move || flag.store(true, Ordering::SeqCst));
    worker.stop();

    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn close_closes_socket_once_and_drops_later_sends() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());

    worker.close();
    worker.close();
    assert!(worker.closed());
    assert_eq!(bus.closes.load(Ordering::SeqCst), 1);

    worker.send(b"late".to_vec());
    worker.stop();
    assert!(bus.sent().is_empty());
}

#[test]
fn stop_from_a_task_does_not_deadlock() {
    let bus = RecordingBus::default();
    let worker = started_worker(&bus, &IoPubConfig::default());
    let (tx, rx) = mpsc::channel();
    let inner = worker.clone();

    worker.schedule(move || {
        inner.stop();
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !worker.is_alive()));
    worker.stop();
}

fn piping_master(bus: &RecordingBus) -> (Worker, PipeTarget) {
    let config = IoPubConfig {
        pipe: true,
        ..IoPubConfig::default()
    };
    let master = started_worker(bus, &config);
    let target = master.pipe_target().unwrap();
    (master, target)
}

#[test]
fn descendant_sends_are_piped_to_master() {
    let master_bus = RecordingBus::default();
    let (master, target) = piping_master(&master_bus);

    let child_bus = RecordingBus::default();
    let guard = ForkGuard::with_master_pid(std::process::id().wrapping_add(1), Some(target));
    let child = Worker::with_fork_guard(child_bus.clone(), guard, Duration::from_secs(3)).unwrap();
    assert_eq!(child.fork_guard().mode(), ProcessMode::Child);

    child.send_multipart(vec![b"stream.stdout".to_vec(), b"hi".to_vec()]);

    assert!(wait_until(Duration::from_secs(2), || master_bus.sent().len() == 1));
    assert_eq!(
        master_bus.sent()[0],
        vec![b"stream.stdout".to_vec(), b"hi".to_vec()]
    );
    assert!(child_bus.sent().is_empty());
    master.stop();
}

#[test]
fn pipe_messages_with_wrong_secret_are_dropped() {
    let master_bus = RecordingBus::default();
    let (master, target) = piping_master(&master_bus);

    let mut wrong = target.secret;
    wrong[0] ^= 0xff;
    PipeOut::connect(target.port, Duration::from_secs(3))
        .unwrap()
        .send(&wrong, vec![b"forged".to_vec()])
        .unwrap();
    PipeOut::connect(target.port, Duration::from_secs(3))
        .unwrap()
        .send(&target.secret, vec![b"genuine".to_vec()])
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !master_bus.sent().is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(master_bus.sent(), vec![vec![b"genuine".to_vec()]]);
    master.stop();
}

#[test]
fn malformed_pipe_connection_does_not_stop_the_loop() {
    let master_bus = RecordingBus::default();
    let (master, target) = piping_master(&master_bus);

    let mut garbage = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, target.port))).unwrap();
    garbage.write_all(&u32::MAX.to_be_bytes()).unwrap();

    let mut good = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, target.port))).unwrap();
    good.write_all(&encode_multipart(&[target.secret.to_vec(), b"ok".to_vec()]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || master_bus.sent().len() == 1));
    assert_eq!(master_bus.sent()[0], vec![b"ok".to_vec()]);
    assert!(master.is_alive());
    master.stop();
}
