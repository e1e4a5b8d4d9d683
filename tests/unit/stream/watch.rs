use super::*;
use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[test]
fn take_text_keeps_incomplete_trailing_sequence() {
    let mut pending = "ok é".as_bytes().to_vec();
    let last = pending.pop().unwrap();

    assert_eq!(take_text(&mut pending), "ok ");
    assert_eq!(pending.len(), 1);

    pending.push(last);
    assert_eq!(take_text(&mut pending), "é");
    assert!(pending.is_empty());
}

#[test]
fn take_text_replaces_invalid_bytes() {
    let mut pending = vec![b'a', 0xff, b'b'];
    assert_eq!(take_text(&mut pending), "a\u{fffd}b");
    assert!(pending.is_empty());
}

#[test]
fn watch_forwards_text_and_preserves_original_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("captured.txt");
    let fd = std::fs::File::create(&path).unwrap().into_raw_fd();

    let seen = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&seen);
    let watch = FdWatch::start(fd, 4, move |text| sink.lock().unwrap().push_str(text)).unwrap();
    assert_eq!(watch.watched_fd(), fd);
    assert_ne!(watch.original_fd(), fd);

    write_all_fd(fd, "näive output\n".as_bytes()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().len() < "näive output\n".len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    watch.stop().unwrap();
    assert_eq!(*seen.lock().unwrap(), "näive output\n");

    // After stop, the descriptor writes straight to the file again.
    write_all_fd(fd, b"direct\n").unwrap();
    // SAFETY: fd came from into_raw_fd above and is closed exactly once.
    unsafe {
        libc::close(fd);
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "näive output\ndirect\n");
}

#[test]
fn stop_returns_after_writer_is_restored() {
    let file = tempfile::tempfile().unwrap();
    let fd = file.into_raw_fd();

    let watch = FdWatch::start(fd, 1000, |_| {}).unwrap();
    let started = Instant::now();
    watch.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    // SAFETY: fd came from into_raw_fd above; ownership moves back here.
    let mut restored = unsafe { File::from_raw_fd(fd) };
    restored.write_all(b"still usable").unwrap();
}

#[test]
fn stop_forwards_backlog_still_in_the_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.txt");
    let fd = std::fs::File::create(&path).unwrap().into_raw_fd();

    let forwarded = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&forwarded);
    let watch = FdWatch::start(fd, 1000, move |text| *counter.lock().unwrap() += text.len()).unwrap();

    let backlog = vec![b'a'; 32 * 1024];
    write_all_fd(fd, &backlog).unwrap();
    watch.stop().unwrap();

    assert_eq!(*forwarded.lock().unwrap(), backlog.len());
    // SAFETY: fd came from into_raw_fd above and is closed exactly once.
    unsafe {
        libc::close(fd);
    }
    assert_eq!(std::fs::read(&path).unwrap().len(), backlog.len());
}
