//! iopub-tap: run a command and publish its stdout/stderr to a subscriber.
//!
//! Usage: iopub-tap <subscriber-addr> [--config PATH] -- <command> [args...]

use iopub::config::{load_config, IoPubConfig};
use iopub::{diag, JsonEnvelope, OutStream, TcpBus, Worker};
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

struct Args {
    addr: String,
    config: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut addr = None;
    let mut config = None;
    let mut command = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--" => {
                command.extend(args.by_ref());
                break;
            }
            "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            _ if addr.is_none() => addr = Some(arg),
            _ => return Err(format!("unexpected argument: {arg}")),
        }
    }
    let addr = addr.ok_or("missing subscriber address")?;
    if command.is_empty() {
        return Err("missing command after --".to_string());
    }
    Ok(Args {
        addr,
        config,
        command,
    })
}

#[derive(Debug, Clone, Copy)]
struct TerminationSignal(i32);

fn install_termination_signals(
    tx: mpsc::Sender<TerminationSignal>,
) -> io::Result<std::thread::JoinHandle<()>> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("iopub-signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if tx.send(TerminationSignal(sig)).is_err() {
                    break;
                }
            }
        })
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("iopub-tap: {msg}");
            eprintln!("usage: iopub-tap <subscriber-addr> [--config PATH] -- <command> [args...]");
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            diag::report(&format!("iopub-tap: {e}"));
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> io::Result<u8> {
    let mut config = match args.config.as_deref() {
        Some(path) => load_config(path).map_err(io::Error::other)?,
        None => IoPubConfig::default(),
    }
    .from_env_overrides();
    config.watch_fd = true;

    let _logging = iopub::logging::init(None, &config.log_filter);

    let bus = TcpBus::connect(&args.addr)?;
    let worker = Worker::new(bus, &config)?;
    worker.start()?;

    let envelope = Arc::new(JsonEnvelope::default());
    let stdout = OutStream::new("stdout", &worker, envelope.clone(), &config)?;
    let stderr = OutStream::new("stderr", &worker, envelope, &config)?;

    let (sig_tx, sig_rx) = mpsc::channel();
    install_termination_signals(sig_tx)?;

    let mut child = Command::new(&args.command[0])
        .args(&args.command[1..])
        .spawn()?;
    tracing::info!(pid = child.id(), command = ?args.command, "command started");

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Ok(TerminationSignal(sig)) = sig_rx.recv_timeout(Duration::from_millis(50)) {
            tracing::info!(sig, "forwarding signal to command");
            // SAFETY: plain kill(2) on the pid of a child we spawned and have not reaped.
            unsafe {
                libc::kill(child.id() as libc::pid_t, sig);
            }
        }
    };

    stdout.flush();
    stderr.flush();
    stdout.close();
    stderr.close();
    worker.stop();
    worker.close();

    tracing::info!(?status, "command exited");
    Ok(status.code().map(|c| c as u8).unwrap_or(1))
}
