//! Pipe-in listener: output piped back from forked descendants.

use crate::fork::PipeTarget;
use crate::wire::{Frame, FrameDecoder};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

struct PipeConn {
    stream: TcpStream,
    decoder: FrameDecoder,
}

pub(super) struct PipeIn {
    listener: TcpListener,
    target: PipeTarget,
    conns: Vec<PipeConn>,
}

impl PipeIn {
    /// Bind an ephemeral loopback port and mint the shared secret.
    pub(super) fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let secret = *uuid::Uuid::new_v4().as_bytes();
        tracing::debug!(port, "pipe-in listening");
        Ok(Self {
            listener,
            target: PipeTarget { port, secret },
            conns: Vec::new(),
        })
    }

    pub(super) fn target(&self) -> PipeTarget {
        self.target.clone()
    }

    pub(super) fn register(&self, fds: &mut Vec<libc::pollfd>) {
        fds.push(pollin(self.listener.as_raw_fd()));
        for conn in &self.conns {
            fds.push(pollin(conn.stream.as_raw_fd()));
        }
    }

    /// Accept pending connections and read whatever has arrived, handing every
    /// complete message to `on_message`. Non-blocking throughout.
    pub(super) fn service(&mut self, mut on_message: impl FnMut(Vec<Frame>)) {
        self.accept_pending();

        let mut buf = [0u8; 8192];
        self.conns.retain_mut(|conn| {
            let keep = loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => break false,
                    Ok(n) => conn.decoder.push(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break true,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "pipe-in read failed");
                        break false;
                    }
                }
            };
            loop {
                match conn.decoder.next_message() {
                    Ok(Some(frames)) => on_message(frames),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed pipe-in message");
                        return false;
                    }
                }
            }
            if !keep && conn.decoder.pending() > 0 {
                tracing::warn!(bytes = conn.decoder.pending(), "pipe-in connection closed mid-message");
            }
            keep
        });
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::warn!(error = %e, "pipe-in connection setup failed");
                        continue;
                    }
                    self.conns.push(PipeConn {
                        stream,
                        decoder: FrameDecoder::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "pipe-in accept failed");
                    break;
                }
            }
        }
    }
}

fn pollin(fd: i32) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}
