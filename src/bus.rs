//! Bus transport seam.
//!
//! The worker owns exactly one `BusSocket`. `TcpBus` is the loopback
//! implementation used by the binary; `PipeOut` is the throwaway connection a
//! forked descendant opens to the master's pipe-in listener for each send.

use crate::wire::{write_multipart, Frame};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub trait BusSocket: Send + 'static {
    fn send_multipart(&mut self, frames: Vec<Frame>) -> io::Result<()>;

    fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.send_multipart(vec![frame])
    }

    fn close(&mut self) {}
}

/// Publishes wire-encoded multipart messages to one TCP subscriber.
pub struct TcpBus {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpBus {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        tracing::debug!(%peer, "bus connected");
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl BusSocket for TcpBus {
    fn send_multipart(&mut self, frames: Vec<Frame>) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"));
        };
        write_multipart(stream, &frames)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!(peer = %self.peer, "bus closed");
        }
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.close();
    }
}

/// A fresh connection from a descendant process to the master's pipe-in port.
///
/// Inherited transport state cannot be trusted after a fork, so each send
/// builds its own connection and tears it down before returning.
pub struct PipeOut {
    stream: TcpStream,
}

impl PipeOut {
    /// `linger` bounds both the connect and the write: past it the message is
    /// discarded.
    pub fn connect(port: u16, linger: Duration) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = TcpStream::connect_timeout(&addr, linger)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(linger))?;
        Ok(Self { stream })
    }

    pub fn send(mut self, secret: &[u8; 16], frames: Vec<Frame>) -> io::Result<()> {
        let mut tagged = Vec::with_capacity(frames.len() + 1);
        tagged.push(secret.to_vec());
        tagged.extend(frames);
        write_multipart(&mut self.stream, &tagged)?;
        self.stream.shutdown(Shutdown::Write)
    }
}
