//! Fork detection.
//!
//! Threads do not survive `fork()`, and neither does transport state that
//! belongs to them. Every send checks which side of a fork it is on before
//! touching the bus socket.

/// Where a descendant process should pipe its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeTarget {
    /// Loopback port the master's pipe-in listener is bound to.
    pub port: u16,
    /// Shared secret prepended to every piped message.
    pub secret: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Master,
    Child,
}

#[derive(Debug, Clone)]
pub struct ForkGuard {
    master_pid: u32,
    pipe: Option<PipeTarget>,
}

impl ForkGuard {
    /// Capture the calling process as the master.
    pub fn new(pipe: Option<PipeTarget>) -> Self {
        Self::with_master_pid(std::process::id(), pipe)
    }

    pub fn with_master_pid(master_pid: u32, pipe: Option<PipeTarget>) -> Self {
        Self { master_pid, pipe }
    }

    pub fn master_pid(&self) -> u32 {
        self.master_pid
    }

    pub fn pipe(&self) -> Option<&PipeTarget> {
        self.pipe.as_ref()
    }

    pub fn is_master(&self) -> bool {
        std::process::id() == self.master_pid
    }

    /// `Child` only when piping is available; without a pipe a descendant
    /// has nowhere better to send than the inherited socket.
    pub fn mode(&self) -> ProcessMode {
        if self.pipe.is_none() || self.is_master() {
            ProcessMode::Master
        } else {
            ProcessMode::Child
        }
    }
}

#[cfg(test)]
#[path = "../tests/unit/fork.rs"]
mod tests;
