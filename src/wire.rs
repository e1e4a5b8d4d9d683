//! Multipart framing used on loopback TCP links.
//!
//! A message is a big-endian `u32` frame count followed by each frame as a
//! big-endian `u32` length and its bytes.

use std::io::{self, Write};

/// One part of a multipart message.
pub type Frame = Vec<u8>;

const MAX_FRAMES: usize = 1024;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub fn encode_multipart(frames: &[Frame]) -> Vec<u8> {
    let total = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

pub fn write_multipart<W: Write>(writer: &mut W, frames: &[Frame]) -> io::Result<()> {
    if frames.len() > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("too many frames: {}", frames.len()),
        ));
    }
    if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_LEN) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame length {} exceeds {MAX_FRAME_LEN}", frame.len()),
        ));
    }
    writer.write_all(&encode_multipart(frames))?;
    writer.flush()
}

/// Incremental decoder for a byte stream of multipart messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if one has fully arrived.
    pub fn next_message(&mut self) -> io::Result<Option<Vec<Frame>>> {
        let Some(count) = read_u32(&self.buf, 0) else {
            return Ok(None);
        };
        if count > MAX_FRAMES {
            return Err(invalid(format!("frame count {count} exceeds {MAX_FRAMES}")));
        }

        let mut offset = 4;
        let mut spans = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(len) = read_u32(&self.buf, offset) else {
                return Ok(None);
            };
            if len > MAX_FRAME_LEN {
                return Err(invalid(format!("frame length {len} exceeds {MAX_FRAME_LEN}")));
            }
            offset += 4;
            if self.buf.len() < offset + len {
                return Ok(None);
            }
            spans.push((offset, len));
            offset += len;
        }

        let frames = spans
            .into_iter()
            .map(|(start, len)| self.buf[start..start + len].to_vec())
            .collect();
        self.buf.drain(..offset);
        Ok(Some(frames))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<usize> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
#[path = "../tests/unit/wire.rs"]
mod tests;
