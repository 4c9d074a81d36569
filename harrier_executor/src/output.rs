//! Output buffer of per-call records, a stream of little-endian u32 words.

use crate::exec::ExecError;

/// Append-only u32 writer over a caller-provided buffer, with
/// reserve-then-fill support for the count slots of a record.
pub struct Output<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Output<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Appends one word and returns its index for later patching.
    pub(crate) fn write_u32(&mut self, v: u32) -> Result<usize, ExecError> {
        let idx = self.pos;
        let end = self
            .pos
            .checked_add(4)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ExecError::OutputOverflow)?;
        self.buf[self.pos..end].copy_from_slice(&v.to_le_bytes());
        self.pos = end;
        Ok(idx)
    }

    pub(crate) fn set_u32(&mut self, idx: usize, v: u32) {
        self.buf[idx..idx + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Decoded view of everything written, for consumers draining the
    /// record stream.
    pub fn words(&self) -> Vec<u32> {
        self.buf[..self.pos]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect()
    }
}
