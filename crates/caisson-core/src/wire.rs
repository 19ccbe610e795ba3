//! Record framing shared by bundles, index files and backup
//! descriptors: 4-byte little-endian length prefixes around msgpack
//! records or raw byte blocks, with one Adler-32 checksum running
//! across the entire stream. Checksum trailers themselves are folded
//! into the running sum after being emitted, so a later trailer also
//! covers every earlier one.

use adler32::RollingAdler32;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CaissonError, Result};

pub struct FrameWriter {
    buf: Vec<u8>,
    sum: RollingAdler32,
}

impl FrameWriter {
    pub fn new() -> Self {
        FrameWriter {
            buf: Vec::new(),
            sum: RollingAdler32::new(),
        }
    }

    fn put(&mut self, data: &[u8]) {
        self.sum.update_buffer(data);
        self.buf.extend_from_slice(data);
    }

    pub fn put_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let body = rmp_serde::to_vec(record)?;
        self.put(&(body.len() as u32).to_le_bytes());
        self.put(&body);
        Ok(())
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put(&(data.len() as u32).to_le_bytes());
        self.put(data);
    }

    /// Zero-length prefix marking the end of a repeated-record section.
    pub fn put_terminator(&mut self) {
        self.put(&0u32.to_le_bytes());
    }

    pub fn put_checksum(&mut self) {
        let trailer = self.sum.hash().to_le_bytes();
        self.put(&trailer);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        FrameWriter::new()
    }
}

pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
    sum: RollingAdler32,
    /// Name of the thing being decoded, for error messages.
    context: &'a str,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8], context: &'a str) -> Self {
        FrameReader {
            data,
            pos: 0,
            sum: RollingAdler32::new(),
            context,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(CaissonError::UnexpectedEndOfInput(self.context.to_string()));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        self.sum.update_buffer(out);
        Ok(out)
    }

    fn take_len(&mut self) -> Result<usize> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()) as usize)
    }

    pub fn take_record<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = self.take_len()?;
        let body = self.take(len)?;
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Reads the next record of a terminated sequence; `None` marks the
    /// zero-length terminator.
    pub fn take_optional_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let len = self.take_len()?;
        if len == 0 {
            return Ok(None);
        }
        let body = self.take(len)?;
        Ok(Some(rmp_serde::from_slice(body)?))
    }

    pub fn take_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.take_len()?;
        self.take(len)
    }

    /// Checks a 4-byte trailer against the checksum of everything read
    /// so far, then folds the trailer bytes into the running sum.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let expected = self.sum.hash();
        let raw = self.take(4)?;
        let stored = u32::from_le_bytes(raw.try_into().unwrap());
        if stored != expected {
            return Err(CaissonError::CorruptBundle {
                file: self.context.to_string(),
                reason: "checksum mismatch".to_string(),
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
