#![forbid(unsafe_code)]

use bfs_block::ByteDevice;
use bfs_error::{BfsError, Result};
use bfs_types::ByteOffset;
use std::collections::HashMap;
use std::io;

const CHUNK: u64 = 65_536;

/// Device of arbitrary logical length backed only by the chunks written.
///
/// Unwritten chunks read as zero. Reads past `len` fail like a short device.
#[derive(Debug, Clone, Default)]
pub struct SparseByteDevice {
    len: u64,
    chunks: HashMap<u64, Box<[u8]>>,
}

impl SparseByteDevice {
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            len,
            chunks: HashMap::new(),
        }
    }

    /// Copy `bytes` to `offset`, growing the device if needed.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        let mut pos = offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            let idx = pos / CHUNK;
            let within = (pos % CHUNK) as usize;
            let n = rest.len().min(CHUNK as usize - within);
            let chunk = self
                .chunks
                .entry(idx)
                .or_insert_with(|| vec![0_u8; CHUNK as usize].into_boxed_slice());
            chunk[within..within + n].copy_from_slice(&rest[..n]);
            pos += n as u64;
            rest = &rest[n..];
        }
        self.len = self.len.max(pos);
    }
}

impl ByteDevice for SparseByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let end = offset.0.saturating_add(buf.len() as u64);
        if end > self.len {
            return Err(BfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("sparse read past end: offset={offset} len={}", buf.len()),
            )));
        }
        let mut pos = offset.0;
        let mut done = 0;
        while done < buf.len() {
            let within = (pos % CHUNK) as usize;
            let n = (buf.len() - done).min(CHUNK as usize - within);
            match self.chunks.get(&(pos / CHUNK)) {
                Some(chunk) => buf[done..done + n].copy_from_slice(&chunk[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            pos += n as u64;
            done += n;
        }
        Ok(())
    }
}
