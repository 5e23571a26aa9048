#![forbid(unsafe_code)]
//! Block I/O layer with a fixed-capacity LRU block cache.
//!
//! Provides the `ByteDevice` trait the host implements, file- and
//! memory-backed devices, and `BlockCache`, which turns arbitrary metadata and
//! data reads into whole, aligned block reads against a small table of reused
//! buffers.

use bfs_error::{BfsError, Result};
use bfs_types::ByteOffset;
use parking_lot::Mutex;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed, read-only device (pread semantics).
///
/// This is the single primitive consumed from the host. The cache only ever
/// asks for one whole block at a block-aligned offset.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes, as far as the host knows it.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: ByteOffset, len: usize, dev_len: u64) -> Result<()> {
    let len = u64::try_from(len).map_err(|_| io::Error::other("read length overflows u64"))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| io::Error::other("read range overflows u64"))?;
    if end.0 > dev_len {
        return Err(BfsError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read out of bounds: offset={offset} len={len} device_len={dev_len}"),
        )));
    }
    Ok(())
}

/// File-backed device using `pread`-style positioned reads.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }
}

/// Device over an image already loaded into memory.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<[u8]>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset.0)
            .map_err(|_| io::Error::other("offset does not fit usize"))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Hit/miss counters for a [`BlockCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct CacheLine {
    /// Aligned device offset currently held, `None` when the line is empty
    /// or its last read failed.
    resident: Option<u64>,
    last_use: u64,
    buf: Box<[u8]>,
}

#[derive(Debug)]
struct CacheState {
    lines: Vec<CacheLine>,
    clock: u64,
    stats: CacheStats,
}

impl CacheState {
    fn find(&self, aligned: u64) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| line.resident == Some(aligned))
    }

    /// Index of the least recently used line; ties go to the earliest line.
    fn victim(&self) -> usize {
        let mut victim = 0;
        for (idx, line) in self.lines.iter().enumerate() {
            if line.last_use < self.lines[victim].last_use {
                victim = idx;
            }
        }
        victim
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Fixed-capacity block cache with least-recently-used eviction.
///
/// Lines are allocated once in [`BlockCache::new`] and reused for the life of
/// the cache. A line holds exactly one aligned block; there is no partial
/// validity. Buffers are lent to a closure for the duration of one call and
/// can never be retained across fetches.
///
/// The closures passed to `with_block`/`with_bytes` must not call back into
/// the same cache.
pub struct BlockCache {
    dev: Arc<dyn ByteDevice>,
    block_size: u32,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockCache")
            .field("block_size", &self.block_size)
            .field("lines", &state.lines.len())
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Create a cache of `lines` buffers of `block_size` bytes each.
    pub fn new(dev: Arc<dyn ByteDevice>, block_size: u32, lines: usize) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(BfsError::InvalidConfig(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        if lines == 0 {
            return Err(BfsError::InvalidConfig(
                "block cache needs at least one line".to_owned(),
            ));
        }
        let bs = usize::try_from(block_size)
            .map_err(|_| BfsError::InvalidConfig("block_size does not fit usize".to_owned()))?;
        let lines = (0..lines)
            .map(|_| CacheLine {
                resident: None,
                last_use: 0,
                buf: vec![0_u8; bs].into_boxed_slice(),
            })
            .collect();
        Ok(Self {
            dev,
            block_size,
            state: Mutex::new(CacheState {
                lines,
                clock: 0,
                stats: CacheStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().lines.len()
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.dev
    }

    /// Round `offset` down to the block unit.
    #[must_use]
    pub fn align(&self, offset: u64) -> u64 {
        ByteOffset(offset).align_down(u64::from(self.block_size)).0
    }

    /// Whether the block at `aligned` is currently held by a line.
    #[must_use]
    pub fn is_resident(&self, aligned: u64) -> bool {
        self.state.lock().find(aligned).is_some()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Fetch the block at `aligned` and lend its bytes to `f`.
    pub fn with_block<R>(&self, aligned: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if !ByteOffset(aligned).is_aligned(u64::from(self.block_size)) {
            return Err(BfsError::corrupt(
                aligned,
                format!("unaligned block fetch (block_size={})", self.block_size),
            ));
        }

        let mut state = self.state.lock();
        let now = state.tick();
        if let Some(idx) = state.find(aligned) {
            state.stats.hits += 1;
            let line = &mut state.lines[idx];
            line.last_use = now;
            trace!(offset = aligned, line = idx, "block cache hit");
            return Ok(f(&line.buf));
        }

        let idx = state.victim();
        state.stats.misses += 1;
        let line = &mut state.lines[idx];
        trace!(
            offset = aligned,
            line = idx,
            evicted = ?line.resident,
            "block cache miss"
        );
        line.resident = None;
        self.dev.read_exact_at(ByteOffset(aligned), &mut line.buf)?;
        line.resident = Some(aligned);
        line.last_use = now;
        Ok(f(&line.buf))
    }

    /// Lend `len` bytes starting at `offset` to `f`.
    ///
    /// The range must lie inside a single block; on-disk structures never
    /// straddle the block unit, so a range that does is reported as corrupt.
    pub fn with_bytes<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let aligned = self.align(offset);
        let start = usize::try_from(offset - aligned)
            .map_err(|_| BfsError::corrupt(offset, "block offset does not fit usize"))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.block_size as usize)
            .ok_or_else(|| {
                BfsError::corrupt(
                    offset,
                    format!(
                        "{len}-byte structure crosses a {}-byte block boundary",
                        self.block_size
                    ),
                )
            })?;
        self.with_block(aligned, |block| f(&block[start..end]))
    }

    /// Copy bytes starting at `offset` into `out`, stopping at the end of the
    /// block that contains `offset`. Returns the number of bytes copied.
    pub fn copy_within_block(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let aligned = self.align(offset);
        let start = usize::try_from(offset - aligned)
            .map_err(|_| BfsError::corrupt(offset, "block offset does not fit usize"))?;
        let n = out.len().min(self.block_size as usize - start);
        self.with_block(aligned, |block| {
            out[..n].copy_from_slice(&block[start..start + n]);
        })?;
        Ok(n)
    }
}

// ── Sparse extent reads ─────────────────────────────────────────────────────

/// One stored run of file data as seen by the read loop.
///
/// The extent covers file bytes `[start, end)`. Only the first `stored` of
/// them are backed by device bytes at `physical`; the rest read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
    pub stored: u64,
    pub physical: u64,
}

impl Extent {
    fn contains(&self, file_off: u64) -> bool {
        self.start <= file_off && file_off < self.end
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Fill `out` with file bytes starting at `offset`.
///
/// `find(file_off)` returns the lowest extent whose covered range ends after
/// `file_off`, or `None` when no data follows. Holes before, between and
/// after extents read as zero. The caller clamps `out` to the file size; the
/// return value is always `out.len()`.
pub fn read_extents(
    cache: &BlockCache,
    offset: u64,
    out: &mut [u8],
    mut find: impl FnMut(u64) -> Result<Option<Extent>>,
) -> Result<usize> {
    let len = out.len();
    let mut pos = 0_usize;
    let mut current: Option<Extent> = None;

    while pos < len {
        let file_off = offset + pos as u64;
        let remaining = len - pos;
        let ext = match current.filter(|ext| ext.contains(file_off)) {
            Some(ext) => ext,
            None => match find(file_off)? {
                Some(ext) if ext.end <= file_off => {
                    return Err(BfsError::corrupt(
                        ext.physical,
                        format!("extent [{}, {}) ends before {file_off}", ext.start, ext.end),
                    ));
                }
                Some(ext) => ext,
                None => {
                    out[pos..].fill(0);
                    break;
                }
            },
        };
        current = Some(ext);

        if ext.start > file_off {
            let gap = ext.start - file_off;
            if gap >= remaining as u64 {
                out[pos..].fill(0);
                break;
            }
            let gap = to_usize(gap);
            out[pos..pos + gap].fill(0);
            pos += gap;
            continue;
        }

        let within = file_off - ext.start;
        let covered = to_usize(ext.end - file_off).min(remaining);
        if within >= ext.stored {
            out[pos..pos + covered].fill(0);
            pos += covered;
            continue;
        }
        let n = covered.min(to_usize(ext.stored - within));
        pos += cache.copy_within_block(ext.physical + within, &mut out[pos..pos + n])?;
    }

    Ok(len)
}
