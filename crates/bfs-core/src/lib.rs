#![forbid(unsafe_code)]
//! Format detection and the unified browsing API.
//!
//! [`init`] probes the configured backends in order and returns a
//! [`BootFs`] for the first one that recognizes the device. Every operation
//! after that goes through the [`FsOps`] trait, which both backends
//! implement with identical semantics.

pub use bfs_block::{ByteDevice, CacheStats, FileByteDevice, MemoryByteDevice};
pub use bfs_error::{BfsError, Result};
pub use bfs_hammer::{HammerFs, HammerOptions};
pub use bfs_hammer2::{Hammer2Fs, Hammer2Options};
pub use bfs_ondisk::hammer::DirhashMode;
pub use bfs_types::{Attrs, DirEntry, FileType, ObjectId};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Cache lines used when the options do not say otherwise.
pub const DEFAULT_CACHE_LINES: usize = 16;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsFormat {
    /// Ordered B-tree volumes.
    Hammer,
    /// Blockref-tree volumes.
    Hammer2,
}

impl fmt::Display for FsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hammer => "hammer",
            Self::Hammer2 => "hammer2",
        })
    }
}

/// Options controlling how a device is opened.
///
/// The block cache allocates `cache_lines` buffers of the format's block
/// unit (16 KiB or 64 KiB) up front. Decoded nodes and blockref arrays are
/// heap vectors bounded by the on-disk capacity constants, and are dropped
/// as soon as the operation that decoded them returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Backends tried by [`init`], in order.
    pub probe_order: Vec<FsFormat>,
    /// Block cache capacity. Zero is rejected.
    pub cache_lines: usize,
    pub hammer: HammerOptions,
    pub hammer2: Hammer2Options,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            probe_order: vec![FsFormat::Hammer, FsFormat::Hammer2],
            cache_lines: DEFAULT_CACHE_LINES,
            hammer: HammerOptions::default(),
            hammer2: Hammer2Options::default(),
        }
    }
}

impl OpenOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(text)
            .map_err(|err| BfsError::InvalidConfig(format!("options: {err}")))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_lines == 0 {
            return Err(BfsError::InvalidConfig(
                "cache_lines must be at least 1".to_owned(),
            ));
        }
        if self.probe_order.is_empty() {
            return Err(BfsError::InvalidConfig(
                "probe_order names no format".to_owned(),
            ));
        }
        Ok(())
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

/// Read-only browsing operations shared by both formats.
///
/// - Object handles are opaque ([`ObjectId`]); any handle returned by
///   `lookup` or `readdir` is valid input to the other operations.
/// - Errors map to POSIX errnos via [`BfsError::to_errno()`].
/// - Nothing is ever written to the device.
pub trait FsOps: Send + Sync {
    fn format(&self) -> FsFormat;

    /// Handle of the root directory.
    fn root(&self) -> ObjectId;

    /// Resolve a slash-separated path from the root.
    ///
    /// Empty components are skipped; `.` and `..` are honored. Returns
    /// `NotFound` when a component is missing and `NotDirectory` when a
    /// non-final component is not a directory.
    fn lookup(&self, path: &str) -> Result<ObjectId>;

    /// Attributes of `obj`. Calling it twice yields the same value.
    fn stat(&self, obj: ObjectId) -> Result<Attrs>;

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns `min(buf.len(), size - offset)` bytes (0 at or past EOF);
    /// holes read as zero. Reading a directory is `IsDirectory`.
    fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Next entry of directory `obj` at or after `cookie`.
    ///
    /// Start with cookie 0; the call advances it. `.` and `..` come first.
    /// `None` marks the end of the directory.
    fn readdir(&self, obj: ObjectId, cookie: &mut u64) -> Result<Option<DirEntry>>;
}

impl FsOps for HammerFs {
    fn format(&self) -> FsFormat {
        FsFormat::Hammer
    }

    fn root(&self) -> ObjectId {
        HammerFs::root(self)
    }

    fn lookup(&self, path: &str) -> Result<ObjectId> {
        HammerFs::lookup(self, path)
    }

    fn stat(&self, obj: ObjectId) -> Result<Attrs> {
        HammerFs::stat(self, obj)
    }

    fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        HammerFs::read(self, obj, offset, buf)
    }

    fn readdir(&self, obj: ObjectId, cookie: &mut u64) -> Result<Option<DirEntry>> {
        HammerFs::readdir(self, obj, cookie)
    }
}

impl FsOps for Hammer2Fs {
    fn format(&self) -> FsFormat {
        FsFormat::Hammer2
    }

    fn root(&self) -> ObjectId {
        Hammer2Fs::root(self)
    }

    fn lookup(&self, path: &str) -> Result<ObjectId> {
        Hammer2Fs::lookup(self, path)
    }

    fn stat(&self, obj: ObjectId) -> Result<Attrs> {
        Hammer2Fs::stat(self, obj)
    }

    fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Hammer2Fs::read(self, obj, offset, buf)
    }

    fn readdir(&self, obj: ObjectId, cookie: &mut u64) -> Result<Option<DirEntry>> {
        Hammer2Fs::readdir(self, obj, cookie)
    }
}

// ── BootFs ──────────────────────────────────────────────────────────────────

/// An opened boot volume of either format.
#[derive(Debug)]
pub enum BootFs {
    Hammer(HammerFs),
    Hammer2(Hammer2Fs),
}

/// Probe `dev` with each backend in `opts.probe_order`.
///
/// `NotThisFormat` from one backend moves on to the next; any other error
/// means the device carries that format but cannot be used, and is returned
/// as is.
pub fn init(dev: Arc<dyn ByteDevice>, opts: &OpenOptions) -> Result<BootFs> {
    opts.validate()?;
    let mut declined = Vec::with_capacity(opts.probe_order.len());

    for format in &opts.probe_order {
        let attempt = match format {
            FsFormat::Hammer => {
                HammerFs::open(Arc::clone(&dev), opts.cache_lines, opts.hammer.clone())
                    .map(BootFs::Hammer)
            }
            FsFormat::Hammer2 => {
                Hammer2Fs::open(Arc::clone(&dev), opts.cache_lines, opts.hammer2.clone())
                    .map(BootFs::Hammer2)
            }
        };
        match attempt {
            Ok(fs) => {
                debug!(format = %format, "backend selected");
                return Ok(fs);
            }
            Err(err) if err.is_not_this_format() => {
                debug!(format = %format, reason = %err, "backend declined device");
                declined.push(format!("{format}: {err}"));
            }
            Err(err) => return Err(err),
        }
    }

    Err(BfsError::NotThisFormat(declined.join("; ")))
}

impl BootFs {
    /// Open an image file or block device.
    pub fn open(path: impl AsRef<Path>, opts: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        init(Arc::new(dev), opts)
    }

    fn ops(&self) -> &dyn FsOps {
        match self {
            Self::Hammer(fs) => fs,
            Self::Hammer2(fs) => fs,
        }
    }

    /// Block cache counters of the open volume.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        match self {
            Self::Hammer(fs) => fs.cache().stats(),
            Self::Hammer2(fs) => fs.cache().stats(),
        }
    }

    /// Every entry of directory `obj`, `.` and `..` included.
    pub fn list_dir(&self, obj: ObjectId) -> Result<Vec<DirEntry>> {
        let mut cookie = 0;
        let mut entries = Vec::new();
        while let Some(entry) = self.readdir(obj, &mut cookie)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Whole content of file `obj`.
    pub fn read_to_end(&self, obj: ObjectId) -> Result<Vec<u8>> {
        let size = self.stat(obj)?.size;
        let len = usize::try_from(size).map_err(|_| {
            BfsError::InvalidConfig(format!("file of {size} bytes does not fit in memory"))
        })?;
        let mut buf = vec![0_u8; len];
        let n = self.read(obj, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl FsOps for BootFs {
    fn format(&self) -> FsFormat {
        self.ops().format()
    }

    fn root(&self) -> ObjectId {
        self.ops().root()
    }

    fn lookup(&self, path: &str) -> Result<ObjectId> {
        self.ops().lookup(path)
    }

    fn stat(&self, obj: ObjectId) -> Result<Attrs> {
        self.ops().stat(obj)
    }

    fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ops().read(obj, offset, buf)
    }

    fn readdir(&self, obj: ObjectId, cookie: &mut u64) -> Result<Option<DirEntry>> {
        self.ops().readdir(obj, cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = OpenOptions::default();
        assert_eq!(opts.probe_order, [FsFormat::Hammer, FsFormat::Hammer2]);
        assert_eq!(opts.cache_lines, DEFAULT_CACHE_LINES);
        assert_eq!(opts.hammer.dirhash, DirhashMode::Stub);
        assert_eq!(opts.hammer.as_of, u64::MAX);
        assert_eq!(opts.hammer2.pfs, None);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn options_from_partial_json() {
        let opts = OpenOptions::from_json(
            r#"{"probe_order":["hammer2"],"hammer":{"dirhash":"crc32"},"hammer2":{"pfs":"BOOT"}}"#,
        )
        .unwrap();
        assert_eq!(opts.probe_order, [FsFormat::Hammer2]);
        assert_eq!(opts.cache_lines, DEFAULT_CACHE_LINES);
        assert_eq!(opts.hammer.dirhash, DirhashMode::Crc32);
        assert_eq!(opts.hammer.as_of, u64::MAX);
        assert_eq!(opts.hammer2.pfs.as_deref(), Some("BOOT"));
    }

    #[test]
    fn invalid_options_are_rejected() {
        for text in [
            r#"{"cache_lines":0}"#,
            r#"{"probe_order":[]}"#,
            r#"{"probe_order":["ufs"]}"#,
            "not json",
        ] {
            assert!(
                matches!(OpenOptions::from_json(text), Err(BfsError::InvalidConfig(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn init_checks_options_before_probing() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemoryByteDevice::from_vec(vec![0; 65_536]));
        let opts = OpenOptions {
            cache_lines: 0,
            ..OpenOptions::default()
        };
        assert!(matches!(init(dev, &opts), Err(BfsError::InvalidConfig(_))));
    }

    #[test]
    fn format_names() {
        assert_eq!(FsFormat::Hammer.to_string(), "hammer");
        assert_eq!(
            serde_json::to_string(&FsFormat::Hammer2).unwrap(),
            "\"hammer2\""
        );
    }
}
