#![forbid(unsafe_code)]
//! Test tooling for bootfs.
//!
//! Builds complete HAMMER and HAMMER2 volumes in memory, provides a sparse
//! device for images whose header copies sit gigabytes apart, and converts
//! images to and from the sparse JSON fixture format.

pub mod hammer2_image;
pub mod hammer_image;
pub mod sparse;

pub use hammer_image::HammerImageBuilder;
pub use hammer2_image::{Hammer2ImageBuilder, hammer2_header_copy};
pub use sparse::SparseByteDevice;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Image stored as its length plus the non-zero runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

impl SparseFixture {
    /// Capture every non-zero run of `image`.
    ///
    /// Runs separated by fewer than `merge_gap` zero bytes are merged.
    #[must_use]
    pub fn from_image(image: &[u8], merge_gap: usize) -> Self {
        let mut writes: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;
        while i < image.len() {
            if image[i] == 0 {
                i += 1;
                continue;
            }
            let start = i;
            while i < image.len() && image[i] != 0 {
                i += 1;
            }
            match writes.last_mut() {
                Some((_, end)) if start - *end < merge_gap => *end = i,
                _ => writes.push((start, i)),
            }
        }

        Self {
            size: image.len(),
            writes: writes
                .into_iter()
                .map(|(start, end)| FixtureWrite {
                    offset: start,
                    hex: hex::encode(&image[start..end]),
                })
                .collect(),
        }
    }

    pub fn to_image(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0_u8; self.size];
        for write in &self.writes {
            let payload = hex::decode(&write.hex)
                .with_context(|| format!("invalid hex at offset {}", write.offset))?;
            let end = write
                .offset
                .checked_add(payload.len())
                .context("fixture offset overflow")?;
            if end > bytes.len() {
                bail!(
                    "fixture write out of bounds: offset={} payload={} size={}",
                    write.offset,
                    payload.len(),
                    bytes.len()
                );
            }
            bytes[write.offset..end].copy_from_slice(&payload);
        }
        Ok(bytes)
    }
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    fixture.to_image()
}

pub fn save_sparse_fixture(path: &Path, image: &[u8]) -> Result<()> {
    let fixture = SparseFixture::from_image(image, 32);
    let text = serde_json::to_string_pretty(&fixture)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Ordered sample tree used by the fixture generator and the CLI tests.
///
/// `/boot/kernel` (70 000 bytes), `/boot/loader.conf`, `/etc/motd` and a
/// sparse `/var/sparse.img`.
pub fn sample_hammer_image() -> Result<Vec<u8>> {
    let mut b = HammerImageBuilder::new().with_label("BOOT");
    let root = b.root();
    let boot = b.mkdir(root, "boot")?;
    b.add_file(boot, "kernel", &sample_kernel())?;
    b.add_file(boot, "loader.conf", b"autoboot_delay=\"3\"\n")?;
    let etc = b.mkdir_local(root, "etc")?;
    b.add_file(etc, "motd", b"DragonFly boot volume\n")?;
    let var = b.mkdir(root, "var")?;
    b.add_sparse_file(var, "sparse.img", 1 << 20, &[(4096, vec![0x5A; 4096])])?;
    Ok(b.build())
}

/// Same tree as [`sample_hammer_image`] on a HAMMER2 volume.
pub fn sample_hammer2_image() -> Result<Vec<u8>> {
    let mut b = Hammer2ImageBuilder::new();
    let root = b.root();
    let boot = b.mkdir(root, "boot")?;
    b.add_file(boot, "kernel", &sample_kernel())?;
    b.add_file(boot, "loader.conf", b"autoboot_delay=\"3\"\n")?;
    let etc = b.mkdir(root, "etc")?;
    b.add_file(etc, "motd", b"DragonFly boot volume\n")?;
    let var = b.mkdir(root, "var")?;
    b.add_sparse_file(var, "sparse.img", 1 << 20, &[(65536, vec![0x5A; 4096])])?;
    b.build()
}

/// Deterministic, non-repeating kernel-sized payload.
#[must_use]
pub fn sample_kernel() -> Vec<u8> {
    (0..70_000_u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_fixture_round_trips_through_json() {
        let mut image = vec![0_u8; 4096];
        image[10..14].copy_from_slice(b"ABCD");
        image[20] = 1;
        image[3000..3002].copy_from_slice(&[9, 9]);

        let fixture = SparseFixture::from_image(&image, 32);
        assert_eq!(fixture.writes.len(), 2, "nearby runs are merged");
        assert_eq!(fixture.to_image().unwrap(), image);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.json");
        save_sparse_fixture(&path, &image).unwrap();
        assert_eq!(load_sparse_fixture(&path).unwrap(), image);
    }

    #[test]
    fn out_of_bounds_fixture_is_rejected() {
        let fixture = SparseFixture {
            size: 4,
            writes: vec![FixtureWrite {
                offset: 2,
                hex: "aabbcc".into(),
            }],
        };
        assert!(fixture.to_image().is_err());
    }

    #[test]
    fn sample_images_build() {
        let h = sample_hammer_image().unwrap();
        assert_eq!(h.len() % 16_384, 0);
        let h2 = sample_hammer2_image().unwrap();
        assert_eq!(h2.len() % 65_536, 0);
    }
}
