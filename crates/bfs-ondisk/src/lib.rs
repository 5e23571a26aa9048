#![forbid(unsafe_code)]
//! On-disk format decoding for HAMMER and HAMMER2 structures.
//!
//! Pure decoding crate: no I/O, no side effects. Turns byte slices into typed
//! views of volume headers, B-tree nodes and elements, blockrefs, inodes and
//! directory entries, and computes the directory-name hash keys each format
//! stores its entries under.

pub mod hammer;
pub mod hammer2;

pub use hammer::{
    BtreeElm, BtreeKey, BtreeNode, DirhashMode, ElmPayload, HammerDirEntry, HammerInode,
    HammerVolumeHeader, NodeType,
};
pub use hammer2::{Blockref, BlockrefType, Hammer2Inode, Hammer2VolumeHeader, InodeBody};
