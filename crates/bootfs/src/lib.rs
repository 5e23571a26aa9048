#![forbid(unsafe_code)]
//! bootfs public API facade.
//!
//! Re-exports `bfs-core`. Boot loaders, the CLI and other consumers depend
//! on this crate rather than on the backends directly.

pub use bfs_core::*;
