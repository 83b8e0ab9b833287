//! A budgeted cache of resources read from a packed, content-addressed archive.
//!
//! Games and similar programs ship their assets as one archive file: an index of typed, named entries keyed by a
//! stable numeric id, followed by the entry bytes, optionally zlib-compressed one entry at a time.  At runtime only
//! some of those assets fit in memory at once.  This crate provides both halves:
//!
//! - [PackWriter] and [PackerIndex] build archives from a directory of source files, and [Archive] reads them back.
//! - [ResourceCache] loads entries on demand through per-type [ResourceLoader]s and keeps the loaded bytes under a
//!   fixed budget, evicting the least recently used.  Evicted resources something still holds stay alive and are
//!   revived rather than re-read if asked for again.  Concurrent requests for one resource share a single load, and
//!   loads may run on a worker pool with callbacks via [ResourceCache::preload].
//!
//! To use the cache, open an [ArchiveFile] (or implement [ResourceFile] yourself), register loaders for the types that
//! need decoding, then call [ResourceCache::init].  Everything else is raw bytes through [RawLoader].
mod archive;
mod archive_file;
mod handle;
mod loaders;
mod lru_list;
mod packer_index;
mod resource_cache;
mod source_tree;
mod traits;
mod type_tag;
mod worker_pool;

pub use archive::deflate;
pub use archive::{Archive, ArchiveError, ArchiveFormat, ArchiveIndex, Entry, PackWriter};
pub use archive_file::*;
pub use handle::ResourceHandle;
pub use loaders::RawLoader;
pub use lru_list::*;
pub use packer_index::*;
pub use resource_cache::*;
pub use source_tree::*;
pub use traits::*;
pub use type_tag::*;
