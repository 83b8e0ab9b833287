//! The packed archive: an index of typed, named entries followed by their bytes in a single file.
//!
//! Two formats share one header shape:
//!
//! - [ArchiveFormat::Raw] concatenates entry bytes after the header, in ascending id order.
//! - [ArchiveFormat::Deflate] stores each entry as its own zlib stream and records the compressed length next to the
//!   raw length.  The writer emits the data region first and the header last, which is why the header size must be
//!   known before any entry is compressed.
//!
//! All integers are little-endian.
mod codec;
pub mod deflate;
mod index;
mod reader;
mod writer;

pub use index::*;
pub use reader::*;
pub use writer::*;

use crate::ResourceId;

/// Which of the two archive layouts a file uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Entry bytes are stored verbatim.
    Raw,
    /// Each entry is compressed with zlib.
    Deflate,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource {0} is not in the archive")]
    UnknownResource(ResourceId),
    #[error("resource index {index} is out of range ({len} resources)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("resource {0} was added twice")]
    DuplicateResource(ResourceId),
    #[error("resource type {0:?} is longer than 8 characters")]
    TypeTagTooLong(String),
    #[error("archive integrity check failed: {0}")]
    Integrity(String),
    #[error("archive is corrupt: {0}")]
    Corrupt(String),
    #[error("failed to decompress resource {id}: {reason}")]
    Decompression { id: ResourceId, reason: String },
    #[error("archive has not been opened")]
    NotOpen,
    #[error("malformed packer index line {line}: {content:?}")]
    MalformedIndexLine { line: usize, content: String },
    #[error("{0} is not tracked by the packer index")]
    NotTracked(String),
    #[error("invalid source path {0:?}")]
    SourcePath(String),
}
