//! The two seams of the cache.
//!
//! A [ResourceFile] is where raw resource bytes come from, usually a packed archive.  A [ResourceLoader] decides what
//! those bytes become in memory: either they are used verbatim, or the loader turns them into a differently sized
//! representation.
use std::io::{Read, Seek};

use crate::archive::{Archive, ArchiveError};
use crate::TypeTag;

/// Identifies one entry of an archive.  Stable once assigned.
pub type ResourceId = u32;

/// The store of raw resources the cache reads from.
///
/// Implementations are shared between every loading thread, so reads must be safe to issue concurrently.
pub trait ResourceFile: Send + Sync + 'static {
    /// Make the file ready for reading.  Called once by [crate::ResourceCache::init].
    fn open(&self) -> Result<(), ArchiveError>;

    /// Size of the buffer [ResourceFile::raw_resource] fills.
    fn raw_resource_size(&self, id: ResourceId) -> Result<u64, ArchiveError>;

    /// Fill `dest` with the resource's bytes.  `dest` is exactly [ResourceFile::raw_resource_size] long.
    fn raw_resource(&self, id: ResourceId, dest: &mut [u8]) -> Result<(), ArchiveError>;

    fn num_resources(&self) -> Result<usize, ArchiveError>;

    /// The id at position `index`, in a stable enumeration order.
    fn resource_id(&self, index: usize) -> Result<ResourceId, ArchiveError>;

    fn resource_name(&self, id: ResourceId) -> Result<String, ArchiveError>;

    fn resource_type(&self, id: ResourceId) -> Result<TypeTag, ArchiveError>;
}

/// A loader failed to make sense of a resource's raw bytes.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct LoaderError(pub String);

/// Turns raw resource bytes into their in-memory form, for one resource type.
pub trait ResourceLoader: Send + Sync + 'static {
    /// The type tag this loader handles.
    fn pattern(&self) -> TypeTag;

    /// If true, the raw bytes are the resource and the other methods are never called.
    fn use_raw_file(&self) -> bool;

    /// How many bytes the loaded form of `raw` needs.
    fn loaded_resource_size(&self, raw: &[u8]) -> Result<u64, LoaderError>;

    /// Fill `dest`, which is exactly [ResourceLoader::loaded_resource_size] bytes, from `raw`.
    fn load_resource(&self, raw: &[u8], dest: &mut [u8]) -> Result<(), LoaderError>;
}

impl<R: Read + Seek + Send + 'static> ResourceFile for Archive<R> {
    fn open(&self) -> Result<(), ArchiveError> {
        // Binding already read the index.
        Ok(())
    }

    fn raw_resource_size(&self, id: ResourceId) -> Result<u64, ArchiveError> {
        self.raw_size(id)
    }

    fn raw_resource(&self, id: ResourceId, dest: &mut [u8]) -> Result<(), ArchiveError> {
        self.read_into(id, dest)
    }

    fn num_resources(&self) -> Result<usize, ArchiveError> {
        Ok(self.len())
    }

    fn resource_id(&self, index: usize) -> Result<ResourceId, ArchiveError> {
        self.id_at(index)
    }

    fn resource_name(&self, id: ResourceId) -> Result<String, ArchiveError> {
        self.name(id).map(str::to_string)
    }

    fn resource_type(&self, id: ResourceId) -> Result<TypeTag, ArchiveError> {
        self.type_tag(id)
    }
}
