//! The archive index: resource ids mapped to where and what each entry is.
use std::collections::BTreeMap;

use super::{ArchiveError, ArchiveFormat};
use crate::{ResourceId, SourceTree, TypeTag, TYPE_TAG_LEN};

/// One packed resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub filename: String,
    pub type_tag: TypeTag,
    /// Absolute position of the entry's bytes in the archive.
    pub file_offset: u64,
    /// Size of the resource once read, i.e. before compression.
    pub file_length: u64,
    /// Size of the stored zlib stream; only present in [ArchiveFormat::Deflate] archives.
    pub compressed_length: Option<u64>,
}

impl Entry {
    fn new(filename: String, type_tag: TypeTag) -> Entry {
        Entry {
            filename,
            type_tag,
            file_offset: 0,
            file_length: 0,
            compressed_length: None,
        }
    }

    /// Number of bytes this entry occupies in the data region.
    pub fn stored_length(&self) -> u64 {
        self.compressed_length.unwrap_or(self.file_length)
    }

    /// Serialized size of this entry in the header.
    fn header_cost(&self, format: ArchiveFormat) -> u64 {
        let lengths = match format {
            ArchiveFormat::Raw => 2,
            ArchiveFormat::Deflate => 3,
        };
        (std::mem::size_of::<ResourceId>()
            + std::mem::size_of::<u64>() * lengths
            + TYPE_TAG_LEN
            + std::mem::size_of::<u16>()
            + self.filename.len()) as u64
    }
}

/// Ordered map of resource id to [Entry], plus the order in which ids were added.
///
/// Entries are always laid out and serialized in ascending id order; the insertion order only backs
/// [ArchiveIndex::id_at], so enumerating by position is stable for a given archive.
#[derive(Clone, Debug, Default)]
pub struct ArchiveIndex {
    entries: BTreeMap<ResourceId, Entry>,
    order: Vec<ResourceId>,
}

impl ArchiveIndex {
    pub fn new() -> ArchiveIndex {
        Default::default()
    }

    /// Track a new file.  Offsets and lengths are filled in later by [ArchiveIndex::prepare_file_info] or by the
    /// writer.
    pub fn add_entry(
        &mut self,
        id: ResourceId,
        filename: &str,
        type_tag: TypeTag,
    ) -> Result<(), ArchiveError> {
        self.insert(id, Entry::new(filename.to_string(), type_tag))
    }

    /// Insert a fully described entry, as read back from an archive header.
    pub fn insert(&mut self, id: ResourceId, entry: Entry) -> Result<(), ArchiveError> {
        if entry.filename.len() > u16::MAX as usize {
            return Err(ArchiveError::Integrity(format!(
                "filename of resource {} is {} bytes long",
                id,
                entry.filename.len()
            )));
        }
        if self.entries.contains_key(&id) {
            return Err(ArchiveError::DuplicateResource(id));
        }

        self.entries.insert(id, entry);
        self.order.push(id);
        Ok(())
    }

    pub fn entry(&self, id: ResourceId) -> Result<&Entry, ArchiveError> {
        self.entries
            .get(&id)
            .ok_or(ArchiveError::UnknownResource(id))
    }

    pub(crate) fn entry_mut(&mut self, id: ResourceId) -> Result<&mut Entry, ArchiveError> {
        self.entries
            .get_mut(&id)
            .ok_or(ArchiveError::UnknownResource(id))
    }

    /// The id added `index`-th.
    pub fn id_at(&self, index: usize) -> Result<ResourceId, ArchiveError> {
        self.order
            .get(index)
            .copied()
            .ok_or(ArchiveError::IndexOutOfRange {
                index,
                len: self.order.len(),
            })
    }

    /// Iterate entries in ascending id order, which is also their order on disk.
    pub fn entries(&self) -> impl Iterator<Item = (ResourceId, &Entry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub(crate) fn ids(&self) -> Vec<ResourceId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact serialized size of the header: the entry count plus every entry.
    pub fn header_size(&self, format: ArchiveFormat) -> u64 {
        let count = std::mem::size_of::<u32>() as u64;
        self.entries
            .values()
            .map(|e| e.header_cost(format))
            .fold(count, |acc, cost| acc + cost)
    }

    /// Stat every source file and lay the entries out back to back after the raw header.
    pub fn prepare_file_info(&mut self, sources: &SourceTree) -> Result<(), ArchiveError> {
        let mut pos = self.header_size(ArchiveFormat::Raw);
        for entry in self.entries.values_mut() {
            let len = sources.file_len(&entry.filename)?;
            entry.file_offset = pos;
            entry.file_length = len;
            entry.compressed_length = None;
            pos += len;
        }
        Ok(())
    }

    /// Check that entries tile the data region without gaps or overlaps.
    ///
    /// Returns the end of the data region.
    pub fn verify_layout(&self, format: ArchiveFormat) -> Result<u64, ArchiveError> {
        let mut expected = self.header_size(format);
        for (id, entry) in self.entries() {
            if entry.file_offset != expected {
                return Err(ArchiveError::Corrupt(format!(
                    "resource {} starts at {}, expected {}",
                    id, entry.file_offset, expected
                )));
            }
            if format == ArchiveFormat::Deflate && entry.compressed_length.is_none() {
                return Err(ArchiveError::Corrupt(format!(
                    "resource {} has no compressed length",
                    id
                )));
            }
            expected = expected
                .checked_add(entry.stored_length())
                .ok_or_else(|| ArchiveError::Corrupt(format!("resource {} overflows", id)))?;
        }
        Ok(expected)
    }
}
