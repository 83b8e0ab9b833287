use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

use super::codec::read_header;
use super::{deflate, ArchiveError, ArchiveFormat, ArchiveIndex};
use crate::{ResourceId, TypeTag};

/// Deflate cannot expand data by more than this factor, so a larger claimed length means a corrupt header.
const MAX_INFLATE_RATIO: u64 = 1032;

/// A bound archive: the index read eagerly, and the stream kept open for random access to entries.
///
/// The stream's position is shared state, so each seek and the read that follows it happen under one lock.
/// Decompression runs outside the lock.
#[derive(Debug)]
pub struct Archive<R> {
    index: ArchiveIndex,
    format: ArchiveFormat,
    stream: Mutex<R>,
}

impl<R: Read + Seek> Archive<R> {
    /// Read the header from the start of `stream` and keep the stream for later reads.
    pub fn bind(mut stream: R, format: ArchiveFormat) -> Result<Archive<R>, ArchiveError> {
        stream.seek(SeekFrom::Start(0))?;
        let index = read_header(&mut stream, format)?;
        let data_end = index.verify_layout(format)?;

        if format == ArchiveFormat::Deflate {
            for (id, entry) in index.entries() {
                if entry.file_length > entry.stored_length().saturating_mul(MAX_INFLATE_RATIO) {
                    return Err(ArchiveError::Corrupt(format!(
                        "resource {} claims {} bytes from {} compressed",
                        id,
                        entry.file_length,
                        entry.stored_length()
                    )));
                }
            }
        }

        let stream_end = stream.seek(SeekFrom::End(0))?;
        if stream_end < data_end {
            return Err(ArchiveError::Corrupt(format!(
                "archive is {} bytes but its entries need {}",
                stream_end, data_end
            )));
        }

        tracing::info!(entries = index.len(), format = ?format, "Bound resource archive");
        Ok(Archive {
            index,
            format,
            stream: Mutex::new(stream),
        })
    }

    /// Size of a resource once read, which for compressed archives is the inflated size.
    pub fn raw_size(&self, id: ResourceId) -> Result<u64, ArchiveError> {
        Ok(self.index.entry(id)?.file_length)
    }

    /// Read a resource into `dest`, which must be exactly [Archive::raw_size] bytes long.
    pub fn read_into(&self, id: ResourceId, dest: &mut [u8]) -> Result<(), ArchiveError> {
        let entry = self.index.entry(id)?;
        if dest.len() as u64 != entry.file_length {
            return Err(ArchiveError::Integrity(format!(
                "buffer for resource {} is {} bytes, entry is {}",
                id,
                dest.len(),
                entry.file_length
            )));
        }

        match self.format {
            ArchiveFormat::Raw => self.read_stored(entry.file_offset, dest),
            ArchiveFormat::Deflate => {
                let mut compressed = vec![0u8; entry.stored_length() as usize];
                self.read_stored(entry.file_offset, &mut compressed)?;
                deflate::inflate_exact(id, &compressed, dest)
            }
        }
    }

    /// Read a whole resource into a new buffer.
    pub fn extract(&self, id: ResourceId) -> Result<Vec<u8>, ArchiveError> {
        let size = self.raw_size(id)?;
        let too_large = || ArchiveError::Corrupt(format!("resource {} claims {} bytes", id, size));
        let len = usize::try_from(size).map_err(|_| too_large())?;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| too_large())?;
        out.resize(len, 0);
        self.read_into(id, &mut out)?;
        Ok(out)
    }

    fn read_stored(&self, offset: u64, dest: &mut [u8]) -> Result<(), ArchiveError> {
        let mut stream = self.stream.lock().unwrap();
        stream.seek(SeekFrom::Start(offset))?;
        stream.read_exact(dest)?;
        Ok(())
    }
}

impl<R> Archive<R> {
    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn id_at(&self, index: usize) -> Result<ResourceId, ArchiveError> {
        self.index.id_at(index)
    }

    pub fn name(&self, id: ResourceId) -> Result<&str, ArchiveError> {
        Ok(&self.index.entry(id)?.filename)
    }

    pub fn type_tag(&self, id: ResourceId) -> Result<TypeTag, ArchiveError> {
        Ok(self.index.entry(id)?.type_tag)
    }
}
