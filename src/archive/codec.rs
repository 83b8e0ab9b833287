//! Header serialization shared by both archive formats.
use std::io::{Read, Write};

use super::{ArchiveError, ArchiveFormat, ArchiveIndex, Entry};
use crate::{ResourceId, TypeTag, TYPE_TAG_LEN};

fn read_array<R: Read, const N: usize>(input: &mut R) -> Result<[u8; N], ArchiveError> {
    let mut buf = [0u8; N];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u16<R: Read>(input: &mut R) -> Result<u16, ArchiveError> {
    Ok(u16::from_le_bytes(read_array(input)?))
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32, ArchiveError> {
    Ok(u32::from_le_bytes(read_array(input)?))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64, ArchiveError> {
    Ok(u64::from_le_bytes(read_array(input)?))
}

fn write_entry<W: Write>(
    out: &mut W,
    id: ResourceId,
    entry: &Entry,
    format: ArchiveFormat,
) -> Result<(), ArchiveError> {
    out.write_all(&id.to_le_bytes())?;
    out.write_all(&entry.file_offset.to_le_bytes())?;
    out.write_all(&entry.file_length.to_le_bytes())?;
    if format == ArchiveFormat::Deflate {
        let compressed = entry.compressed_length.ok_or_else(|| {
            ArchiveError::Integrity(format!("resource {} was never compressed", id))
        })?;
        out.write_all(&compressed.to_le_bytes())?;
    }
    out.write_all(entry.type_tag.as_bytes())?;
    // Length was checked when the entry entered the index.
    out.write_all(&(entry.filename.len() as u16).to_le_bytes())?;
    out.write_all(entry.filename.as_bytes())?;
    Ok(())
}

fn read_entry<R: Read>(
    input: &mut R,
    format: ArchiveFormat,
) -> Result<(ResourceId, Entry), ArchiveError> {
    let id = read_u32(input)?;
    let file_offset = read_u64(input)?;
    let file_length = read_u64(input)?;
    let compressed_length = match format {
        ArchiveFormat::Raw => None,
        ArchiveFormat::Deflate => Some(read_u64(input)?),
    };
    let type_tag = TypeTag::from_bytes(read_array::<_, TYPE_TAG_LEN>(input)?);

    let name_len = read_u16(input)? as usize;
    let mut name = vec![0u8; name_len];
    input.read_exact(&mut name)?;
    let filename = String::from_utf8(name)
        .map_err(|_| ArchiveError::Corrupt(format!("resource {} has a non UTF-8 name", id)))?;

    Ok((
        id,
        Entry {
            filename,
            type_tag,
            file_offset,
            file_length,
            compressed_length,
        },
    ))
}

/// Write the entry count followed by every entry in ascending id order.
pub(crate) fn write_header<W: Write>(
    out: &mut W,
    index: &ArchiveIndex,
    format: ArchiveFormat,
) -> Result<(), ArchiveError> {
    let count = u32::try_from(index.len())
        .map_err(|_| ArchiveError::Integrity("too many entries for one archive".into()))?;
    out.write_all(&count.to_le_bytes())?;
    for (id, entry) in index.entries() {
        write_entry(out, id, entry, format)?;
    }
    Ok(())
}

pub(crate) fn read_header<R: Read>(
    input: &mut R,
    format: ArchiveFormat,
) -> Result<ArchiveIndex, ArchiveError> {
    let count = read_u32(input)?;
    let mut index = ArchiveIndex::new();
    for _ in 0..count {
        let (id, entry) = read_entry(input, format)?;
        index.insert(id, entry).map_err(|e| match e {
            ArchiveError::DuplicateResource(id) => {
                ArchiveError::Corrupt(format!("resource {} appears twice in the header", id))
            }
            other => other,
        })?;
    }
    Ok(index)
}
