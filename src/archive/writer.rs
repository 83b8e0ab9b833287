use std::io::{Read, Seek, SeekFrom, Write};

use flate2::Compression;

use super::codec::write_header;
use super::{deflate, ArchiveError, ArchiveFormat, ArchiveIndex};
use crate::{ResourceId, SourceTree, TypeTag};

/// Builds an archive from files under a [SourceTree].
///
/// For [ArchiveFormat::Raw], offsets are known up front from the size of each source file, so the header is written
/// first and every file is streamed after it.  For [ArchiveFormat::Deflate], the writer skips over the header, writes
/// every compressed entry, then seeks back and writes the header once the compressed sizes are known.
#[derive(Debug)]
pub struct PackWriter {
    index: ArchiveIndex,
    format: ArchiveFormat,
    level: Compression,
    sources: SourceTree,
    prepared: bool,
}

impl PackWriter {
    pub fn new(format: ArchiveFormat, sources: SourceTree) -> PackWriter {
        PackWriter {
            index: ArchiveIndex::new(),
            format,
            level: Compression::default(),
            sources,
            prepared: false,
        }
    }

    /// Set the zlib level used by [ArchiveFormat::Deflate].
    pub fn compression(mut self, level: Compression) -> PackWriter {
        self.level = level;
        self
    }

    pub fn add_file(
        &mut self,
        id: ResourceId,
        filename: &str,
        type_tag: TypeTag,
    ) -> Result<(), ArchiveError> {
        self.prepared = false;
        self.index.add_entry(id, filename, type_tag)
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Stat every source file and assign offsets.  Only meaningful for raw archives; [PackWriter::write] calls it if
    /// needed.
    pub fn prepare_file_info(&mut self) -> Result<(), ArchiveError> {
        self.index.prepare_file_info(&self.sources)?;
        self.prepared = true;
        Ok(())
    }

    /// Write the whole archive to `out`, which must be positioned at its start.
    pub fn write<W: Write + Seek>(&mut self, mut out: W) -> Result<(), ArchiveError> {
        match self.format {
            ArchiveFormat::Raw => self.write_raw(&mut out)?,
            ArchiveFormat::Deflate => self.write_deflate(&mut out)?,
        }
        out.flush()?;
        tracing::info!(
            entries = self.index.len(),
            format = ?self.format,
            "Wrote resource archive"
        );
        Ok(())
    }

    fn write_raw<W: Write + Seek>(&mut self, out: &mut W) -> Result<(), ArchiveError> {
        if !self.prepared {
            self.prepare_file_info()?;
        }

        write_header(out, &self.index, ArchiveFormat::Raw)?;
        for (id, entry) in self.index.entries() {
            let start = out.stream_position()?;
            if start != entry.file_offset {
                return Err(ArchiveError::Integrity(format!(
                    "resource {} at position {}, expected {}",
                    id, start, entry.file_offset
                )));
            }

            let source = self.sources.open(&entry.filename)?;
            let written = std::io::copy(&mut source.take(entry.file_length + 1), out)?;
            if written != entry.file_length {
                return Err(ArchiveError::Integrity(format!(
                    "wrote {} bytes for {}, expected {}",
                    written, entry.filename, entry.file_length
                )));
            }
        }
        Ok(())
    }

    fn write_deflate<W: Write + Seek>(&mut self, out: &mut W) -> Result<(), ArchiveError> {
        let header_size = self.index.header_size(ArchiveFormat::Deflate);
        out.seek(SeekFrom::Start(header_size))?;

        for id in self.index.ids() {
            let offset = out.stream_position()?;
            let entry = self.index.entry_mut(id)?;

            let mut raw = vec![];
            self.sources
                .open(&entry.filename)?
                .read_to_end(&mut raw)?;
            let compressed = deflate::compress(&raw, self.level)?;
            out.write_all(&compressed)?;

            entry.file_offset = offset;
            entry.file_length = raw.len() as u64;
            entry.compressed_length = Some(compressed.len() as u64);
        }

        out.seek(SeekFrom::Start(0))?;
        write_header(out, &self.index, ArchiveFormat::Deflate)?;
        let end = out.stream_position()?;
        if end != header_size {
            return Err(ArchiveError::Integrity(format!(
                "header is {} bytes, expected {}",
                end, header_size
            )));
        }
        // Leave the stream at the end of the archive.
        out.seek(SeekFrom::End(0))?;
        Ok(())
    }
}
