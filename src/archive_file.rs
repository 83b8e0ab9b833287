use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::archive::{Archive, ArchiveError, ArchiveFormat};
use crate::*;

/// An archive on disk, opened when the cache is initialized.
///
/// Every method other than [ResourceFile::open] fails with [ArchiveError::NotOpen] until the archive has been opened.
#[derive(Debug)]
pub struct ArchiveFile {
    path: PathBuf,
    format: ArchiveFormat,
    archive: OnceLock<Archive<BufReader<File>>>,
}

impl ArchiveFile {
    pub fn new(path: impl AsRef<Path>, format: ArchiveFormat) -> ArchiveFile {
        ArchiveFile {
            path: path.as_ref().to_path_buf(),
            format,
            archive: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive(&self) -> Result<&Archive<BufReader<File>>, ArchiveError> {
        self.archive.get().ok_or(ArchiveError::NotOpen)
    }
}

impl ResourceFile for ArchiveFile {
    fn open(&self) -> Result<(), ArchiveError> {
        if self.archive.get().is_some() {
            return Ok(());
        }

        let file = File::open(&self.path)?;
        let archive = Archive::bind(BufReader::new(file), self.format)?;
        // Losing a race with another opener is fine; both bound the same file.
        let _ = self.archive.set(archive);
        Ok(())
    }

    fn raw_resource_size(&self, id: ResourceId) -> Result<u64, ArchiveError> {
        self.archive()?.raw_size(id)
    }

    fn raw_resource(&self, id: ResourceId, dest: &mut [u8]) -> Result<(), ArchiveError> {
        self.archive()?.read_into(id, dest)
    }

    fn num_resources(&self) -> Result<usize, ArchiveError> {
        Ok(self.archive()?.len())
    }

    fn resource_id(&self, index: usize) -> Result<ResourceId, ArchiveError> {
        self.archive()?.id_at(index)
    }

    fn resource_name(&self, id: ResourceId) -> Result<String, ArchiveError> {
        Ok(self.archive()?.name(id)?.to_string())
    }

    fn resource_type(&self, id: ResourceId) -> Result<TypeTag, ArchiveError> {
        self.archive()?.type_tag(id)
    }
}
