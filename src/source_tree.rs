use std::fs::File;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

use crate::archive::ArchiveError;

/// The directory tracked source files are packed from.
///
/// Filenames in the packer index are keys like `textures/a.png`, resolved against this root.  This handles the rather
/// tricky path cases around Windows and Linux differences, and refuses names which use relative segments to escape the
/// root, primarily as a measure to detect bugs in the index.
#[derive(Clone, Debug)]
pub struct SourceTree {
    root_path: PathBuf,
}

fn conv_path(name: &str) -> Result<relative_path::RelativePathBuf, ArchiveError> {
    relative_path::RelativePathBuf::from_path(name)
        .map_err(|_| ArchiveError::SourcePath(name.to_string()))
}

impl SourceTree {
    pub fn new(root_path: &Path) -> SourceTree {
        SourceTree {
            root_path: root_path.to_path_buf(),
        }
    }

    /// Resolve a tracked filename to a path under the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ArchiveError> {
        // On Windows, canonicalize is currently very broken when relative path segments appear in the middle of a
        // path, and stdlib doesn't help us out. Go via `RelativePathBuf` to clean it up.
        let absolute = conv_path(name)?.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) {
            return Err(ArchiveError::SourcePath(name.to_string()));
        }
        Ok(absolute)
    }

    ///
    /// A tracked file which no longer exists is an [ArchiveError::Integrity] failure: the index and the tree disagree.
    pub fn open(&self, name: &str) -> Result<File, ArchiveError> {
        let path = self.resolve(name)?;
        File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                ArchiveError::Integrity(format!("missing source file {}", path.display()))
            }
            _ => ArchiveError::Io(Error::new(
                e.kind(),
                format!("failed to open source file {}: {}", path.display(), e),
            )),
        })
    }

    /// Current size of a tracked file.
    pub fn file_len(&self, name: &str) -> Result<u64, ArchiveError> {
        let meta = self.open(name)?.metadata()?;
        if !meta.is_file() {
            return Err(ArchiveError::Io(Error::new(
                ErrorKind::Other,
                format!("{} is not a regular file", name),
            )));
        }
        Ok(meta.len())
    }
}
