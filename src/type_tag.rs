//! The 8-byte, space-padded tag naming the type of a packed resource.
use std::fmt;

use crate::archive::ArchiveError;

/// Width of a type tag on disk.
pub const TYPE_TAG_LEN: usize = 8;

/// A resource type such as `png` or `room`, stored as exactly 8 bytes padded with spaces.
///
/// Tags are compared byte for byte, so `"png"` and `"png     "` are the same tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag([u8; TYPE_TAG_LEN]);

impl TypeTag {
    /// Build a tag from a short name, padding it with spaces.
    pub fn new(name: &str) -> Result<TypeTag, ArchiveError> {
        let bytes = name.as_bytes();
        if bytes.len() > TYPE_TAG_LEN {
            return Err(ArchiveError::TypeTagTooLong(name.to_string()));
        }

        let mut tag = [b' '; TYPE_TAG_LEN];
        tag[..bytes.len()].copy_from_slice(bytes);
        Ok(TypeTag(tag))
    }

    /// Wrap raw bytes read from an archive header.
    pub fn from_bytes(bytes: [u8; TYPE_TAG_LEN]) -> TypeTag {
        TypeTag(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TYPE_TAG_LEN] {
        &self.0
    }

    /// The tag without its padding.  Non-UTF-8 tags render lossily.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.0).trim_end().to_string()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:?})", self.name())
    }
}
