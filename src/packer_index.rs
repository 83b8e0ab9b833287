//! The packer's plain-text record of tracked files.
//!
//! One line per file: `<decimal id> <8-char type tag> <filename>`.  Ids are chosen at random when a file is first
//! tracked, so adding and removing files never renumbers the others.
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use std::path::Path;

use rand::Rng;

use crate::archive::ArchiveError;
use crate::*;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Tracked {
    type_tag: TypeTag,
    filename: String,
}

#[derive(Debug, Default)]
pub struct PackerIndex {
    entries: BTreeMap<ResourceId, Tracked>,
    by_name: HashMap<String, ResourceId, ahash::RandomState>,
    changed: bool,
}

/// Guess a resource type from a file's extension, falling back to `raw`.
pub fn type_for_path(path: &str) -> &str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => ext,
        _ => "raw",
    }
}

impl PackerIndex {
    pub fn new() -> PackerIndex {
        Default::default()
    }

    /// Replace the contents of this index with those read from `input`.
    pub fn load<R: BufRead>(&mut self, input: R) -> Result<(), ArchiveError> {
        self.entries.clear();
        self.by_name.clear();
        self.changed = false;

        for (n, line) in input.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let malformed = || ArchiveError::MalformedIndexLine {
                line: n + 1,
                content: line.clone(),
            };

            let (id, rest) = line.split_once(' ').ok_or_else(malformed)?;
            let id: ResourceId = id.parse().map_err(|_| malformed())?;
            // The tag is fixed width and may itself contain padding spaces.
            let tag = rest.get(..TYPE_TAG_LEN).ok_or_else(malformed)?;
            let filename = rest
                .get(TYPE_TAG_LEN..)
                .and_then(|s| s.strip_prefix(' '))
                .filter(|s| !s.is_empty())
                .ok_or_else(malformed)?;

            let tracked = Tracked {
                type_tag: TypeTag::new(tag)?,
                filename: filename.to_string(),
            };
            self.by_name.insert(tracked.filename.clone(), id);
            self.entries.insert(id, tracked);
        }
        Ok(())
    }

    pub fn save<W: Write>(&self, mut out: W) -> Result<(), ArchiveError> {
        for (id, tracked) in &self.entries {
            writeln!(out, "{} {} {}", id, tracked.type_tag, tracked.filename)?;
        }
        Ok(())
    }

    /// Start tracking a file, returning its id.  Files already tracked keep their id.
    pub fn add_entry(&mut self, filename: &str, type_name: &str) -> Result<ResourceId, ArchiveError> {
        let type_tag = TypeTag::new(type_name)?;
        if let Some(id) = self.by_name.get(filename) {
            return Ok(*id);
        }

        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: ResourceId = rng.gen();
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        self.entries.insert(
            id,
            Tracked {
                type_tag,
                filename: filename.to_string(),
            },
        );
        self.by_name.insert(filename.to_string(), id);
        self.changed = true;
        Ok(id)
    }

    pub fn remove_entry(&mut self, filename: &str) -> Result<ResourceId, ArchiveError> {
        let id = self
            .by_name
            .remove(filename)
            .ok_or_else(|| ArchiveError::NotTracked(filename.to_string()))?;
        self.entries.remove(&id);
        self.changed = true;
        Ok(id)
    }

    pub fn id_of(&self, filename: &str) -> Option<ResourceId> {
        self.by_name.get(filename).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether anything was added or removed since the last [PackerIndex::load].
    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Add every tracked file to an archive writer.
    pub fn export_to(&self, writer: &mut PackWriter) -> Result<(), ArchiveError> {
        for (id, tracked) in &self.entries {
            writer.add_file(*id, &tracked.filename, tracked.type_tag)?;
        }
        Ok(())
    }
}
