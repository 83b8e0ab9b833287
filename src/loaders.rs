//! Loader selection by type tag.
use std::sync::Arc;

use crate::*;

/// Treats any resource as opaque bytes.  Installed by [ResourceCache::init] as the fallback loader.
#[derive(Debug, Default)]
pub struct RawLoader;

impl ResourceLoader for RawLoader {
    fn pattern(&self) -> TypeTag {
        TypeTag::from_bytes(*b"raw     ")
    }

    fn use_raw_file(&self) -> bool {
        true
    }

    fn loaded_resource_size(&self, raw: &[u8]) -> Result<u64, LoaderError> {
        Ok(raw.len() as u64)
    }

    fn load_resource(&self, raw: &[u8], dest: &mut [u8]) -> Result<(), LoaderError> {
        dest.copy_from_slice(raw);
        Ok(())
    }
}

/// Registered loaders, newest first, plus the designated fallback.
///
/// A resource goes to the most recently registered loader whose pattern equals its type tag exactly.  When none
/// matches it goes to the fallback; there is no other implicit choice.
#[derive(Default)]
pub(crate) struct LoaderTable {
    loaders: Vec<Arc<dyn ResourceLoader>>,
    fallback: Option<Arc<dyn ResourceLoader>>,
}

impl LoaderTable {
    pub(crate) fn register(&mut self, loader: Arc<dyn ResourceLoader>) {
        self.loaders.insert(0, loader);
    }

    pub(crate) fn set_fallback(&mut self, loader: Arc<dyn ResourceLoader>) {
        self.fallback = Some(loader);
    }

    pub(crate) fn select(&self, type_tag: &TypeTag) -> Option<Arc<dyn ResourceLoader>> {
        self.loaders
            .iter()
            .find(|l| l.pattern() == *type_tag)
            .or(self.fallback.as_ref())
            .cloned()
    }
}
