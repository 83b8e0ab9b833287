//! Reference-counted resource handles and the budgeted buffers behind them.
//!
//! Every byte buffer the cache hands out is an [Allocation] that was charged against the cache budget.  Dropping it
//! posts a [Release] message back to the cache rather than calling into the cache directly, so a handle may die on any
//! thread, including while the cache itself holds its locks, without deadlocking.
use std::ops::Deref;
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::ResourceId;

/// Notification that a budgeted buffer has been freed.
#[derive(Debug)]
pub(crate) struct Release {
    pub(crate) bytes: u64,
    /// Set when the buffer belonged to a resource, so its weak table entry can be purged.
    pub(crate) resource: Option<ResourceId>,
}

/// A buffer whose size is counted against the cache budget until it is dropped.
pub(crate) struct Allocation {
    data: Vec<u8>,
    resource: Option<ResourceId>,
    releases: Sender<Release>,
}

impl Allocation {
    pub(crate) fn new(data: Vec<u8>, releases: Sender<Release>) -> Allocation {
        Allocation {
            data,
            resource: None,
            releases,
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // The cache may already be gone, in which case there is nothing to account for.
        let _ = self.releases.send(Release {
            bytes: self.data.len() as u64,
            resource: self.resource,
        });
    }
}

/// A loaded resource.  Only ever reached through a [ResourceHandle].
pub(crate) struct Resource {
    id: ResourceId,
    name: String,
    buffer: Allocation,
}

impl Drop for Resource {
    fn drop(&mut self) {
        tracing::debug!(id = self.id, name = %self.name, bytes = self.buffer.len(), "Resource released");
    }
}

/// Shared ownership of a loaded resource.
///
/// Cloning is cheap.  The resource lives until the last handle is dropped, whether that handle is held by the cache or
/// by a caller; its memory is then returned to the cache budget.
#[derive(Clone)]
pub struct ResourceHandle(Arc<Resource>);

impl ResourceHandle {
    pub(crate) fn new(id: ResourceId, name: String, mut buffer: Allocation) -> ResourceHandle {
        buffer.resource = Some(id);
        tracing::debug!(id, name = %name, bytes = buffer.len(), "Resource created");
        ResourceHandle(Arc::new(Resource { id, name, buffer }))
    }

    pub(crate) fn from_arc(resource: Arc<Resource>) -> ResourceHandle {
        ResourceHandle(resource)
    }

    pub(crate) fn as_arc(&self) -> &Arc<Resource> {
        &self.0
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    /// The name the resource was packed under.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn data(&self) -> &[u8] {
        self.0.buffer.as_slice()
    }

    /// Whether two handles refer to the same loaded buffer.
    pub fn ptr_eq(a: &ResourceHandle, b: &ResourceHandle) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Number of live handles to this resource, including any held by the cache.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for ResourceHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl AsRef<[u8]> for ResourceHandle {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("bytes", &self.0.buffer.len())
            .finish()
    }
}
