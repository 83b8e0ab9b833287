//! The [ResourceCache] loads resources from a [ResourceFile] on demand and keeps them within a byte budget.
//!
//! Resources are handed out as [ResourceHandle]s.  The cache itself holds one reference to every resource in its LRU
//! list; when room is needed it drops the least recently used ones.  An evicted resource which a caller still holds
//! stays reachable through a weak table, so asking for it again revives the same buffer rather than reading the
//! archive a second time.  Its bytes stay charged to the budget until the last handle goes away.
//!
//! Loads can be synchronous ([ResourceCache::get_handle]) or run on a small worker pool ([ResourceCache::preload]).
//! Either way, at most one load per resource is in flight: later requests wait for it, or queue their callbacks on it.
//!
//! Locks are always taken in the order in-flight table, LRU list, resource tables.  The LRU list and the tables are
//! only ever taken together, through one critical section helper.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};

use crossbeam::channel::{self, Receiver, Sender};

use crate::archive::ArchiveError;
use crate::handle::{Allocation, Release, Resource};
use crate::loaders::LoaderTable;
use crate::lru_list::LruList;
use crate::worker_pool::WorkerPool;
use crate::*;

type CacheHashMap<V> = HashMap<ResourceId, V, ahash::RandomState>;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct ResourceCacheConfig {
    /// Maximum number of bytes of loaded resources.
    pub budget_bytes: u64,
    /// Number of background threads serving [ResourceCache::preload].
    #[builder(default = "4")]
    pub workers: usize,
    /// Whether [ResourceCache::init] installs [RawLoader] for types no registered loader claims.
    #[builder(default = "true")]
    pub default_loader: bool,
}

impl ResourceCacheConfig {
    pub fn with_budget_mib(mib: u64) -> ResourceCacheConfig {
        ResourceCacheConfig {
            budget_bytes: mib.saturating_mul(1024 * 1024),
            workers: 4,
            default_loader: true,
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum CacheError {
    #[error("the resource cache has not been initialized")]
    NotInitialized,
    #[error("no loader for resource {id} of type {type_tag:?}")]
    NoLoaderAvailable { id: ResourceId, type_tag: TypeTag },
    #[error("{0} could not be mapped to a resource")]
    NotFound(String),
    #[error("resource {id} needs {size} bytes, more than the whole cache budget of {budget}")]
    TooLarge {
        id: ResourceId,
        size: u64,
        budget: u64,
    },
    #[error("loader failed on resource {id}: {source}")]
    Loader { id: ResourceId, source: LoaderError },
    #[error(transparent)]
    Archive(Arc<ArchiveError>),
    #[error("resource {0} was loaded twice")]
    DuplicateResource(ResourceId),
    #[error("failed to start resource loader threads: {0}")]
    WorkerPool(Arc<std::io::Error>),
}

impl From<ArchiveError> for CacheError {
    fn from(e: ArchiveError) -> CacheError {
        CacheError::Archive(Arc::new(e))
    }
}

/// What a load produces.  `Ok(None)` means the cache could not make room: nothing is broken, but no handle was
/// produced, and the caller decides whether to retry later.
pub type LoadResult = Result<Option<ResourceHandle>, CacheError>;

type Callback = Box<dyn FnOnce(&LoadResult) + Send + 'static>;

/// Point-in-time view of the cache's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub budget: u64,
    pub allocated: u64,
    pub max_allocated: u64,
    /// Resources held by the LRU list.
    pub cached: usize,
    /// Evicted resources still reachable because something outside the cache holds them.
    pub evicted_alive: usize,
    pub in_flight: usize,
}

/// The resource tables and the budget counter, guarded together.
struct Tables {
    strong: CacheHashMap<ResourceHandle>,
    weak: CacheHashMap<Weak<Resource>>,
    allocated: u64,
    max_allocated: u64,
    releases: Receiver<Release>,
}

impl Tables {
    /// Account for every buffer freed since the last call.
    fn drain_releases(&mut self) {
        while let Ok(release) = self.releases.try_recv() {
            debug_assert!(release.bytes <= self.allocated);
            self.allocated = self.allocated.saturating_sub(release.bytes);

            if let Some(id) = release.resource {
                let dead = self
                    .weak
                    .get(&id)
                    .map_or(false, |w| w.strong_count() == 0);
                if dead {
                    self.weak.remove(&id);
                }
            }
        }
    }
}

#[derive(Default)]
struct FlightState {
    /// Set once some thread has taken on the load itself.
    started: bool,
    outcome: Option<LoadResult>,
    callbacks: VecDeque<Callback>,
}

/// One load in progress.
#[derive(Default)]
struct InFlight {
    state: Mutex<FlightState>,
    done: Condvar,
}

impl InFlight {
    /// A load the creating thread runs itself.
    fn started() -> InFlight {
        let flight = InFlight::default();
        flight.state.lock().unwrap().started = true;
        flight
    }

    /// A load queued for the worker pool.
    fn with_callback(callback: Callback) -> InFlight {
        let flight = InFlight::default();
        flight.state.lock().unwrap().callbacks.push_back(callback);
        flight
    }

    /// Take on running the load.  Returns false if another thread already has.
    fn claim(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        !std::mem::replace(&mut state.started, true)
    }

    fn complete(&self, outcome: LoadResult) {
        self.state.lock().unwrap().outcome = Some(outcome);
        self.done.notify_all();
    }

    /// Block until the load finishes and return its outcome.
    fn wait(&self) -> LoadResult {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self.done.wait(state).unwrap();
        }
    }
}

struct Shared<F> {
    config: ResourceCacheConfig,
    file: F,
    lru: Mutex<LruList<ResourceId, Resource>>,
    tables: Mutex<Tables>,
    releases: Sender<Release>,
    loaders: RwLock<LoaderTable>,
    in_flight: Mutex<CacheHashMap<Arc<InFlight>>>,
    /// Signalled whenever an entry leaves `in_flight`.
    idle: Condvar,
    pool: WorkerPool,
    initialized: AtomicBool,
}

pub struct ResourceCache<F: ResourceFile> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFile> Shared<F> {
    fn ensure_initialized(&self) -> Result<(), CacheError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    /// Run `f` holding both the LRU list and the resource tables, with freed memory accounted for.
    fn critical_section<R>(
        &self,
        f: impl FnOnce(&mut LruList<ResourceId, Resource>, &mut Tables) -> R,
    ) -> R {
        let mut lru = self.lru.lock().unwrap();
        let mut tables = self.tables.lock().unwrap();
        tables.drain_releases();
        let ret = f(&mut lru, &mut tables);
        tables.drain_releases();
        ret
    }

    /// Find a resource which is cached or can be revived, making it the most recently used.
    fn find(&self, id: ResourceId) -> Option<ResourceHandle> {
        self.critical_section(|lru, tables| {
            if let Some(handle) = tables.strong.get(&id) {
                lru.touch(&id);
                return Some(handle.clone());
            }

            let revived = tables.weak.remove(&id)?.upgrade()?;
            let handle = ResourceHandle::from_arc(revived);
            lru.push_front(id, handle.as_arc().clone());
            tables.strong.insert(id, handle.clone());
            tracing::debug!(id, "Revived evicted resource");
            Some(handle)
        })
    }

    /// Evict the least recently used resource, returning false if there was none.
    ///
    /// The cache's references are dropped here; if nothing else holds the resource its memory is released
    /// immediately, otherwise it moves to the weak table until its last holder lets go.
    fn free_one_resource(lru: &mut LruList<ResourceId, Resource>, tables: &mut Tables) -> bool {
        let (id, resource) = match lru.pop_back() {
            Some(x) => x,
            None => return false,
        };

        tables.strong.remove(&id);
        tables.weak.insert(id, Arc::downgrade(&resource));
        drop(resource);
        tables.drain_releases();
        tracing::debug!(id, "Evicted resource");
        true
    }

    /// Evict until `size` more bytes fit in the budget.
    fn make_room(&self, lru: &mut LruList<ResourceId, Resource>, tables: &mut Tables, size: u64) -> bool {
        let budget = self.config.budget_bytes;
        while tables.allocated + size > budget {
            if !Self::free_one_resource(lru, tables) {
                self.report_pinned(tables, size);
                return false;
            }
        }
        true
    }

    fn report_pinned(&self, tables: &Tables, size: u64) {
        tracing::warn!(
            size,
            allocated = tables.allocated,
            budget = self.config.budget_bytes,
            "Failed to make room for resource"
        );
        for (id, weak) in tables.weak.iter() {
            if let Some(resource) = weak.upgrade() {
                let handle = ResourceHandle::from_arc(resource);
                tracing::debug!(
                    id,
                    bytes = handle.len(),
                    name = handle.name(),
                    "Resource held outside the cache"
                );
            }
        }
    }

    /// Charge `size` bytes to the budget and allocate them.
    ///
    /// `Ok(None)` means room could not be made because everything evictable already was.
    fn allocate(&self, id: ResourceId, size: u64) -> Result<Option<Allocation>, CacheError> {
        let budget = self.config.budget_bytes;
        let too_large = CacheError::TooLarge { id, size, budget };
        if size > budget {
            tracing::warn!(id, size, budget, "Resource is larger than the whole cache");
            return Err(too_large);
        }
        let len = usize::try_from(size).map_err(|_| too_large)?;

        let reserved = self.critical_section(|lru, tables| {
            if !self.make_room(lru, tables, size) {
                return false;
            }
            tables.allocated += size;
            tables.max_allocated = tables.max_allocated.max(tables.allocated);
            true
        });

        if reserved {
            Ok(Some(Allocation::new(vec![0u8; len], self.releases.clone())))
        } else {
            Ok(None)
        }
    }

    /// Read and load a resource, then make it the most recently used.  Callers must own the in-flight entry for `id`.
    fn load(&self, id: ResourceId) -> LoadResult {
        let type_tag = self.file.resource_type(id)?;
        let loader = self
            .loaders
            .read()
            .unwrap()
            .select(&type_tag)
            .ok_or(CacheError::NoLoaderAvailable { id, type_tag })?;
        let name = self.file.resource_name(id)?;

        let raw_size = self.file.raw_resource_size(id)?;
        let mut raw = match self.allocate(id, raw_size)? {
            Some(x) => x,
            None => return Ok(None),
        };
        self.file.raw_resource(id, raw.as_mut_slice())?;

        let buffer = if loader.use_raw_file() {
            raw
        } else {
            let loader_error = |source: LoaderError| CacheError::Loader { id, source };
            let size = loader
                .loaded_resource_size(raw.as_slice())
                .map_err(loader_error)?;
            let mut loaded = match self.allocate(id, size)? {
                Some(x) => x,
                None => return Ok(None),
            };
            loader
                .load_resource(raw.as_slice(), loaded.as_mut_slice())
                .map_err(loader_error)?;
            loaded
        };

        let handle = ResourceHandle::new(id, name, buffer);
        self.critical_section(|lru, tables| {
            if tables.strong.contains_key(&id) || lru.contains(&id) {
                tracing::error!(id, "Resource was loaded while already cached");
                return Err(CacheError::DuplicateResource(id));
            }
            tables.weak.remove(&id);
            lru.push_front(id, handle.as_arc().clone());
            tables.strong.insert(id, handle.clone());
            Ok(())
        })?;
        Ok(Some(handle))
    }

    fn get_handle(self: &Arc<Self>, id: ResourceId) -> LoadResult {
        self.ensure_initialized()?;

        let flight = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(handle) = self.find(id) {
                return Ok(Some(handle));
            }
            let running = in_flight.get(&id).cloned();
            if let Some(flight) = running {
                drop(in_flight);
                if !flight.claim() {
                    return flight.wait();
                }
                // The load is still queued, possibly behind this very thread if it is a worker.  Run it here; the
                // queued job only delivers the callbacks.
                let outcome = self.load(id);
                flight.complete(outcome.clone());
                return outcome;
            }
            let flight = Arc::new(InFlight::started());
            in_flight.insert(id, flight.clone());
            flight
        };

        let outcome = self.load(id);
        flight.complete(outcome.clone());
        self.release_flight(id, flight);
        outcome
    }

    fn preload(self: &Arc<Self>, id: ResourceId, callback: Callback) -> Result<(), CacheError> {
        self.ensure_initialized()?;

        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(handle) = self.find(id) {
            drop(in_flight);
            self.pool
                .submit(Box::new(move || callback(&Ok(Some(handle)))));
            return Ok(());
        }
        if let Some(flight) = in_flight.get(&id) {
            flight.state.lock().unwrap().callbacks.push_back(callback);
            return Ok(());
        }

        let flight = Arc::new(InFlight::with_callback(callback));
        in_flight.insert(id, flight.clone());
        drop(in_flight);

        let shared = self.clone();
        self.pool.submit(Box::new(move || {
            if flight.claim() {
                let outcome = shared.load(id);
                flight.complete(outcome);
            }
            shared.finish_flight(id, &flight);
        }));
        Ok(())
    }

    fn remove_flight(&self, in_flight: &mut CacheHashMap<Arc<InFlight>>, id: ResourceId, flight: &Arc<InFlight>) {
        if in_flight.get(&id).map_or(false, |f| Arc::ptr_eq(f, flight)) {
            in_flight.remove(&id);
        }
        self.idle.notify_all();
    }

    /// Deliver every callback queued on a completed load, in order, then retire it.
    ///
    /// Callbacks queued while earlier ones run are delivered too: the entry only leaves the table once its queue is
    /// observed empty under the table lock.
    fn finish_flight(&self, id: ResourceId, flight: &Arc<InFlight>) {
        let outcome = flight.wait();
        loop {
            let callback = {
                let mut in_flight = self.in_flight.lock().unwrap();
                let next = flight.state.lock().unwrap().callbacks.pop_front();
                match next {
                    Some(cb) => cb,
                    None => {
                        self.remove_flight(&mut in_flight, id, flight);
                        return;
                    }
                }
            };
            callback(&outcome);
        }
    }

    /// Retire a load finished on a caller's thread, handing any queued callbacks to the pool.
    fn release_flight(self: &Arc<Self>, id: ResourceId, flight: Arc<InFlight>) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if flight.state.lock().unwrap().callbacks.is_empty() {
                self.remove_flight(&mut in_flight, id, &flight);
                return;
            }
        }

        let shared = self.clone();
        self.pool
            .submit(Box::new(move || shared.finish_flight(id, &flight)));
    }

    fn evict_all(&self) {
        self.critical_section(|lru, tables| while Self::free_one_resource(lru, tables) {});
    }

    fn flush(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        while !in_flight.is_empty() {
            in_flight = self.idle.wait(in_flight).unwrap();
        }
        self.evict_all();
    }

    fn stats(&self) -> CacheStats {
        let in_flight = self.in_flight.lock().unwrap().len();
        self.critical_section(|lru, tables| CacheStats {
            budget: self.config.budget_bytes,
            allocated: tables.allocated,
            max_allocated: tables.max_allocated,
            cached: lru.len(),
            evicted_alive: tables
                .weak
                .values()
                .filter(|w| w.strong_count() > 0)
                .count(),
            in_flight,
        })
    }
}

impl<F: ResourceFile> ResourceCache<F> {
    pub fn new(file: F, config: ResourceCacheConfig) -> ResourceCache<F> {
        let (tx, rx) = channel::unbounded();
        ResourceCache {
            shared: Arc::new(Shared {
                file,
                lru: Mutex::new(LruList::new()),
                tables: Mutex::new(Tables {
                    strong: Default::default(),
                    weak: Default::default(),
                    allocated: 0,
                    max_allocated: 0,
                    releases: rx,
                }),
                releases: tx,
                loaders: RwLock::new(LoaderTable::default()),
                in_flight: Default::default(),
                idle: Condvar::new(),
                pool: WorkerPool::default(),
                initialized: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Open the resource file, install the default loader and start the worker pool.  Must be called before loading
    /// anything.
    pub fn init(&self) -> Result<(), CacheError> {
        let shared = &self.shared;
        if shared.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        shared.file.open()?;
        if shared.config.default_loader {
            shared
                .loaders
                .write()
                .unwrap()
                .set_fallback(Arc::new(RawLoader));
        }
        shared
            .pool
            .start(shared.config.workers)
            .map_err(|e| CacheError::WorkerPool(Arc::new(e)))?;
        shared.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Add a loader.  Loaders registered later take priority over earlier ones for the same type tag.
    pub fn register_loader<L: ResourceLoader>(&self, loader: L) {
        self.shared
            .loaders
            .write()
            .unwrap()
            .register(Arc::new(loader));
    }

    /// Replace the loader used for types no registered loader claims.
    pub fn set_default_loader<L: ResourceLoader>(&self, loader: L) {
        self.shared
            .loaders
            .write()
            .unwrap()
            .set_fallback(Arc::new(loader));
    }

    /// Get a resource, loading it on this thread if it isn't cached.
    ///
    /// If a load for the same resource is already running, this waits for it and returns its outcome.
    pub fn get_handle(&self, id: ResourceId) -> LoadResult {
        self.shared.get_handle(id)
    }

    /// Start loading a resource in the background.
    ///
    /// `callback` is called exactly once with the outcome, always on a worker thread, even if the resource is already
    /// cached.  Callbacks for the same resource share one load and run in the order they were registered.  They may
    /// call [ResourceCache::get_handle], but must not call [ResourceCache::flush].
    pub fn preload<C>(&self, id: ResourceId, callback: C) -> Result<(), CacheError>
    where
        C: FnOnce(&LoadResult) + Send + 'static,
    {
        self.shared.preload(id, Box::new(callback))
    }

    /// Wait for all in-flight loads, then drop every reference the cache holds.
    ///
    /// Resources still held by callers stay alive, and can be revived, until those callers drop them.
    pub fn flush(&self) {
        self.shared.flush()
    }

    /// Find the resource packed under `path`.
    pub fn find_by_path(&self, path: &str) -> Result<ResourceId, CacheError> {
        self.shared.ensure_initialized()?;
        let file = &self.shared.file;
        for i in 0..file.num_resources()? {
            let id = file.resource_id(i)?;
            if file.resource_name(id)? == path {
                return Ok(id);
            }
        }
        Err(CacheError::NotFound(path.to_string()))
    }

    pub fn find_path(&self, id: ResourceId) -> Result<String, CacheError> {
        self.shared.ensure_initialized()?;
        Ok(self.shared.file.resource_name(id)?)
    }

    /// Bytes currently charged to the budget.
    pub fn allocated(&self) -> u64 {
        self.shared.critical_section(|_, tables| tables.allocated)
    }

    /// The most bytes ever charged to the budget at once.
    pub fn max_allocated(&self) -> u64 {
        self.shared.critical_section(|_, tables| tables.max_allocated)
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &ResourceCacheConfig {
        &self.shared.config
    }

    pub fn file(&self) -> &F {
        &self.shared.file
    }
}

impl<F: ResourceFile> Drop for ResourceCache<F> {
    fn drop(&mut self) {
        // Every queued load and callback runs before the pool's threads exit.
        self.shared.pool.shutdown();
        self.shared.evict_all();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::archive::{Archive, ArchiveFormat};

    type MemoryArchive = Archive<Cursor<Vec<u8>>>;

    /// Blocks readers while closed.
    #[derive(Default)]
    struct Gate {
        closed: Mutex<bool>,
        cond: Condvar,
    }

    impl Gate {
        fn set(&self, closed: bool) {
            *self.closed.lock().unwrap() = closed;
            self.cond.notify_all();
        }

        fn pass(&self) {
            let mut closed = self.closed.lock().unwrap();
            while *closed {
                closed = self.cond.wait(closed).unwrap();
            }
        }
    }

    /// Counts reads of the wrapped file and can hold them at a gate.
    struct Instrumented {
        inner: MemoryArchive,
        reads: AtomicUsize,
        gate: Gate,
    }

    impl Instrumented {
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl ResourceFile for Instrumented {
        fn open(&self) -> Result<(), ArchiveError> {
            self.inner.open()
        }

        fn raw_resource_size(&self, id: ResourceId) -> Result<u64, ArchiveError> {
            self.inner.raw_resource_size(id)
        }

        fn raw_resource(&self, id: ResourceId, dest: &mut [u8]) -> Result<(), ArchiveError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.gate.pass();
            self.inner.raw_resource(id, dest)
        }

        fn num_resources(&self) -> Result<usize, ArchiveError> {
            self.inner.num_resources()
        }

        fn resource_id(&self, index: usize) -> Result<ResourceId, ArchiveError> {
            self.inner.resource_id(index)
        }

        fn resource_name(&self, id: ResourceId) -> Result<String, ArchiveError> {
            self.inner.resource_name(id)
        }

        fn resource_type(&self, id: ResourceId) -> Result<TypeTag, ArchiveError> {
            self.inner.resource_type(id)
        }
    }

    type TestCache = ResourceCache<Instrumented>;

    fn memory_archive(files: &[(ResourceId, &str, &str, &[u8])], format: ArchiveFormat) -> MemoryArchive {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PackWriter::new(format, SourceTree::new(dir.path()));
        for (id, name, tag, data) in files {
            std::fs::write(dir.path().join(name), data).unwrap();
            writer.add_file(*id, name, TypeTag::new(tag).unwrap()).unwrap();
        }
        let mut out = Cursor::new(vec![]);
        writer.write(&mut out).unwrap();
        Archive::bind(out, format).unwrap()
    }

    fn build_cache_with(files: &[(ResourceId, &str, &str, &[u8])], config: ResourceCacheConfig) -> TestCache {
        let file = Instrumented {
            inner: memory_archive(files, ArchiveFormat::Raw),
            reads: AtomicUsize::new(0),
            gate: Gate::default(),
        };
        let cache = ResourceCache::new(file, config);
        cache.init().unwrap();
        cache
    }

    fn build_cache(files: &[(ResourceId, &str, &str, &[u8])], budget: u64) -> TestCache {
        let config = ResourceCacheConfigBuilder::default()
            .budget_bytes(budget)
            .build()
            .expect("Should build");
        build_cache_with(files, config)
    }

    const A: &[u8] = b"aaaaaaaaaa";
    const B: &[u8] = b"bbbbbbbbbb";
    const C: &[u8] = b"cccccccccc";
    const BIG: &[u8] = b"this entry is larger than the whole budget";

    const SCENARIO: &[(ResourceId, &str, &str, &[u8])] = &[
        (1, "a.png", "png", A),
        (2, "b.room", "room", B),
        (3, "c.bin", "raw", C),
        (4, "big.bin", "raw", BIG),
    ];

    fn get(cache: &TestCache, id: ResourceId) -> ResourceHandle {
        cache
            .get_handle(id)
            .expect("Should load")
            .expect("Should fit in the cache")
    }

    #[test]
    fn unusable_before_init() {
        let config = ResourceCacheConfig::with_budget_mib(1);
        let cache = ResourceCache::new(memory_archive(SCENARIO, ArchiveFormat::Raw), config);
        assert!(matches!(cache.get_handle(1), Err(CacheError::NotInitialized)));
        assert!(matches!(
            cache.preload(1, |_| ()),
            Err(CacheError::NotInitialized)
        ));
        assert!(matches!(
            cache.find_by_path("a.png"),
            Err(CacheError::NotInitialized)
        ));

        cache.init().unwrap();
        assert_eq!(&*get_any(&cache, 1), A);
    }

    fn get_any<F: ResourceFile>(cache: &ResourceCache<F>, id: ResourceId) -> ResourceHandle {
        cache.get_handle(id).unwrap().unwrap()
    }

    #[test]
    fn scenario_evicts_the_oldest() {
        let cache = build_cache(SCENARIO, (A.len() + B.len()) as u64);
        assert_eq!(&*get(&cache, 1), A);
        assert_eq!(&*get(&cache, 2), B);
        assert_eq!(cache.allocated(), 20);
        assert_eq!(&*get(&cache, 3), C);
        assert_eq!(cache.file().reads(), 3);

        // 2 and 3 are still cached; 1 had to be read again.
        get(&cache, 2);
        get(&cache, 3);
        assert_eq!(cache.file().reads(), 3);
        get(&cache, 1);
        assert_eq!(cache.file().reads(), 4);

        assert_eq!(cache.find_by_path("b.room").unwrap(), 2);
        assert_eq!(cache.find_path(3).unwrap(), "c.bin");
        assert!(matches!(
            cache.find_by_path("nope"),
            Err(CacheError::NotFound(_))
        ));
        assert!(matches!(
            cache.find_path(99),
            Err(CacheError::Archive(_))
        ));
    }

    #[test]
    fn retouched_entries_survive() {
        let cache = build_cache(SCENARIO, 20);
        get(&cache, 1);
        get(&cache, 2);
        get(&cache, 1);
        get(&cache, 3);
        assert_eq!(cache.file().reads(), 3);

        // B was the least recently used.
        get(&cache, 1);
        get(&cache, 3);
        assert_eq!(cache.file().reads(), 3);
        get(&cache, 2);
        assert_eq!(cache.file().reads(), 4);
    }

    #[test]
    fn too_large_never_evicts() {
        let cache = build_cache(SCENARIO, 20);
        get(&cache, 1);
        get(&cache, 2);

        assert!(matches!(
            cache.get_handle(4),
            Err(CacheError::TooLarge { id: 4, .. })
        ));
        assert_eq!(cache.stats().cached, 2);
        get(&cache, 1);
        get(&cache, 2);
        // The oversized entry is rejected before it is read.
        assert_eq!(cache.file().reads(), 2);
    }

    #[test]
    fn pinned_resources_cause_backpressure() {
        let cache = build_cache(SCENARIO, 20);
        let a = get(&cache, 1);
        let b = get(&cache, 2);

        assert!(cache.get_handle(3).unwrap().is_none());
        assert_eq!(cache.allocated(), 20);
        let stats = cache.stats();
        assert_eq!(stats.cached, 0);
        assert_eq!(stats.evicted_alive, 2);

        drop(a);
        assert_eq!(cache.allocated(), 10);
        assert_eq!(&*get(&cache, 3), C);
        assert!(cache.allocated() <= 20);
        drop(b);
    }

    #[test]
    fn evicted_resources_are_revived() {
        let cache = build_cache(SCENARIO, 20);
        let held = get(&cache, 1);
        get(&cache, 2);
        get(&cache, 3);
        assert_eq!(cache.file().reads(), 3);
        assert_eq!(cache.stats().evicted_alive, 1);

        let revived = get(&cache, 1);
        assert!(ResourceHandle::ptr_eq(&held, &revived));
        assert_eq!(cache.file().reads(), 3);
        drop(held);
        drop(revived);

        // 3 is now the oldest; nothing holds it, so it is really gone and must be read again.
        get(&cache, 2);
        let reloaded = get(&cache, 3);
        assert_eq!(cache.file().reads(), 5);
        assert_eq!(&*reloaded, C);
        assert_eq!(reloaded.name(), "c.bin");
    }

    #[test]
    fn flush_drops_cache_references() {
        let cache = build_cache(SCENARIO, 20);
        let held = get(&cache, 1);
        get(&cache, 2);
        assert_eq!(cache.allocated(), 20);

        cache.flush();
        assert_eq!(cache.allocated(), 10);
        assert_eq!(cache.stats().cached, 0);
        assert_eq!(cache.max_allocated(), 20);

        drop(held);
        assert_eq!(cache.allocated(), 0);
        assert_eq!(cache.stats().evicted_alive, 0);
    }

    /// The room format from the engine's test level: `- res: <id> x: <f> y: <f> z: <f>` per object, loaded into a
    /// count followed by packed `(id, x, y, z)` records.
    struct RoomLoader;

    const ROOM_OBJECT_SIZE: usize = 16;

    fn parse_room(raw: &[u8]) -> Result<Vec<(u32, f32, f32, f32)>, LoaderError> {
        let text = std::str::from_utf8(raw).map_err(|e| LoaderError(e.to_string()))?;
        let words = text.split_whitespace().collect::<Vec<_>>();
        let bad = |what: &str| LoaderError(format!("malformed room object: {}", what));

        let mut objects = vec![];
        for object in words.chunks(9) {
            match object {
                ["-", "res:", id, "x:", x, "y:", y, "z:", z] => objects.push((
                    id.parse::<u32>().map_err(|_| bad(*id))?,
                    x.parse::<f32>().map_err(|_| bad(*x))?,
                    y.parse::<f32>().map_err(|_| bad(*y))?,
                    z.parse::<f32>().map_err(|_| bad(*z))?,
                )),
                _ => return Err(bad(&object.join(" "))),
            }
        }
        Ok(objects)
    }

    impl ResourceLoader for RoomLoader {
        fn pattern(&self) -> TypeTag {
            TypeTag::new("room").unwrap()
        }

        fn use_raw_file(&self) -> bool {
            false
        }

        fn loaded_resource_size(&self, raw: &[u8]) -> Result<u64, LoaderError> {
            Ok((4 + parse_room(raw)?.len() * ROOM_OBJECT_SIZE) as u64)
        }

        fn load_resource(&self, raw: &[u8], dest: &mut [u8]) -> Result<(), LoaderError> {
            let objects = parse_room(raw)?;
            dest[..4].copy_from_slice(&(objects.len() as u32).to_le_bytes());
            for (chunk, (id, x, y, z)) in dest[4..].chunks_mut(ROOM_OBJECT_SIZE).zip(objects) {
                chunk[0..4].copy_from_slice(&id.to_le_bytes());
                chunk[4..8].copy_from_slice(&x.to_le_bytes());
                chunk[8..12].copy_from_slice(&y.to_le_bytes());
                chunk[12..16].copy_from_slice(&z.to_le_bytes());
            }
            Ok(())
        }
    }

    #[test]
    fn loaders_transform_resources() {
        const ROOM: &[u8] = b"- res: 1 x: 0.5 y: 2 z: -1\n- res: 3 x: 1 y: 1 z: 1\n";
        const BROKEN: &[u8] = b"- res: 1 x: nope";
        let files: &[(ResourceId, &str, &str, &[u8])] = &[
            (1, "a.png", "png", A),
            (2, "level.room", "room", ROOM),
            (5, "broken.room", "room", BROKEN),
        ];
        let cache = build_cache(files, 1024);
        cache.register_loader(RoomLoader);

        let room = get(&cache, 2);
        assert_eq!(room.len(), 4 + 2 * ROOM_OBJECT_SIZE);
        assert_eq!(&room[0..4], &2u32.to_le_bytes());
        assert_eq!(&room[4..8], &1u32.to_le_bytes());
        assert_eq!(&room[8..12], &0.5f32.to_le_bytes());
        assert_eq!(&room[16..20], &(-1.0f32).to_le_bytes());
        assert_eq!(&room[20..24], &3u32.to_le_bytes());

        // The raw buffer was only needed while loading.
        assert_eq!(cache.allocated(), room.len() as u64);
        assert!(cache.max_allocated() >= (room.len() + ROOM.len()) as u64);

        // Other types still go to the default loader.
        assert_eq!(&*get(&cache, 1), A);

        assert!(matches!(
            cache.get_handle(5),
            Err(CacheError::Loader { id: 5, .. })
        ));
        assert_eq!(cache.allocated(), (room.len() + A.len()) as u64);
    }

    #[test]
    fn no_default_loader() {
        let config = ResourceCacheConfigBuilder::default()
            .budget_bytes(100)
            .default_loader(false)
            .build()
            .unwrap();
        let cache = build_cache_with(SCENARIO, config);
        assert!(matches!(
            cache.get_handle(1),
            Err(CacheError::NoLoaderAvailable { id: 1, .. })
        ));

        cache.set_default_loader(RawLoader);
        assert_eq!(&*get(&cache, 1), A);
    }

    #[test]
    fn concurrent_preloads_share_one_load() {
        let cache = build_cache(SCENARIO, 100);
        cache.file().gate.set(true);

        let (tx, rx) = channel::unbounded();
        for i in 0..8 {
            let tx = tx.clone();
            cache
                .preload(1, move |outcome| {
                    let handle = outcome.as_ref().unwrap().clone().unwrap();
                    tx.send((i, handle)).unwrap();
                })
                .unwrap();
        }
        assert_eq!(cache.stats().in_flight, 1);
        cache.file().gate.set(false);

        let got: Vec<(usize, ResourceHandle)> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect();
        assert_eq!(
            got.iter().map(|x| x.0).collect::<Vec<_>>(),
            (0..8).collect::<Vec<_>>()
        );
        assert!(got.iter().all(|x| ResourceHandle::ptr_eq(&x.1, &got[0].1)));
        assert_eq!(cache.file().reads(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        cache.flush();
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[test]
    fn get_handle_waits_for_in_flight_load() {
        let cache = Arc::new(build_cache(SCENARIO, 100));
        cache.file().gate.set(true);

        let (tx, rx) = channel::unbounded();
        cache
            .preload(2, move |outcome| {
                tx.send(outcome.as_ref().unwrap().is_some()).unwrap();
            })
            .unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || get_any(&cache, 2))
            })
            .collect();
        while cache.file().reads() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        cache.file().gate.set(false);

        let handles: Vec<ResourceHandle> = waiters.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(ResourceHandle::ptr_eq(&handles[0], &handles[1]));
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        assert_eq!(cache.file().reads(), 1);
    }

    #[test]
    fn preloads_join_a_synchronous_load() {
        let cache = Arc::new(build_cache(SCENARIO, 100));
        cache.file().gate.set(true);

        let loader = {
            let cache = cache.clone();
            std::thread::spawn(move || get_any(&cache, 1))
        };
        while cache.file().reads() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let (tx, rx) = channel::unbounded();
        for i in 0..3 {
            let tx = tx.clone();
            cache
                .preload(1, move |outcome| {
                    let handle = outcome.as_ref().unwrap().clone().unwrap();
                    tx.send((i, handle, std::thread::current().id())).unwrap();
                })
                .unwrap();
        }
        cache.file().gate.set(false);

        let handle = loader.join().unwrap();
        let got: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect();
        assert_eq!(got.iter().map(|x| x.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(got.iter().all(|x| ResourceHandle::ptr_eq(&x.1, &handle)));
        assert!(got.iter().all(|x| x.2 != std::thread::current().id()));
        assert_eq!(cache.file().reads(), 1);
    }

    #[test]
    fn callback_may_load_a_resource_queued_behind_it() {
        let config = ResourceCacheConfigBuilder::default()
            .budget_bytes(100)
            .workers(1)
            .build()
            .unwrap();
        let cache = Arc::new(build_cache_with(SCENARIO, config));
        cache.file().gate.set(true);

        let (tx, rx) = channel::unbounded();
        let inner = cache.clone();
        let first = tx.clone();
        cache
            .preload(1, move |_| {
                // The only worker is busy here, and the load of 2 is queued behind this callback.
                let nested = inner.get_handle(2).unwrap().unwrap();
                first.send(("nested", nested)).unwrap();
            })
            .unwrap();
        cache
            .preload(2, move |outcome| {
                let handle = outcome.as_ref().unwrap().clone().unwrap();
                tx.send(("queued", handle)).unwrap();
            })
            .unwrap();
        cache.file().gate.set(false);

        let (a, nested) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let (b, queued) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!((a, b), ("nested", "queued"));
        assert!(ResourceHandle::ptr_eq(&nested, &queued));
        assert_eq!(&*nested, B);
        assert_eq!(cache.file().reads(), 2);
    }

    #[test]
    fn budget_in_mib_saturates() {
        assert_eq!(ResourceCacheConfig::with_budget_mib(3).budget_bytes, 3 * 1024 * 1024);
        assert_eq!(ResourceCacheConfig::with_budget_mib(u64::MAX).budget_bytes, u64::MAX);
    }

    #[test]
    fn callbacks_for_cached_resources_run_on_a_worker() {
        let cache = build_cache(SCENARIO, 100);
        let held = get(&cache, 3);

        let (tx, rx) = channel::unbounded();
        cache
            .preload(3, move |outcome| {
                let handle = outcome.as_ref().unwrap().clone().unwrap();
                tx.send((std::thread::current().id(), handle)).unwrap();
            })
            .unwrap();

        let (thread, handle) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_ne!(thread, std::thread::current().id());
        assert!(ResourceHandle::ptr_eq(&held, &handle));
        assert_eq!(cache.file().reads(), 1);
    }

    #[test]
    fn callbacks_may_reenter_the_cache() {
        let cache = Arc::new(build_cache(SCENARIO, 100));
        let (tx, rx) = channel::unbounded();

        let inner = cache.clone();
        cache
            .preload(1, move |outcome| {
                let first = outcome.as_ref().unwrap().clone().unwrap();
                let again = get_any(&inner, 1);
                tx.send(ResourceHandle::ptr_eq(&first, &again)).unwrap();
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn failed_preloads_still_call_back() {
        let cache = build_cache(SCENARIO, 20);
        let (tx, rx) = channel::unbounded();
        for id in [4, 99] {
            let tx = tx.clone();
            cache
                .preload(id, move |outcome| tx.send(outcome.is_err()).unwrap())
                .unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn concurrent_readers_stay_within_budget() {
        let files: Vec<(ResourceId, String, Vec<u8>)> = (0..16u32)
            .map(|i| (i, format!("{}.bin", i), vec![i as u8; 8 + i as usize]))
            .collect();
        let entries: Vec<(ResourceId, &str, &str, &[u8])> = files
            .iter()
            .map(|(id, name, data)| (*id, name.as_str(), "raw", data.as_slice()))
            .collect();
        let cache = Arc::new(build_cache(&entries, 64));

        let threads: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        let id = (t * 7 + i * 3) % 16;
                        if let Some(handle) = cache.get_handle(id).unwrap() {
                            assert_eq!(handle.len(), 8 + id as usize);
                            assert!(handle.iter().all(|b| *b == id as u8));
                        }
                        assert!(cache.allocated() <= 64);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(cache.max_allocated() <= 64);
    }

    #[derive(Clone, Debug)]
    enum Step {
        Get(ResourceId),
        Hold(ResourceId),
        Release,
    }

    fn step_strat() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0..6u32).prop_map(Step::Get),
            1 => (0..6u32).prop_map(Step::Hold),
            1 => Just(Step::Release),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..Default::default()
        })]
        #[test]
        fn budget_is_never_exceeded(
            sizes in prop::collection::vec(1..40usize, 6),
            budget in 40..120u64,
            steps in prop::collection::vec(step_strat(), 0..200),
        ) {
            let files: Vec<(ResourceId, String, Vec<u8>)> = sizes
                .iter()
                .enumerate()
                .map(|(i, len)| (i as ResourceId, format!("{}", i), vec![i as u8; *len]))
                .collect();
            let entries: Vec<(ResourceId, &str, &str, &[u8])> = files
                .iter()
                .map(|(id, name, data)| (*id, name.as_str(), "raw", data.as_slice()))
                .collect();
            let cache = build_cache(&entries, budget);
            let mut held = vec![];

            for step in steps {
                match step {
                    Step::Get(id) => {
                        if let Some(h) = cache.get_handle(id).unwrap() {
                            prop_assert_eq!(&*h, files[id as usize].2.as_slice());
                        }
                    }
                    Step::Hold(id) => held.extend(cache.get_handle(id).unwrap()),
                    Step::Release => held.clear(),
                }
                let live: u64 = held
                    .iter()
                    .map(|h: &ResourceHandle| (h.id(), h.len() as u64))
                    .collect::<HashMap<_, _>>()
                    .values()
                    .sum();
                let allocated = cache.allocated();
                prop_assert!(allocated <= budget);
                prop_assert!(live <= allocated);
            }

            held.clear();
            cache.flush();
            prop_assert_eq!(cache.allocated(), 0);
        }
    }
}
