//! Environment management with type-state pattern

use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};

use crate::error::{Error, PageId, Result, TransactionId};
use crate::io::{IoBackend, MmapBackend};
use crate::meta::{self, DbInfo, MetaPage, MetaSign, NUM_METAS};
use crate::page::Page;
use crate::reader::ReaderRegistry;
use crate::txn::{Read, Transaction, Write};



/// Environment state marker traits
pub mod state {
    /// Sealed trait for environment states
    mod sealed {
        pub trait Sealed {}
    }

    /// Environment state trait
    pub trait State: sealed::Sealed {}

    /// Closed environment state
    #[derive(Debug)]
    pub struct Closed;
    impl sealed::Sealed for Closed {}
    impl State for Closed {}

    /// Open environment state
    #[derive(Debug)]
    pub struct Open;
    impl sealed::Sealed for Open {}
    impl State for Open {}

    /// Read-only environment state
    #[derive(Debug)]
    pub struct ReadOnly;
    impl sealed::Sealed for ReadOnly {}
    impl State for ReadOnly {}
}

use state::*;

/// Maximum number of named databases
pub const MAX_DBS: u32 = 128;

/// Default map size (1GB)
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// Durability modes for write transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No sync - fastest but no durability guarantees
    NoSync,
    /// Async sync - data is flushed asynchronously (default)
    AsyncFlush,
    /// Sync data pages only - metadata might be lost
    SyncData,
    /// Full sync - both data and metadata are synced (safest)
    FullSync,
}

/// Snapshot of the reader pinning old pages that reclamation can't get
/// past, handed to an installed OOM callback (see [`OomCallback`]).
#[derive(Debug, Clone, Copy)]
pub struct OomReader {
    pub pid: u32,
    pub tid: u64,
    pub txn_id: TransactionId,
    /// How many transactions behind the current writer this reader is.
    pub lag: u64,
    /// How many times the callback has already been consulted about this
    /// same stall.
    pub retry: u32,
}

/// What an OOM callback asks the allocator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomAction {
    /// The laggard's reader slot was forcibly released; retry now.
    Resolved,
    /// Ask again (the callback wants to wait a bit longer).
    Retry,
    /// Give up; the caller sees `Error::MapFull`.
    Stop,
}

/// Caller-supplied hook invoked when fresh-page allocation is blocked by a
/// reader that reclamation can't get past. Installed via
/// [`EnvBuilder::set_oomfunc`].
pub type OomCallback = Arc<dyn Fn(OomReader) -> OomAction + Send + Sync>;

/// Runtime knobs that affect write-transaction behaviour but aren't part of
/// the on-disk format.
#[derive(Debug, Clone, Copy)]
pub struct EnvConfig {
    /// Reject a write transaction once its dirty-page set exceeds this many
    /// pages, rather than let it grow unbounded.
    pub max_txn_pages: usize,
    /// Order in which reclaimed pages are handed back out.
    pub reclaim_policy: crate::freelist::ReclaimPolicy,
    /// Soft cap on database size in bytes, independent of `map_size`. `None`
    /// means only the mapping itself bounds growth.
    pub max_database_size: Option<usize>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            max_txn_pages: 1 << 20,
            reclaim_policy: crate::freelist::ReclaimPolicy::default(),
            max_database_size: None,
        }
    }
}

/// Shared environment data
pub(crate) struct EnvInner {
    /// Path to the database
    _path: PathBuf,
    /// I/O backend
    pub(crate) io: Box<dyn IoBackend>,
    /// Current map size
    pub(crate) map_size: usize,
    /// Current transaction ID
    pub(crate) txn_id: AtomicU64,
    /// Write lock
    pub(crate) write_lock: Mutex<()>,
    /// Cross-process reader registry (backed by the lock file)
    pub(crate) readers: ReaderRegistry,
    /// Named databases
    pub(crate) databases: RwLock<HashMap<Option<String>, DbInfo>>,
    /// Free pages tracking
    pub(crate) _free_pages: RwLock<Vec<PageId>>,
    /// Durability mode
    pub(crate) durability: DurabilityMode,
    /// Page checksum mode
    pub(crate) checksum_mode: crate::checksum::ChecksumMode,
    /// Runtime configuration knobs
    pub(crate) config: EnvConfig,
    /// Hot-reader-killer callback, invoked when fresh-page allocation stalls
    /// on a laggard reader.
    pub(crate) oom_func: Option<OomCallback>,

    /// Next page ID to allocate
    pub(crate) next_page_id: AtomicU64,


}

// Safety: EnvInner is Send/Sync because IoBackend is Send/Sync
unsafe impl Send for EnvInner {}
unsafe impl Sync for EnvInner {}

impl EnvInner {
    /// Read all meta pages and validate their shape before casting.
    pub(crate) fn read_metas(&self) -> Result<[MetaPage; NUM_METAS]> {
        let mut metas = [MetaPage::new(); NUM_METAS];
        for (i, slot) in meta::META_PAGE_IDS.iter().enumerate() {
            let page = self.io.read_page(*slot)?;

            if size_of::<MetaPage>() > page.data.len() {
                return Err(Error::Corruption {
                    details: "MetaPage size exceeds page data".into(),
                    page_id: None,
                });
            }
            if page.data.as_ptr() as usize % std::mem::align_of::<MetaPage>() != 0 {
                return Err(Error::Corruption {
                    details: "MetaPage not properly aligned".into(),
                    page_id: None,
                });
            }

            metas[i] = unsafe { *(page.data.as_ptr() as *const MetaPage) };
        }
        Ok(metas)
    }

    /// `read_header`: read all meta pages and return the newest valid one.
    ///
    /// A weak head must be re-read once to escape a
    /// concurrent writer's two-phase update race: if a second read still
    /// disagrees with the first, the write is still in flight and we
    /// retry once more before giving up.
    pub(crate) fn meta(&self) -> Result<MetaPage> {
        let (_, head) = self.meta_with_slot()?;
        Ok(head)
    }

    /// Like [`Self::meta`] but also returns which slot the head occupies,
    /// for use by `pick_target` when choosing where to write the next
    /// commit.
    pub(crate) fn meta_with_slot(&self) -> Result<(usize, MetaPage)> {
        let mut metas = self.read_metas()?;
        let mut slot = meta::pick_head(&metas)?;

        if metas[slot].sign() == MetaSign::Weak {
            // Double-check: re-read once to escape a torn-write race.
            let reread = self.read_metas()?;
            let reread_slot = meta::pick_head(&reread)?;
            if reread[reread_slot].last_txnid() != metas[slot].last_txnid() {
                metas = reread;
                slot = reread_slot;
            }
        }

        Ok((slot, metas[slot]))
    }

    /// `pick_target`: choose which meta slot the next commit should
    /// overwrite, given the current on-disk state and the TXNID about to
    /// be committed.
    pub(crate) fn next_meta_slot(&self, pending_txnid: TransactionId) -> Result<PageId> {
        let metas = self.read_metas()?;
        let head = meta::pick_head(&metas)?;
        let target = meta::pick_target(&metas, head, pending_txnid);
        Ok(meta::META_PAGE_IDS[target])
    }
}

/// Database environment
pub struct Environment<S: State = Closed> {
    inner: Option<Arc<EnvInner>>,
    _state: PhantomData<S>,
}

/// Builder for creating environments
pub struct EnvBuilder {
    map_size: usize,
    max_readers: u32,
    max_dbs: u32,
    _flags: u32,
    durability: DurabilityMode,
    checksum_mode: crate::checksum::ChecksumMode,
    config: EnvConfig,
    oom_func: Option<OomCallback>,
}

impl EnvBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: 126,
            max_dbs: MAX_DBS,
            _flags: 0,
            durability: DurabilityMode::AsyncFlush,
            checksum_mode: crate::checksum::ChecksumMode::default(),
            config: EnvConfig::default(),
            oom_func: None,
        }
    }

    /// Set the map size
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// Set the maximum number of readers
    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases
    pub fn max_dbs(mut self, dbs: u32) -> Self {
        self.max_dbs = dbs.min(MAX_DBS);
        self
    }

    /// Set the durability mode
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Set the page checksum mode
    pub fn checksum_mode(mut self, mode: crate::checksum::ChecksumMode) -> Self {
        self.checksum_mode = mode;
        self
    }

    /// Set the maximum number of dirty pages a single write transaction may accumulate
    pub fn max_txn_pages(mut self, max: usize) -> Self {
        self.config.max_txn_pages = max;
        self
    }

    /// Set the order in which reclaimed pages are handed back out
    pub fn reclaim_policy(mut self, policy: crate::freelist::ReclaimPolicy) -> Self {
        self.config.reclaim_policy = policy;
        self
    }

    /// Cap the logical size the database is allowed to grow to, in bytes.
    ///
    /// This is independent of `map_size`: it lets a caller reserve a large
    /// mapping up front while still enforcing a smaller soft limit. Fresh
    /// page allocation fails with `Error::DatabaseFull` once the next page
    /// would cross the limit. Unset by default (only `map_size` bounds
    /// growth).
    pub fn max_database_size(mut self, bytes: usize) -> Self {
        self.config.max_database_size = Some(bytes);
        self
    }

    /// Install the hot-reader-killer callback, consulted when fresh-page
    /// allocation stalls because a laggard reader pins pages reclamation
    /// can't get past. Without one, such a stall
    /// surfaces directly as `Error::MapFull`.
    pub fn set_oomfunc<F>(mut self, callback: F) -> Self
    where
        F: Fn(OomReader) -> OomAction + Send + Sync + 'static,
    {
        self.oom_func = Some(Arc::new(callback));
        self
    }





    /// Build and open the environment
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment<Open>> {
        let path = path.as_ref();

        // Create directory if it doesn't exist
        std::fs::create_dir_all(path)?;

        let data_path = path.join("data.mdb");
        let lock_path = path.join("lock.mdb");

        // Create I/O backend
        let mut io: Box<dyn IoBackend> =
            Box::new(MmapBackend::with_options(&data_path, self.map_size as u64)?);

        // Check if this is a new database by trying to read the first meta page
        let is_new_db = match io.read_page(meta::META_PAGE_IDS[0]) {
            Ok(page) => {
                let meta = unsafe { &*(page.data.as_ptr() as *const MetaPage) };
                meta.magic != crate::meta::MAGIC
            }
            Err(_) => true,
        };

        // Root pages sit right after the NUM_METAS meta pages: free-DB root,
        // then main-DB root.
        let free_root = PageId(NUM_METAS as u64);
        let main_root = PageId(NUM_METAS as u64 + 1);

        let last_txn_id;
        let last_page_id;
        let meta_info;

        if is_new_db {
            // Initialize new database
            let mut meta = MetaPage::new();
            meta.mapsize = self.map_size as u64;
            meta.maxreaders = self.max_readers;
            meta.dbs = self.max_dbs;
            meta.free_db.root = free_root;
            meta.main_db.root = main_root;
            meta.last_pg = main_root;
            meta.set_txnid(TransactionId(0));
            meta.set_sign(MetaSign::Steady);

            // Write all NUM_METAS redundant meta slots with the same
            // initial snapshot.
            for slot in meta::META_PAGE_IDS.iter() {
                let meta_page = meta.to_page(slot.0);
                io.write_page(&meta_page)?;
            }

            // Initialize free DB root page
            let free_page = Page::new(free_root, crate::page::PageFlags::LEAF);
            io.write_page(&free_page)?;

            // Initialize main DB root page
            let main_page = Page::new(main_root, crate::page::PageFlags::LEAF);
            io.write_page(&main_page)?;

            // Sync to disk
            io.sync()?;

            last_txn_id = 0;
            last_page_id = main_root.0;
            meta_info = meta;
        } else {
            // Load existing meta info
            let inner = Arc::new(EnvInner {
                _path: path.to_path_buf(),
                io,
                map_size: self.map_size,
                txn_id: AtomicU64::new(0),
                write_lock: Mutex::new(()),
                readers: ReaderRegistry::open(&lock_path, self.max_readers as usize)?,
                databases: RwLock::new(HashMap::new()),
                _free_pages: RwLock::new(Vec::new()),
                durability: self.durability,
                checksum_mode: self.checksum_mode,
                config: self.config,
                oom_func: self.oom_func.clone(),
                next_page_id: AtomicU64::new(0),
            });

            meta_info = inner.meta()?;
            last_txn_id = meta_info.last_txnid().0;
            last_page_id = meta_info.last_pg.0;

            // Recreate with correct values
            drop(inner);
            io = Box::new(MmapBackend::with_options(&data_path, self.map_size as u64)?);
        }

        // Initialize the cross-process reader registry, backed by the lock file.
        let readers = ReaderRegistry::open(&lock_path, self.max_readers as usize)?;

        let inner = Arc::new(EnvInner {
            _path: path.to_path_buf(),
            io,
            map_size: self.map_size,
            txn_id: AtomicU64::new(last_txn_id),
            write_lock: Mutex::new(()),
            readers,
            databases: RwLock::new(HashMap::new()),
            _free_pages: RwLock::new(Vec::new()),
            durability: self.durability,
            checksum_mode: self.checksum_mode,
            config: self.config,
            oom_func: self.oom_func,
            next_page_id: AtomicU64::new(last_page_id + 1),
        });

        // Initialize main database entry
        {
            let mut dbs = inner.databases.write()
                .expect("Failed to acquire database lock during initialization");
            dbs.insert(None, meta_info.main_db);
        }

        // Note: Named databases will be loaded on-demand from the catalog
        // We can't load them here because we'd need a transaction, but the
        // environment isn't fully constructed yet

        Ok(Environment { inner: Some(inner), _state: PhantomData })
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Environment<Closed> {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment<Closed> {
    /// Create a new closed environment
    pub fn new() -> Self {
        Self { inner: None, _state: PhantomData }
    }

    /// Open the environment
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment<Open>> {
        EnvBuilder::new().open(path)
    }
}

impl Environment<Open> {
    /// Begin a read transaction
    pub fn read_txn(&self) -> Result<Transaction<'_, Read>> {
        Transaction::new_read(self)
    }

    /// Begin a write transaction
    pub fn write_txn(&self) -> Result<Transaction<'_, Write>> {
        Transaction::new_write(self)
    }

    /// Alias for [`read_txn`](Self::read_txn).
    pub fn begin_txn(&self) -> Result<Transaction<'_, Read>> {
        self.read_txn()
    }

    /// Alias for [`write_txn`](Self::write_txn).
    pub fn begin_write_txn(&self) -> Result<Transaction<'_, Write>> {
        self.write_txn()
    }

    /// Get inner reference (for internal use)
    pub(crate) fn inner(&self) -> &Arc<EnvInner> {
        self.inner.as_ref().expect("Environment not open")
    }

    /// Runtime configuration knobs for this environment
    pub fn config(&self) -> &EnvConfig {
        &self.inner().config
    }



    /// Get inner reference (for testing)
    #[cfg(test)]
    #[allow(dead_code)]
    pub(crate) fn inner_test(&self) -> &Arc<EnvInner> {
        self.inner()
    }

    /// Sync data to disk
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner();
        match inner.durability {
            DurabilityMode::NoSync => {
                // No sync requested
                Ok(())
            }
            DurabilityMode::AsyncFlush | DurabilityMode::SyncData | DurabilityMode::FullSync => {
                inner.io.sync()?;
                Ok(())
            }
        }
    }

    /// Force a full synchronous sync regardless of durability mode
    pub fn force_sync(&self) -> Result<()> {
        let inner = self.inner();
        inner.io.sync()?;
        Ok(())
    }
    
    /// Get current space usage information
    pub fn space_info(&self) -> Result<crate::space_info::SpaceInfo> {
        let inner = self.inner();
        let total_pages = inner.io.size_in_pages();
        let next_page_id = inner.next_page_id.load(std::sync::atomic::Ordering::Acquire);
        
        // Get free pages count from a read transaction
        let free_pages = {
            let _txn = self.read_txn()?;
            // Count regular freelist pages
            total_pages.saturating_sub(next_page_id)
        };
        
        let used_pages = next_page_id;
        let map_size = inner.map_size as u64;
        
        Ok(crate::space_info::SpaceInfo::new(
            total_pages,
            used_pages,
            free_pages,
            map_size,
        ))
    }

    /// Get environment statistics
    pub fn stat(&self) -> Result<crate::meta::DbStats> {
        let inner = self.inner();
        let meta = inner.meta()?;

        Ok(crate::meta::DbStats {
            psize: meta.psize,
            depth: meta.main_db.depth,
            branch_pages: meta.main_db.branch_pages,
            leaf_pages: meta.main_db.leaf_pages,
            overflow_pages: meta.main_db.overflow_pages,
            entries: meta.main_db.entries,
        })
    }
}

impl<S: State> Drop for Environment<S> {
    fn drop(&mut self) {
        if let Some(_inner) = self.inner.take() {
            // Meta page alternation handled in commit
        }
    }
}
