//! Meta page and database metadata management
//!
//! Three redundant meta pages live at the head of the file (`NUM_METAS`).
//! A meta is valid only when its `txnid_a`/`txnid_b` bracket agrees and its
//! magic/version match; the bracket lets a reader distinguish a torn write
//! (crash mid-update) from a genuine snapshot. See [`pick_head`] and
//! [`pick_target`] for how the writer chooses which of the three slots to
//! read from and overwrite.

use crate::error::{Error, PageId, Result, TransactionId};
use crate::page::{Page, PageFlags, PAGE_SIZE};
use static_assertions::const_assert;
use std::mem::size_of;

/// Number of redundant meta pages at the head of the file.
pub const NUM_METAS: usize = 3;

/// Page IDs occupied by the meta pages.
pub const META_PAGE_IDS: [PageId; NUM_METAS] = [PageId(0), PageId(1), PageId(2)];

/// Version of the database format
pub const DB_VERSION: u32 = 2;

/// Magic number to identify database files
pub const MAGIC: u32 = 0xBEEFC0DE;

/// Durability signature carried by a meta page.
///
/// `Steady` certifies that every page the meta references was fsynced
/// before the meta itself was written; `Weak` makes no such promise and
/// must only be trusted when a matching steady meta also exists; `None`
/// means the caller opted out of sync entirely ("utterly no sync").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaSign {
    /// No durability claim at all.
    None = 0,
    /// Payload may not have reached disk yet.
    Weak = 1,
    /// All referenced pages were synced before this meta was written.
    Steady = 2,
}

impl MetaSign {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => MetaSign::Steady,
            1 => MetaSign::Weak,
            _ => MetaSign::None,
        }
    }
}

/// Database statistics
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    /// Size of database in pages
    pub psize: u32,
    /// Depth of B-tree
    pub depth: u32,
    /// Number of internal pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of entries
    pub entries: u64,
}

/// Database info stored in branch pages
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DbInfo {
    /// Database flags
    pub flags: u32,
    /// Depth of tree
    pub depth: u32,
    /// Number of pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of entries
    pub entries: u64,
    /// Root page number
    pub root: PageId,
    /// Last key page for append optimization (0 = not cached)
    pub last_key_page: PageId,
    /// Monotonic per-DBI sequence counter (used for auto-increment keys)
    pub sequence: u64,
}

impl Default for DbInfo {
    fn default() -> Self {
        Self {
            flags: 0,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: PageId(0),
            last_key_page: PageId(0),
            sequence: 0,
        }
    }
}

/// Meta page structure - contains database metadata
///
/// `txnid_a` and `txnid_b` bracket the payload: a writer zeroes `txnid_a`,
/// writes the body, then publishes `txnid_b`. A reader that observes
/// `txnid_a != txnid_b` has caught a write in flight and must retry against
/// another slot (see [`crate::reader`]).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetaPage {
    /// Magic number
    pub magic: u32,
    /// Database format version
    pub version: u32,
    /// First half of the torn-write detection bracket
    pub txnid_a: u64,
    /// Second half of the torn-write detection bracket
    pub txnid_b: u64,
    /// Durability signature for the payload this meta references
    sign: u8,
    /// Database flags
    pub flags: u32,
    /// Database page size
    pub psize: u32,
    /// Max reader slots
    pub maxreaders: u32,
    /// Max number of named databases
    pub dbs: u32,
    /// Last page number in database
    pub last_pg: PageId,
    /// Growth step, in pages, applied when the map must grow
    pub growth_step: u32,
    /// Shrink threshold, in pages, below which the map may be shrunk
    pub shrink_threshold: u32,
    /// Total map size
    pub mapsize: u64,
    /// Main database info
    pub main_db: DbInfo,
    /// Free database info
    pub free_db: DbInfo,
    /// User-defined canary values, carried opaquely across commits
    pub canary: [u64; 4],
}

impl Default for MetaPage {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaPage {
    /// Create a new meta page
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: DB_VERSION,
            txnid_a: 0,
            txnid_b: 0,
            sign: MetaSign::None as u8,
            flags: 0,
            psize: PAGE_SIZE as u32,
            maxreaders: 126,
            dbs: 2,
            last_pg: PageId(NUM_METAS as u64 - 1),
            growth_step: 256,
            shrink_threshold: 1024,
            mapsize: 0,
            main_db: DbInfo::default(),
            free_db: DbInfo::default(),
            canary: [0; 4],
        }
    }

    /// The transaction this meta snapshots, once `txnid_a == txnid_b`.
    pub fn last_txnid(&self) -> TransactionId {
        TransactionId(self.txnid_a)
    }

    /// Stamp both halves of the bracket with the same TXNID.
    pub fn set_txnid(&mut self, id: TransactionId) {
        self.txnid_a = id.0;
        self.txnid_b = id.0;
    }

    /// Current durability signature.
    pub fn sign(&self) -> MetaSign {
        MetaSign::from_u8(self.sign)
    }

    /// Set the durability signature.
    pub fn set_sign(&mut self, sign: MetaSign) {
        self.sign = sign as u8;
    }

    /// A meta is valid iff magic/version match and the bracket agrees.
    /// A torn write (crash between writing `txnid_a` and `txnid_b`) leaves
    /// the bracket mismatched and the meta is rejected.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.version == DB_VERSION && self.txnid_a == self.txnid_b
    }

    /// Whether this meta's referenced pages are certified durable.
    pub fn is_steady(&self) -> bool {
        self.sign() == MetaSign::Steady
    }

    /// Validate the meta page, returning the specific error on failure.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corruption {
                details: format!("Invalid magic number: 0x{:x}", self.magic),
                page_id: None,
            });
        }

        if self.version != DB_VERSION {
            return Err(Error::VersionMismatch { expected: DB_VERSION, found: self.version });
        }

        if self.txnid_a != self.txnid_b {
            return Err(Error::Corruption {
                details: "torn meta write: txnid bracket mismatch".into(),
                page_id: None,
            });
        }

        if self.psize as usize != PAGE_SIZE {
            return Err(Error::Corruption {
                details: format!("Invalid page size: {}", self.psize),
                page_id: None,
            });
        }

        Ok(())
    }

    /// Convert to a page
    pub fn to_page(&self, pgno: u64) -> Box<Page> {
        let mut page = Page::new(PageId(pgno), PageFlags::META);

        // Copy meta page data into page
        unsafe {
            let meta_ptr = page.data.as_mut_ptr() as *mut MetaPage;
            *meta_ptr = *self;
        }

        page
    }

    /// Create from a page
    pub fn from_page(page: &Page) -> Result<&Self> {
        if !page.header.flags.contains(PageFlags::META) {
            return Err(Error::InvalidPageType {
                expected: crate::error::PageType::Meta,
                found: page.header.page_type(),
            });
        }

        let meta = unsafe { &*(page.data.as_ptr() as *const MetaPage) };
        meta.validate()?;
        Ok(meta)
    }
}

/// Pick the "head" meta: the valid meta with the highest TXNID, ties broken
/// in favour of the steady one. Returns the index into `metas`.
///
/// Callers must have already re-read any weak meta once to escape a
/// concurrent writer's two-phase update race before trusting this result.
pub fn pick_head(metas: &[MetaPage; NUM_METAS]) -> Result<usize> {
    let mut best: Option<usize> = None;
    for (i, m) in metas.iter().enumerate() {
        if !m.is_valid() {
            continue;
        }
        best = match best {
            None => Some(i),
            Some(b) => {
                let bm = &metas[b];
                if m.last_txnid().0 > bm.last_txnid().0 {
                    Some(i)
                } else if m.last_txnid().0 == bm.last_txnid().0
                    && m.is_steady()
                    && !bm.is_steady()
                {
                    Some(i)
                } else {
                    Some(b)
                }
            }
        };
    }
    best.ok_or(Error::Corrupted)
}

/// Pick which meta slot to overwrite for a pending commit with TXNID
/// `pending_txnid`.
///
/// Reuses the head's own slot iff its TXNID already equals the pending one
/// (an empty/no-op recommit) or it is weak (not yet durable, safe to
/// clobber); otherwise picks the *oldest* of the remaining slots so that
/// at least one other valid snapshot is always preserved and a torn write
/// can never destroy every meta at once.
pub fn pick_target(metas: &[MetaPage; NUM_METAS], head: usize, pending_txnid: TransactionId) -> usize {
    let h = &metas[head];
    if h.last_txnid() == pending_txnid || h.sign() == MetaSign::Weak {
        return head;
    }
    (0..NUM_METAS)
        .filter(|&i| i != head)
        .min_by_key(|&i| {
            let m = &metas[i];
            if m.is_valid() {
                m.last_txnid().0
            } else {
                0
            }
        })
        .expect("NUM_METAS > 1")
}

const_assert!(size_of::<MetaPage>() < PAGE_SIZE - size_of::<crate::page::PageHeader>());
