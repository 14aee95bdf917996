//! Cross-process reader registry, backed by a memory-mapped lock file
//!
//! Every process that opens the environment maps the same `lock.mdb` file
//! and coordinates through it: a small header followed by a
//! cacheline-aligned array of reader slots, each publishing `(pid, tid,
//! txnid)`. A slot with `pid == 0` is free. Liveness of a claimed slot's
//! owning process is proven with a `fcntl` byte-range lock keyed to the
//! slot index — a lock taken while the slot is held is released by the OS
//! the instant that process dies, crash or no crash, so a successful probe
//! lock is conclusive proof the owner is gone (see `reader_check`).

use crate::error::{Error, Result, TransactionId};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Default maximum number of concurrent reader slots.
pub const MAX_READERS: usize = 126;

const LOCK_MAGIC: u32 = 0x4C43_5A31;
const LOCK_VERSION: u32 = 1;

/// Reader slot information, stored in shared memory. One cache line wide
/// to avoid false sharing between readers publishing concurrently.
#[repr(C, align(64))]
pub struct ReaderSlot {
    /// Process ID; `0` means the slot is free.
    pub pid: AtomicU32,
    _pad0: u32,
    /// Thread ID (opaque, platform-defined) that owns this slot.
    pub tid: AtomicU64,
    /// TXNID this reader has published as its snapshot; `u64::MAX` is the
    /// "released" sentinel written before the slot is reused.
    pub txn_id: AtomicU64,
    _pad1: [u64; 5],
}

const _: () = assert!(std::mem::size_of::<ReaderSlot>() == 64);

impl ReaderSlot {
    fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }

    /// Try to atomically claim this slot for `pid`. Publication order
    /// matters: `tid` is written before `pid` so that any reader who
    /// observes a non-zero `pid` also observes a valid `tid`.
    fn try_claim(&self, pid: u32) -> bool {
        self.pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

#[repr(C)]
struct LockFileHeader {
    magic: AtomicU32,
    version: AtomicU32,
    /// bits 0..16 size fingerprint, bits 16..32 OS signature
    os_and_format: AtomicU32,
    flags: AtomicU32,
    /// TXNID older than which no live reader can still be reading.
    oldest_reader: AtomicU64,
    num_readers: AtomicU32,
    _pad: u32,
}

fn header_size() -> usize {
    let raw = std::mem::size_of::<LockFileHeader>();
    (raw + 63) & !63
}

fn fingerprint() -> u32 {
    (std::mem::size_of::<ReaderSlot>() as u32 & 0xffff)
        | ((if cfg!(target_os = "linux") { 1u32 } else { 2u32 }) << 16)
}

/// The cross-process reader registry.
pub struct ReaderRegistry {
    file: File,
    mmap: MmapMut,
    max_readers: usize,
}

impl ReaderRegistry {
    fn header(&self) -> &LockFileHeader {
        unsafe { &*(self.mmap.as_ptr() as *const LockFileHeader) }
    }

    fn slot(&self, i: usize) -> &ReaderSlot {
        let base = self.mmap.as_ptr().wrapping_add(header_size()) as *const ReaderSlot;
        unsafe { &*base.add(i) }
    }

    /// Open (creating if absent) the lock file for `path` and map it.
    pub fn open(path: impl AsRef<Path>, max_readers: usize) -> Result<Self> {
        let len = header_size() + max_readers * std::mem::size_of::<ReaderSlot>();

        let file = OpenOptions::new().read(true).write(true).create(true).open(path.as_ref())?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }

        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let registry = Self { file, mmap, max_readers };

        let hdr = registry.header();
        if hdr.magic.load(Ordering::Acquire) != LOCK_MAGIC {
            hdr.magic.store(LOCK_MAGIC, Ordering::Relaxed);
            hdr.version.store(LOCK_VERSION, Ordering::Relaxed);
            hdr.os_and_format.store(fingerprint(), Ordering::Relaxed);
            hdr.flags.store(0, Ordering::Relaxed);
            hdr.oldest_reader.store(0, Ordering::Relaxed);
            hdr.num_readers.store(max_readers as u32, Ordering::Release);
            for i in 0..max_readers {
                registry.slot(i).pid.store(0, Ordering::Relaxed);
                registry.slot(i).txn_id.store(0, Ordering::Relaxed);
            }
        }

        Ok(registry)
    }

    /// Create an in-memory-only registry (used by tests and by callers who
    /// explicitly opted out of cross-process sharing).
    pub fn anonymous(max_readers: usize) -> Result<Self> {
        let len = header_size() + max_readers * std::mem::size_of::<ReaderSlot>();
        let mmap = MmapOptions::new().len(len).map_anon()?;
        let file = tempfile::tempfile()?;
        let registry = Self { file, mmap, max_readers };
        let hdr = registry.header();
        hdr.magic.store(LOCK_MAGIC, Ordering::Relaxed);
        hdr.version.store(LOCK_VERSION, Ordering::Relaxed);
        hdr.num_readers.store(max_readers as u32, Ordering::Release);
        Ok(registry)
    }

    /// `reader_check`: proof-of-life probe for the pid occupying `slot`.
    /// Takes an exclusive non-blocking `fcntl` lock on the byte uniquely
    /// keyed to this slot index; success proves the original holder is
    /// dead (its lock, if any, died with it), failure proves it is alive.
    #[cfg(unix)]
    fn probe_dead(&self, slot: usize) -> bool {
        use std::os::unix::io::AsRawFd;
        let fd = self.file.as_raw_fd();
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = (header_size() + slot) as i64;
        fl.l_len = 1;
        let locked = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) } == 0;
        if locked {
            fl.l_type = libc::F_UNLCK as i16;
            unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
        }
        locked
    }

    #[cfg(not(unix))]
    fn probe_dead(&self, _slot: usize) -> bool {
        // Without byte-range locks we can't prove liveness; conservatively
        // assume alive so we never evict a live reader.
        false
    }

    #[cfg(unix)]
    fn hold_lock(&self, slot: usize) {
        use std::os::unix::io::AsRawFd;
        let fd = self.file.as_raw_fd();
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = (header_size() + slot) as i64;
        fl.l_len = 1;
        unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    }

    #[cfg(not(unix))]
    fn hold_lock(&self, _slot: usize) {}

    /// `claim`: allocate a free slot and publish `txn_id` into it. Retries
    /// once after evicting stale slots if the table is full.
    pub fn acquire(&self, txn_id: TransactionId) -> Result<usize> {
        let pid = std::process::id();

        for attempt in 0..2 {
            for i in 0..self.max_readers {
                let slot = self.slot(i);
                if slot.is_free() && slot.try_claim(pid) {
                    slot.tid.store(thread_id(), Ordering::Release);
                    slot.txn_id.store(txn_id.0, Ordering::Release);
                    self.hold_lock(i);
                    return Ok(i);
                }
            }

            if attempt == 0 {
                self.reader_check();
            }
        }

        Err(Error::ReadersFull)
    }

    /// Publish the sentinel and free the slot.
    pub fn release(&self, slot_index: usize) {
        if slot_index >= self.max_readers {
            return;
        }
        let slot = self.slot(slot_index);
        slot.txn_id.store(u64::MAX, Ordering::Release);
        fence(Ordering::SeqCst);
        slot.tid.store(0, Ordering::Release);
        slot.pid.store(0, Ordering::Release);
    }

    /// `oldest`: lock-free scan for the minimum published TXNID. Stale
    /// reads are safe: a stale value can only be older than the true
    /// current value, which is the conservative direction.
    pub fn oldest_reader(&self) -> Option<TransactionId> {
        let mut oldest: Option<u64> = None;
        for i in 0..self.max_readers {
            let slot = self.slot(i);
            if slot.pid.load(Ordering::Acquire) == 0 {
                continue;
            }
            let txn_id = slot.txn_id.load(Ordering::Acquire);
            if txn_id == u64::MAX || txn_id == 0 {
                continue;
            }
            oldest = Some(oldest.map_or(txn_id, |o| o.min(txn_id)));
        }
        oldest.map(TransactionId)
    }

    /// `reader_check`: scan for slots whose owning pid is provably dead
    /// and release them. Returns the number cleared.
    pub fn reader_check(&self) -> usize {
        let mut cleared = 0;
        for i in 0..self.max_readers {
            let pid = self.slot(i).pid.load(Ordering::Acquire);
            if pid != 0 && self.probe_dead(i) {
                self.release(i);
                cleared += 1;
            }
        }
        cleared
    }

    /// Number of occupied slots.
    pub fn reader_count(&self) -> usize {
        (0..self.max_readers).filter(|&i| !self.slot(i).is_free()).count()
    }

    /// Enumerate all occupied slots for diagnostics (`mdbx_reader_list`
    /// equivalent).
    pub fn enumerate_readers(&self) -> Vec<ReaderInfo> {
        let mut out = Vec::new();
        for i in 0..self.max_readers {
            let slot = self.slot(i);
            let pid = slot.pid.load(Ordering::Acquire);
            if pid == 0 {
                continue;
            }
            out.push(ReaderInfo {
                slot_index: i,
                pid,
                tid: slot.tid.load(Ordering::Acquire),
                txn_id: TransactionId(slot.txn_id.load(Ordering::Acquire)),
                is_stale: self.probe_dead(i),
            });
        }
        out
    }

    /// Advance the cached oldest-reader watermark in the header; used by
    /// the writer so future `reader_check` callers don't need a fresh scan.
    pub fn advance_oldest(&self, txn_id: TransactionId) {
        let hdr = self.header();
        let mut cur = hdr.oldest_reader.load(Ordering::Relaxed);
        while txn_id.0 > cur {
            match hdr.oldest_reader.compare_exchange_weak(
                cur,
                txn_id.0,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Detailed information about an active reader.
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    /// Index into the slot array.
    pub slot_index: usize,
    /// Owning process id.
    pub pid: u32,
    /// Owning thread id (opaque).
    pub tid: u64,
    /// TXNID published by this reader.
    pub txn_id: TransactionId,
    /// Whether a liveness probe currently proves the owner dead.
    pub is_stale: bool,
}

fn thread_id() -> u64 {
    #[cfg(unix)]
    {
        unsafe { libc::pthread_self() as u64 }
    }
    #[cfg(not(unix))]
    {
        thread_local! {
            static THREAD_ID: u8 = 0;
        }
        THREAD_ID.with(|id| id as *const _ as u64)
    }
}
