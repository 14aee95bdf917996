//! Embedded, memory-mapped, transactional key/value store.
//!
//! `vellum` provides ACID guarantees through multi-version concurrency
//! control (MVCC) over a copy-on-write B+tree, in the tradition of
//! LMDB-family engines: single writer, many lock-free readers, all
//! sharing one memory-mapped datafile. Durability is shadow-paging, not
//! write-ahead logging — every commit swaps in a new meta page rather
//! than replaying a log.

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]
// #![cfg_attr(feature = "simd", feature(portable_simd))]

pub mod branch;
pub mod btree;
pub mod cache_aligned;
pub mod catalog;
pub mod comparator;
pub mod copy;
pub mod cursor;
pub mod cursor_iter;
pub mod db;
pub mod dupsort;
pub mod env;
pub mod error;
pub mod fixed_size;
pub mod freelist;
pub mod io;
pub mod meta;
pub mod nested_txn;
pub mod node;
pub mod node_utils;
pub mod overflow;
pub mod overflow_consecutive;
pub mod overflow_stream;
pub mod page;
pub mod page_allocator;
pub mod page_capacity;
pub mod preflight_checks;
pub mod reader;
pub mod simd;
pub mod space_info;
pub mod tree_utils;
pub mod txn;

#[cfg(test)]
mod test_overflow_debug;

// Re-exports
pub use db::{Database, DatabaseFlags, Key, Value};
pub use env::{EnvBuilder, Environment};
pub use error::{Error, Result};
pub use txn::{ReadTransaction, Transaction, WriteTransaction};

// Type aliases for common use cases
/// A read-only transaction
pub type RoTxn<'env> = Transaction<'env, txn::Read>;
/// A read-write transaction
pub type RwTxn<'env> = Transaction<'env, txn::Write>;

/// The default page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Maximum key size (when not using longer-keys feature)


/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
