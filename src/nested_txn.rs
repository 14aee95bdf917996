//! Nested transaction support
//!
//! This module provides support for nested (child) transactions within a parent transaction.
//! Child transactions can be committed to the parent or aborted without affecting the parent.
//!
//! NOTE: This is currently a stub implementation. Full nested transaction support
//! requires significant changes to the core transaction system.

use crate::error::{Error, Result};
use crate::txn::{Transaction, Write};

/// A nested transaction that operates within a parent write transaction
/// 
/// NOTE: This is currently a placeholder type. Nested transactions are not yet implemented.
pub struct NestedTransaction<'env, 'parent> {
    _parent: &'parent mut Transaction<'env, Write>,
    _phantom: std::marker::PhantomData<&'env ()>,
}

impl<'env, 'parent> std::fmt::Debug for NestedTransaction<'env, 'parent> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedTransaction")
            .finish_non_exhaustive()
    }
}

impl<'env, 'parent> NestedTransaction<'env, 'parent> {
    /// Create a new nested transaction (NOT IMPLEMENTED)
    pub(crate) fn new(_parent: &'parent mut Transaction<'env, Write>) -> Result<Self> {
        Err(Error::Custom("Nested transactions are not yet implemented".into()))
    }
    
    /// Commit the nested transaction to its parent (NOT IMPLEMENTED)
    pub fn commit(self) -> Result<()> {
        Err(Error::Custom("Nested transactions are not yet implemented".into()))
    }
    
    /// Abort the nested transaction (NOT IMPLEMENTED)
    pub fn abort(self) {
        // No-op for stub implementation
    }
}

/// Extension trait for Transaction to support nested transactions
pub trait NestedTransactionExt<'env> {
    /// Begin a nested transaction
    fn begin_nested(&mut self) -> Result<NestedTransaction<'env, '_>>;
}

impl<'env> NestedTransactionExt<'env> for Transaction<'env, Write> {
    fn begin_nested(&mut self) -> Result<NestedTransaction<'env, '_>> {
        NestedTransaction::new(self)
    }
}
