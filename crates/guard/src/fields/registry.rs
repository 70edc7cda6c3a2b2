//! Shared, lock-free handle to the current [`FieldTable`].
//!
//! Readers take an `Arc` snapshot; a reload atomically swaps the whole table.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::FieldTable;

/// Cheaply cloneable handle to the active field table.
///
/// Internally backed by [`ArcSwap`] so readers never block and a reload can
/// atomically swap in a completely new table.
#[derive(Clone, Debug)]
pub struct FieldRegistry {
    inner: Arc<ArcSwap<FieldTable>>,
}

impl FieldRegistry {
    /// Create a registry serving `table`.
    pub fn new(table: FieldTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    /// Current table. Lock-free; safe on the hot path.
    pub fn snapshot(&self) -> Arc<FieldTable> {
        self.inner.load_full()
    }

    /// Atomically replace the entire table.
    ///
    /// Operations already holding a snapshot keep using the old one.
    pub fn replace(&self, table: FieldTable) {
        self.inner.store(Arc::new(table));
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new(FieldTable::builtin())
    }
}
