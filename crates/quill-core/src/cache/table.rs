//! Lazily materialized, length-keyed tables.
//!
//! Positional tables (rotary cos/sin, alibi bias) are tied to the model's
//! active length and to the device they were built on. [`LazyTable`] makes
//! that lifecycle explicit instead of probing attributes:
//!
//! ```text
//!   Uninitialized{len} ──resize/get_on──► Built{len, device}
//!         ▲                                  │        ▲
//!         │                       invalidate │        │ resize/get_on
//!         │                                  ▼        │
//!         └──────────────────────────────  Stale{len, device}
//! ```
//!
//! `Built` tables move to another device on the first access that asks for
//! one, and are rebuilt when the requested length changes.

use crate::error::{QuillError, Result};
use candle_core::{Device, Tensor};

/// Values that can be moved to another device.
pub trait Relocate: Sized {
    /// Copy `self` onto `device`.
    fn relocate(&self, device: &Device) -> Result<Self>;
}

impl Relocate for Tensor {
    fn relocate(&self, device: &Device) -> Result<Self> {
        Ok(self.to_device(device)?)
    }
}

/// Lifecycle state of a [`LazyTable`].
#[derive(Debug, Clone)]
pub enum TableState<T> {
    /// Declared for `len` positions, no storage yet.
    Uninitialized {
        /// Length the table will be built for.
        len: usize,
    },
    /// Materialized for `len` positions on `device`.
    Built {
        /// Length the table was built for.
        len: usize,
        /// Device holding the table.
        device: Device,
        /// The table itself.
        table: T,
    },
    /// Storage dropped; rebuilt on next access on the same device.
    Stale {
        /// Length to rebuild for.
        len: usize,
        /// Device the table lived on.
        device: Device,
    },
}

/// A table built on demand for a given length and device.
#[derive(Debug, Clone)]
pub struct LazyTable<T> {
    name: &'static str,
    state: TableState<T>,
}

impl<T: Relocate> LazyTable<T> {
    /// Declare a table for `len` positions without building it.
    pub fn new(name: &'static str, len: usize) -> Self {
        Self {
            name,
            state: TableState::Uninitialized { len },
        }
    }

    /// Length the table is (or will be) built for.
    pub fn len(&self) -> usize {
        match &self.state {
            TableState::Uninitialized { len }
            | TableState::Built { len, .. }
            | TableState::Stale { len, .. } => *len,
        }
    }

    /// Whether the table currently holds storage.
    pub fn is_built(&self) -> bool {
        matches!(self.state, TableState::Built { .. })
    }

    /// Current state.
    pub fn state(&self) -> &TableState<T> {
        &self.state
    }

    /// The built table, if any.
    pub fn table(&self) -> Option<&T> {
        match &self.state {
            TableState::Built { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Make the table cover `len` positions.
    ///
    /// Builds when the table has no storage or was built for another
    /// length. An existing table keeps its device; a fresh one lands on
    /// `default_device`.
    pub fn resize<F>(&mut self, len: usize, default_device: &Device, build: F) -> Result<()>
    where
        F: FnOnce(usize, &Device) -> Result<T>,
    {
        let device = match &self.state {
            TableState::Built { len: built, .. } if *built == len => return Ok(()),
            TableState::Built { device, .. } | TableState::Stale { device, .. } => device.clone(),
            TableState::Uninitialized { .. } => default_device.clone(),
        };
        tracing::debug!(table = self.name, len, device = ?device.location(), "building table");
        let table = build(len, &device)?;
        self.state = TableState::Built { len, device, table };
        Ok(())
    }

    /// Drop the storage, remembering length and device.
    pub fn invalidate(&mut self) {
        if let TableState::Built { len, device, .. } = &self.state {
            self.state = TableState::Stale {
                len: *len,
                device: device.clone(),
            };
        }
    }

    /// The table on `device`, building it or moving it there if needed.
    pub fn get_on<F>(&mut self, device: &Device, build: F) -> Result<&T>
    where
        F: FnOnce(usize, &Device) -> Result<T>,
    {
        let replacement = match &self.state {
            TableState::Built { device: current, .. } if current.same_device(device) => None,
            TableState::Built { len, table, .. } => {
                tracing::debug!(table = self.name, to = ?device.location(), "relocating table");
                Some((*len, table.relocate(device)?))
            }
            TableState::Uninitialized { len } | TableState::Stale { len, .. } => {
                tracing::debug!(table = self.name, len, device = ?device.location(), "building table");
                Some((*len, build(*len, device)?))
            }
        };
        if let Some((len, table)) = replacement {
            self.state = TableState::Built {
                len,
                device: device.clone(),
                table,
            };
        }
        self.table()
            .ok_or_else(|| QuillError::CacheNotInitialized(format!("{} table", self.name)))
    }
}
