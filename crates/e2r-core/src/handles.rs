#![forbid(unsafe_code)]
//! Open-handle table.
//!
//! Handles are small integers handed out lowest-free first, up to a fixed
//! ceiling. Each slot holds its session behind its own mutex, so the table
//! lock covers only slot bookkeeping and never an I/O operation.

use crate::session::OpenFile;
use e2r_error::{Ext2Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default handle ceiling.
pub const DEFAULT_MAX_HANDLES: usize = 2048;

pub type Handle = u64;

/// How a handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    File,
    Directory,
}

#[derive(Debug)]
struct Slot {
    kind: HandleKind,
    file: Arc<Mutex<OpenFile>>,
}

#[derive(Debug)]
pub struct HandleTable {
    slots: Mutex<Vec<Option<Slot>>>,
    max_handles: usize,
}

impl HandleTable {
    #[must_use]
    pub fn new(max_handles: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            max_handles,
        }
    }

    #[must_use]
    pub fn max_handles(&self) -> usize {
        self.max_handles
    }

    /// Install `file` in the lowest free slot.
    pub fn allocate(&self, file: OpenFile, kind: HandleKind) -> Result<Handle> {
        let mut slots = self.slots.lock();
        let idx = match slots.iter().position(Option::is_none) {
            Some(idx) => idx,
            None if slots.len() < self.max_handles => {
                slots.push(None);
                slots.len() - 1
            }
            None => return Err(Ext2Error::TableFull),
        };
        slots[idx] = Some(Slot {
            kind,
            file: Arc::new(Mutex::new(file)),
        });
        drop(slots);
        Ok(idx as Handle)
    }

    /// Session behind `handle`, which must have been opened as `kind`.
    pub fn get(&self, handle: Handle, kind: HandleKind) -> Result<Arc<Mutex<OpenFile>>> {
        let slots = self.slots.lock();
        match Self::slot_index(handle).and_then(|idx| slots.get(idx)) {
            Some(Some(slot)) if slot.kind == kind => Ok(Arc::clone(&slot.file)),
            _ => Err(Ext2Error::BadHandle(handle)),
        }
    }

    /// Session behind `handle` regardless of how it was opened.
    pub fn get_any(&self, handle: Handle) -> Result<(HandleKind, Arc<Mutex<OpenFile>>)> {
        let slots = self.slots.lock();
        match Self::slot_index(handle).and_then(|idx| slots.get(idx)) {
            Some(Some(slot)) => Ok((slot.kind, Arc::clone(&slot.file))),
            _ => Err(Ext2Error::BadHandle(handle)),
        }
    }

    /// Free `handle`. The slot becomes the next candidate for reuse.
    pub fn release(&self, handle: Handle, kind: HandleKind) -> Result<()> {
        let mut slots = self.slots.lock();
        let Some(entry) = Self::slot_index(handle).and_then(|idx| slots.get_mut(idx)) else {
            return Err(Ext2Error::BadHandle(handle));
        };
        if entry.as_ref().is_some_and(|slot| slot.kind == kind) {
            *entry = None;
            Ok(())
        } else {
            Err(Ext2Error::BadHandle(handle))
        }
    }

    /// Number of handles currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    fn slot_index(handle: Handle) -> Option<usize> {
        usize::try_from(handle).ok()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDLES)
    }
}
