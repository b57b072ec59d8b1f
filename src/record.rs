//! Records and the arenas backing their values.
//!
//! Every record handed out by a stream is a handle onto a shared arena
//! holding its decoded values. The stream invalidates the arena when it
//! advances past a record nobody retained, and unconditionally at close;
//! a retained record keeps its arena alive until the matching release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::value::Value;

/// One row of a result set.
///
/// A record obtained from `fetch_next` stays readable until the stream
/// advances past it. Call [`Record::retain`] to extend its lifetime; every
/// retained handle must be balanced by a [`Record::release`].
#[derive(Debug)]
pub struct Record {
    cell: Arc<RowCell>,
}

#[derive(Debug)]
pub(crate) struct RowCell {
    values: RwLock<Option<Vec<Value>>>,
    retains: AtomicU32,
    passed: AtomicBool,
    nfields: usize,
}

impl Record {
    pub(crate) fn new(values: Vec<Value>) -> Self {
        let nfields = values.len();
        Record {
            cell: Arc::new(RowCell {
                values: RwLock::new(Some(values)),
                retains: AtomicU32::new(0),
                passed: AtomicBool::new(false),
                nfields,
            }),
        }
    }

    /// The number of fields in this record.
    ///
    /// Stable for the life of the handle, even after invalidation.
    pub fn len(&self) -> usize {
        self.cell.nfields
    }

    pub fn is_empty(&self) -> bool {
        self.cell.nfields == 0
    }

    /// Returns the `index`-th value, or [`Value::Null`] if the index is out
    /// of range or the record has been invalidated.
    pub fn field(&self, index: usize) -> Value {
        self.get(index).unwrap_or(Value::Null)
    }

    /// Returns the `index`-th value, or `None` if the index is out of range
    /// or the record has been invalidated.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.cell
            .values
            .read()
            .as_ref()
            .and_then(|values| values.get(index))
            .cloned()
    }

    /// Whether this record's values are still readable.
    pub fn is_valid(&self) -> bool {
        self.cell.values.read().is_some()
    }

    /// Retains this record, keeping its values alive past the next stream
    /// advance. Returns a second handle to the same record; the retention
    /// must later be balanced by a [`Record::release`].
    pub fn retain(&self) -> Record {
        self.cell.retains.fetch_add(1, Ordering::AcqRel);
        Record {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Releases one retention. When the last retention is released on a
    /// record the stream has already advanced past, its values are freed.
    pub fn release(self) {
        let prev = self
            .cell
            .retains
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                if self.cell.passed.load(Ordering::Acquire) {
                    self.cell.invalidate();
                }
            }
            Ok(_) => {}
            Err(_) => warn!("release called on a record that was not retained"),
        }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<RowCell> {
        Arc::downgrade(&self.cell)
    }
}

impl RowCell {
    /// Marks the record as passed by the stream. Without outstanding
    /// retentions this frees the values immediately.
    pub(crate) fn mark_passed(&self) {
        self.passed.store(true, Ordering::Release);
        if self.retains.load(Ordering::Acquire) == 0 {
            self.invalidate();
        }
    }

    /// Frees the values unconditionally. Idempotent.
    pub(crate) fn invalidate(&self) {
        *self.values.write() = None;
    }
}
