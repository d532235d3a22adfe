//! Exit status shared by a parent and one of its children.
//!
//! The record outlives whichever of the two exits first. Each side owns one
//! [`ExitStatus`] handle; the record is freed when the second handle is
//! released, so a parent can collect the code of a child that is long gone
//! and a child can exit after its parent without leaking anything.

use keel::sync::Semaphore;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI32, Ordering},
};

struct Record {
    code: AtomicI32,
    loaded: AtomicBool,
    /// Upped once the child knows whether its program loaded.
    load_done: Semaphore<()>,
    /// Upped once the child has exited.
    exited: Semaphore<()>,
}

/// One side's reference to a shared exit status record.
///
/// Not `Clone`: the record counts exactly two holders.
pub struct ExitStatus {
    record: Arc<Record>,
}

impl ExitStatus {
    /// Creates a record and returns the parent's and the child's handles.
    pub fn pair() -> (ExitStatus, ExitStatus) {
        let record = Arc::new(Record {
            code: AtomicI32::new(-1),
            loaded: AtomicBool::new(false),
            load_done: Semaphore::new(0, ()),
            exited: Semaphore::new(0, ()),
        });
        (
            ExitStatus {
                record: record.clone(),
            },
            ExitStatus { record },
        )
    }

    /// Reports the outcome of the load to the parent.
    pub fn set_loaded(&self, loaded: bool) {
        self.record.loaded.store(loaded, Ordering::SeqCst);
        self.record.load_done.up();
    }

    /// Blocks until the child reports its load, and returns whether it
    /// succeeded.
    pub fn wait_loaded(&self) -> bool {
        self.record.load_done.down();
        self.record.loaded.load(Ordering::SeqCst)
    }

    /// Records the exit code, wakes the parent, and drops the child's
    /// reference.
    pub fn exit(self, code: i32) {
        self.record.code.store(code, Ordering::SeqCst);
        self.record.exited.up();
        self.release();
    }

    /// Blocks until the child exits and returns its code, dropping the
    /// parent's reference.
    pub fn wait(self) -> i32 {
        self.record.exited.down();
        let code = self.record.code.load(Ordering::SeqCst);
        self.release();
        code
    }

    /// Code recorded so far; `-1` until the child exits.
    pub fn code(&self) -> i32 {
        self.record.code.load(Ordering::SeqCst)
    }

    /// Drops this reference. Returns `true` if it was the last one and the
    /// record is freed.
    pub fn release(self) -> bool {
        Arc::into_inner(self.record).is_some()
    }
}
