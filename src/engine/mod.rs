pub mod migrate;
pub mod rollback;

pub use migrate::{DocumentOutcome, MigrationEngine, MigrationResult};
pub use rollback::{RollbackEngine, RollbackOptions, RollbackOutcome, RollbackResult};

use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation flag checked between documents only.
#[derive(Clone, Copy, Default)]
pub(crate) struct Checkpoint<'a> {
    flag: Option<&'a AtomicBool>,
}

impl<'a> Checkpoint<'a> {
    pub(crate) fn new(flag: &'a AtomicBool) -> Self {
        Self { flag: Some(flag) }
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.flag.is_some_and(|f| f.load(Ordering::SeqCst))
    }
}
