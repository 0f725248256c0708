// crates/vidpress-core/src/cancel.rs
//
// Session-scoped cancellation flag.
//
// A cloneable handle over an Arc<AtomicBool>. The caller keeps one clone and
// may signal it from any thread at any time; the pipeline hands clones to
// every reader/writer thread and checks them between samples.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
