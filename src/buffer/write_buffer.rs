//! WriteBuffer implementation
//!
//! Vec-backed, append-only between flushes. Locking is the caller's job:
//! the engine keeps the buffer inside its state mutex.

use super::PendingOp;

/// Ordered queue of pending ops
#[derive(Debug, Default)]
pub struct WriteBuffer {
    ops: Vec<PendingOp>,
}

impl WriteBuffer {
    /// Create a new empty buffer
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Append ops keeping their order
    pub fn extend(&mut self, ops: impl IntoIterator<Item = PendingOp>) {
        self.ops.extend(ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Copy of the current contents, used as a flush batch.
    ///
    /// Keys are `Bytes`, so this does not copy key data.
    pub fn snapshot(&self) -> Vec<PendingOp> {
        self.ops.clone()
    }

    /// Remove the first `count` ops after their transaction committed
    pub fn drain_committed(&mut self, count: usize) {
        let count = count.min(self.ops.len());
        self.ops.drain(..count);
    }
}
