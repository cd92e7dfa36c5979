//! Write Buffer Module
//!
//! In-memory queue of writes not yet committed to the log table.
//!
//! ## Responsibilities
//! - Hold pending puts/deletes in call order
//! - Hand out a fixed batch for a flush transaction
//! - Drop exactly the committed batch once the transaction commits
//!
//! Each engine owns its own buffer; nothing here is process-wide.

mod write_buffer;

use bytes::Bytes;

use crate::codec::{self, Value};
use crate::error::{Result, StoreError};

pub use write_buffer::WriteBuffer;

/// A write waiting to be applied to the table
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert (or upsert) a serialized value
    Put { key: Bytes, value: String },

    /// Remove every row for a key
    Delete { key: Bytes },
}

impl PendingOp {
    pub fn is_put(&self) -> bool {
        matches!(self, PendingOp::Put { .. })
    }
}

/// One entry of a caller-supplied batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Value },
    Del { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl AsRef<[u8]>, value: impl Into<Value>) -> Self {
        BatchOp::Put {
            key: key.as_ref().to_vec(),
            value: value.into(),
        }
    }

    pub fn del(key: impl AsRef<[u8]>) -> Self {
        BatchOp::Del {
            key: key.as_ref().to_vec(),
        }
    }

    /// Validate the key and serialize the value
    pub(crate) fn into_pending(self) -> Result<PendingOp> {
        match self {
            BatchOp::Put { key, value } => {
                check_key(&key)?;
                Ok(PendingOp::Put {
                    key: Bytes::from(key),
                    value: codec::encode(&value)?,
                })
            }
            BatchOp::Del { key } => {
                check_key(&key)?;
                Ok(PendingOp::Delete {
                    key: Bytes::from(key),
                })
            }
        }
    }
}

pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
    }
    Ok(())
}

/// Number of puts in a run of ops (what the compactor counts)
pub fn insert_count(ops: &[PendingOp]) -> usize {
    ops.iter().filter(|op| op.is_put()).count()
}
