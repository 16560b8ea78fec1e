//! Commit batches: the unit written to the WAL and applied to the memtable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type of write operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Put operation with key and value
    Put {
        /// Environment key (`db id ++ key`)
        key: Vec<u8>,
        /// Value to associate with the key
        value: Vec<u8>,
    },
    /// Delete operation with key
    Delete {
        /// Environment key (`db id ++ key`)
        key: Vec<u8>,
    },
}

impl WriteOp {
    /// The environment key this operation touches.
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }

    /// Approximate memory footprint of the operation.
    pub fn approximate_size(&self) -> usize {
        match self {
            WriteOp::Put { key, value } => key.len() + value.len() + 16,
            WriteOp::Delete { key } => key.len() + 16,
        }
    }
}

/// All operations of one committed write transaction, sharing one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalBatch {
    /// Sequence number assigned at commit
    pub sequence: u64,
    /// Operations in key order
    pub ops: Vec<WriteOp>,
}

impl WalBatch {
    /// Builds a batch from a transaction's pending overlay.
    pub(crate) fn from_pending(sequence: u64, pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>) -> Self {
        let ops = pending
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => WriteOp::Put { key, value },
                None => WriteOp::Delete { key },
            })
            .collect();
        Self { sequence, ops }
    }

    /// Approximate memory footprint of the batch.
    pub fn approximate_size(&self) -> usize {
        self.ops.iter().map(WriteOp::approximate_size).sum()
    }
}
