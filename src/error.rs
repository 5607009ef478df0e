use thiserror::Error;

use crate::{HypernodeId, PartitionId};

/// Errors surfaced by the partitioning pipeline. Internal invariants are
/// checked with `debug_assert!` and never reach this type in release builds.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed input {file}: {reason}")]
    MalformedInput { file: String, reason: String },

    #[error("no feasible partition: {0}")]
    Infeasible(String),

    #[error("cannot contract ({u}, {v}): {reason}")]
    InvalidContraction {
        u: HypernodeId,
        v: HypernodeId,
        reason: &'static str,
    },

    #[error("inconsistent move of node {node}: expected block {expected}, got {actual}")]
    InconsistentMove {
        node: HypernodeId,
        expected: PartitionId,
        actual: PartitionId,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
