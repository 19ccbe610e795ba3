use crate::chunk_id::ChunkId;

pub type Result<T> = std::result::Result<T, CaissonError>;

/// All fatal failure modes of a backup or restore run.
///
/// Every variant aborts the operation in progress; there is no partial
/// recovery beyond what erasure decoding does internally.
#[derive(thiserror::Error, Debug)]
pub enum CaissonError {
    #[error("corrupt bundle {file}: {reason}")]
    CorruptBundle { file: String, reason: String },

    #[error("unknown compression method '{0}'")]
    UnknownCompressionMethod(String),

    #[error("unrecoverable erasure loss in {file}: shard {shard} still corrupt after reconstruction")]
    UnrecoverableErasureLoss { file: String, shard: usize },

    #[error("missing chunk reference {0}")]
    MissingChunkReference(ChunkId),

    #[error("unexpected end of input while reading {0}")]
    UnexpectedEndOfInput(String),

    #[error("invalid config value: {0}")]
    InvalidConfigValue(String),

    #[error("restored stream does not match its descriptor: {0}")]
    DescriptorMismatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}
