use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(i32),

    #[error("Unknown opcode: {0}")]
    InvalidOpcode(i32),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(i32),

    #[error("Cache engine is already active")]
    AlreadyActive,

    #[error("Cache engine is not active")]
    NotActive,

    #[error("Cache engine has not been stopped")]
    NotStopped,

    #[error("Playlist capacity exceeded: {count} entries (limit {limit})")]
    CapacityExceeded { count: usize, limit: usize },

    #[error("Payload length {got} is not a multiple of the {record}-byte record size")]
    MalformedPayload { got: usize, record: usize },

    #[error("Zero-length extent at offset {0}")]
    ZeroLengthExtent(u64),

    #[error("Extent at offset {offset} with length {length} overflows the address space")]
    ExtentOverflow { offset: u64, length: u64 },

    #[error("Unknown history record kind: {0}")]
    InvalidHistoryKind(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
