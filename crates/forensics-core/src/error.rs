use thiserror::Error;

/// A bounds-checked read that would run past the end of the buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("read of {requested} bytes at offset {offset} exceeds buffer of {available} bytes")]
    OutOfBounds {
        offset: usize,
        requested: u64,
        available: usize,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GgufError {
    #[error("file too small for GGUF header ({0} bytes)")]
    TooSmall(usize),

    #[error("invalid magic {0:02x?}; not GGUF")]
    InvalidMagic([u8; 4]),

    #[error("truncated: {0}")]
    Truncated(#[from] CursorError),

    #[error("unknown GGUF value type {0}")]
    InvalidValueType(i32),

    #[error("array nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("negative count in header ({field}={value})")]
    NegativeCount { field: &'static str, value: i64 },

    #[error("invalid UTF-8 in {what} at offset {offset}")]
    InvalidUtf8 { what: &'static str, offset: usize },

    #[error("data section offset {data_offset} beyond end of file ({file_size} bytes)")]
    DataOffsetBeyondEof { data_offset: u64, file_size: u64 },

    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafeTensorsError {
    #[error("file too small for safetensors header ({0} bytes)")]
    TooSmall(u64),

    #[error("header of {header_size} bytes extends beyond end of file ({file_size} bytes)")]
    HeaderBeyondEof { header_size: u64, file_size: u64 },

    #[error("header does not start with '{{'")]
    NotAnObject,

    #[error("invalid JSON header: {0}")]
    InvalidJson(String),

    #[error("invalid tensor metadata for '{name}': {reason}")]
    InvalidTensor { name: String, reason: String },
}

pub type Result<T, E = GgufError> = std::result::Result<T, E>;
