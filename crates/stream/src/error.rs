//! Error taxonomy for store operations, organized by cause rather than by
//! transport code. The HTTP layer maps each variant onto a status and the
//! protocol headers that go with it.

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream is closed")]
    Closed { next_offset: String },

    #[error("offset {offset} is below the retention horizon {earliest}")]
    Gone { offset: String, earliest: String },

    #[error("content-type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch { expected: String, actual: String },

    #[error("sequence {received} is not greater than last sequence {last}")]
    SequenceConflict { last: String, received: String },

    #[error("producer sequence regression: expected {expected}, received {received}")]
    ProducerSeqRegression { expected: u64, received: u64 },

    #[error("producer sequence gap: expected {expected}, received {received}")]
    ProducerSeqGap { expected: u64, received: u64 },

    #[error("stale producer epoch {received}: current epoch is {current}")]
    StaleEpoch { current: u64, received: u64 },

    #[error("precondition failed: current entity tag is {current}")]
    PreconditionFailed { current: String },

    #[error("stream already exists with different configuration")]
    ConfigMismatch,

    #[error("invalid offset: {0}")]
    InvalidOffset(String),

    #[error("empty body not allowed")]
    EmptyBody,

    #[error("empty arrays not allowed on append")]
    EmptyArrayNotAllowed,

    #[error("request body is not valid JSON")]
    InvalidJson,

    #[error("cannot specify both Stream-TTL and Stream-Expires-At")]
    TtlConflict,

    #[error("invalid TTL value")]
    InvalidTtl,

    #[error("invalid Stream-Expires-At timestamp")]
    InvalidExpiresAt,

    #[error("If-Match cannot be combined with producer headers")]
    IfMatchWithProducer,

    #[error("Stream-Seq cannot be combined with producer headers")]
    SeqWithProducer,

    #[error("invalid producer headers: {0}")]
    InvalidProducer(String),

    #[error("server at capacity: {0}")]
    Busy(&'static str),

    #[error("log corruption in {path}: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Meta(#[from] heed::Error),
}

impl StoreError {
    /// The HTTP status this error maps onto.
    pub fn status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::Closed { .. }
            | StoreError::ContentTypeMismatch { .. }
            | StoreError::SequenceConflict { .. }
            | StoreError::ProducerSeqRegression { .. }
            | StoreError::ProducerSeqGap { .. }
            | StoreError::ConfigMismatch => 409,
            StoreError::Gone { .. } => 410,
            StoreError::StaleEpoch { .. } => 403,
            StoreError::PreconditionFailed { .. } => 412,
            StoreError::InvalidOffset(_)
            | StoreError::EmptyBody
            | StoreError::EmptyArrayNotAllowed
            | StoreError::InvalidJson
            | StoreError::TtlConflict
            | StoreError::InvalidTtl
            | StoreError::InvalidExpiresAt
            | StoreError::IfMatchWithProducer
            | StoreError::SeqWithProducer
            | StoreError::InvalidProducer(_) => 400,
            StoreError::Busy(_) => 503,
            StoreError::Corrupt { .. } | StoreError::Io(_) | StoreError::Meta(_) => 500,
        }
    }
}
