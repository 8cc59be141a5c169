/// Parameter lookup failure inside an envelope or a bound container.
///
/// Both variants are recoverable: control handlers turn them into nack
/// replies, optional lookups fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("missing parameter '{path}'")]
    Missing { path: String },

    #[error("parameter '{path}': expected {expected}")]
    TypeMismatch { path: String, expected: &'static str },
}

impl ParamError {
    pub fn missing(path: impl Into<String>) -> Self {
        ParamError::Missing { path: path.into() }
    }

    pub fn type_mismatch(path: impl Into<String>, expected: &'static str) -> Self {
        ParamError::TypeMismatch {
            path: path.into(),
            expected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed JSON at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("invalid message: {0}")]
    Validation(String),

    #[error(transparent)]
    Param(#[from] ParamError),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("bind to {endpoint} failed: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("no peer bound at inproc endpoint '{0}'")]
    NoPeer(String),

    #[error("channel closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Message(#[from] MessageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("creating shared segment '{name}' failed: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },

    #[error("opening shared segment '{name}' failed: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    #[error("shared segment '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("buffer id {id} out of range (pool has {num_buffers})")]
    SlotOutOfRange { id: u32, num_buffers: u64 },
}
