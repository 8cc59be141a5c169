use aperture_common::error::{ChannelError, MessageError, ParamError, ShmError};

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown frame decoder '{0}'")]
    UnknownDecoder(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("parameter error: {0}")]
    Param(#[from] ParamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReceiverError {
    /// Add context to the error. Config messages are prefixed; other
    /// variants pass through unchanged.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            ReceiverError::Config(msg) => ReceiverError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }

    /// True for startup failures that should terminate with the bind
    /// failure exit code.
    pub fn is_bind_failure(&self) -> bool {
        matches!(
            self,
            ReceiverError::Channel(ChannelError::Bind { .. }) | ReceiverError::Shm(_)
        )
    }
}
