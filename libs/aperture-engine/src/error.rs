use aperture_api::error::PluginError;
use aperture_common::error::{ChannelError, MessageError, ParamError, ShmError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("plugin index '{0}' already loaded")]
    DuplicatePlugin(String),

    #[error("plugin '{0}' is not loaded")]
    PluginNotLoaded(String),

    #[error("connecting '{index}' to '{upstream}' would create a cycle")]
    CycleDetected { index: String, upstream: String },

    #[error("frame receiver interface is not configured")]
    FrameReceiverNotConfigured,

    #[error("plugin error: {0}")]
    Plugin(PluginError),

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

impl From<PluginError> for EngineError {
    fn from(e: PluginError) -> Self {
        EngineError::Plugin(e)
    }
}

impl EngineError {
    /// Add context to the error. Config and plugin messages are prefixed;
    /// other variants pass through unchanged.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::Plugin(e) => EngineError::Plugin(e.with_context(ctx)),
            other => other,
        }
    }
}
