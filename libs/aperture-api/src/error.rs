use std::fmt;

use aperture_common::error::{MessageError, ParamError};

/// Error kind for plugin errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Param,
    Decode,
    Frame,
    Io,
    Logic,
}

/// Plugin error — returned by plugin trait methods and the chain host.
///
/// A failure is scoped to the frame or configuration request that caused
/// it; the chain keeps running.
#[derive(Debug)]
pub struct PluginError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PluginError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Config,
            message: msg.into(),
        }
    }

    pub fn param(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Param,
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Decode,
            message: msg.into(),
        }
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Frame,
            message: msg.into(),
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: msg.into(),
        }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Logic,
            message: msg.into(),
        }
    }

    /// Add context to the error, preserving the original kind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PluginError {}

// ---------------------------------------------------------------------------
// From impls: infrastructure error types → PluginError with correct kind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::decode(e.to_string())
    }
}

impl From<ParamError> for PluginError {
    fn from(e: ParamError) -> Self {
        Self::param(e.to_string())
    }
}

impl From<MessageError> for PluginError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::Param(p) => Self::param(p.to_string()),
            other => Self::decode(other.to_string()),
        }
    }
}

/// The absolute frame offset computation went below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOffsetUnderflow {
    pub frame_number: u64,
    pub offset: i64,
}

impl fmt::Display for FrameOffsetUnderflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame offset underflow: frame {} with offset {}",
            self.frame_number, self.offset
        )
    }
}

impl std::error::Error for FrameOffsetUnderflow {}

impl From<FrameOffsetUnderflow> for PluginError {
    fn from(e: FrameOffsetUnderflow) -> Self {
        Self::frame(e.to_string())
    }
}
