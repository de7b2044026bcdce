//! Error types for backend operations.
//!
//! Three domains never overlap: render/config errors abort before any side
//! effect, transport errors come from the upstream hop, and a remote exit
//! status is not an error at all (it is the `Ok` value of a task).

use thiserror::Error;

use crate::template::RenderError;

/// Boxed source for transport failures, so both `russh` errors and I/O errors fit.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A templated configuration value could not be rendered.
    Render,
    /// The upstream hop failed (dial, auth, channel, relay).
    Transport,
    /// The principal may not use this backend.
    NotAcceptable,
    /// A caller broke an invariant of the contract.
    System,
    /// The operation is not permitted for this backend.
    Permission,
    /// The task type cannot be dispatched by this backend.
    Dispatch,
}

/// Errors returned by repositories and session proxies.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot render {field}: {source}")]
    Render {
        field: &'static str,
        #[source]
        source: RenderError,
    },

    #[error("{message}: {source}")]
    Transport {
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("environment is not acceptable for this authorization")]
    NotAcceptable,

    #[error("system error: {0}")]
    System(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("unsupported task type: {0}")]
    UnsupportedTask(String),
}

impl Error {
    /// Exit code reported for a task that failed instead of exiting.
    pub const EXIT_CODE: i32 = -1;

    pub fn render(field: &'static str, source: RenderError) -> Self {
        Self::Render { field, source }
    }

    pub fn transport(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Render { .. } => ErrorKind::Render,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::NotAcceptable => ErrorKind::NotAcceptable,
            Self::System(_) => ErrorKind::System,
            Self::Permission(_) => ErrorKind::Permission,
            Self::UnsupportedTask(_) => ErrorKind::Dispatch,
        }
    }
}

/// Numeric result of a task: the remote exit status, or -1 if it failed.
pub fn exit_code_of(result: &Result<u32, Error>) -> i32 {
    match result {
        Ok(status) => i32::try_from(*status).unwrap_or(i32::MAX),
        Err(_) => Error::EXIT_CODE,
    }
}
