//! Error type shared by every agent operation.

use crate::sys::jni::jint;
use crate::sys::jvmti::jvmtiError;
use nix::errno::Errno;
use thiserror::Error;

/// Return code reported to the managed wrapper on success.
pub const SUCCESS: jint = 0;
/// Return code for operations attempted before `init` (or after `destroy`).
pub const ERROR_NOT_INITIALIZED: jint = -1;
/// Return code for every other failure; the message travels in the exception.
pub const ERROR: jint = -2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("the correlation agent has not been initialized")]
    NotInitialized,

    #[error("the correlation agent is already initialized")]
    AlreadyInitialized,

    #[error("{0} is not supported by this JVM")]
    Unsupported(&'static str),

    #[error("return channel {operation} failed: {message} (errno {code})")]
    Transport {
        operation: &'static str,
        code: i32,
        message: String,
    },

    #[error("could not resolve {0}")]
    ResolutionFailure(String),

    #[error("could not access {0}")]
    BufferAccess(&'static str),

    #[error("jvmti {operation} failed with {} ({code})", jvmti_error_name(.code))]
    Jvmti { operation: &'static str, code: u32 },

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

fn jvmti_error_name(code: &u32) -> &'static str {
    jvmtiError(*code).name().unwrap_or("an unknown error")
}

impl AgentError {
    pub(crate) fn jvmti(operation: &'static str, err: jvmtiError) -> Self {
        AgentError::Jvmti { operation, code: err.0 }
    }

    pub(crate) fn transport(operation: &'static str, errno: Errno) -> Self {
        AgentError::Transport {
            operation,
            code: errno as i32,
            message: errno.desc().to_string(),
        }
    }

    pub(crate) fn io(operation: &'static str, err: &std::io::Error) -> Self {
        AgentError::Transport {
            operation,
            code: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }

    /// Numeric status handed back across the JNI boundary.
    pub fn return_code(&self) -> jint {
        match self {
            AgentError::NotInitialized => ERROR_NOT_INITIALIZED,
            _ => ERROR,
        }
    }

    /// Internal name of the Java exception class thrown for this error.
    pub fn exception_class(&self) -> &'static str {
        match self {
            AgentError::NotInitialized
            | AgentError::AlreadyInitialized
            | AgentError::InvalidState(_) => "java/lang/IllegalStateException",
            AgentError::InvalidArgument(_) => "java/lang/IllegalArgumentException",
            AgentError::Unsupported(_) => "java/lang/UnsupportedOperationException",
            _ => "java/lang/RuntimeException",
        }
    }
}
