//! Common imports for embedding the correlation agent.
//!
//! This prelude is intentionally small. It covers the types most hosts use
//! while avoiding over-broad re-exports.

pub use crate::agent::CorrelationAgent;
pub use crate::channel::{default_channel_path, ReturnFrame, RETURN_FRAME_SIZE};
pub use crate::config::AgentConfig;
pub use crate::correlation::{BufferView, Region};
pub use crate::env::{JniEnv, Jvmti};
pub use crate::error::{AgentError, Result};
pub use crate::introspection::{Introspection, Runtime};
pub use crate::stack::{FrameEncoding, MethodHandle, StackRequest};
pub use crate::sys::{jni, jvmti};
