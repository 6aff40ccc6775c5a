//! High-level environment wrappers for JVMTI and JNI.
//!
//! [`Jvmti`] implements [`Introspection`](crate::introspection::Introspection)
//! over a live JVMTI environment and [`JniEnv`] implements
//! [`Runtime`](crate::introspection::Runtime), so a `CorrelationAgent<Jvmti>`
//! can be initialised straight from the `JNIEnv*` a native method receives:
//!
//! ```rust,ignore
//! use jvmti_correlation::prelude::*;
//!
//! unsafe extern "system" fn init(env: *mut jni::JNIEnv, _class: jni::jclass) -> jni::jint {
//!     let env = JniEnv::from_raw(env);
//!     match AGENT.init(&env) {
//!         Ok(()) => 0,
//!         Err(e) => e.return_code(),
//!     }
//! }
//! ```
//!
//! JVMTI-allocated strings come back as [`JvmtiString`], which frees itself
//! on drop. Java `long[]` frame buffers are written through [`LongArraySink`],
//! which pins the array only for the duration of the copy.

pub use crate::jni_wrapper::{JniEnv, LocalRef, LongArraySink};
pub use crate::jvmti_wrapper::{Jvmti, JvmtiString};
