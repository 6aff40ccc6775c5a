//! The two collaborators the agent consumes.
//!
//! [`Introspection`] is the slice of JVMTI the components call; [`Runtime`]
//! is the hosting JVM seen through JNI (acquiring the JVMTI environment and
//! resolving static callback methods). `Jvmti` and `JniEnv` implement them for
//! a live JVM; tests substitute scripted fakes.

use crate::config::CallbackTarget;
use crate::error::Result;
use crate::sys::jni::{jclass, jint, jmethodID, jthread};
use crate::sys::jvmti::{jvmtiCapabilities, jvmtiError, jvmtiFrameInfo};
use crate::vthread::Transition;
use std::ffi::CStr;
use std::ops::Deref;

/// Name and, when requested, signature of a method.
#[derive(Debug)]
pub struct MethodName<T> {
    pub name: T,
    pub signature: Option<T>,
}

/// One parameter of an advertised extension event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionParam {
    pub kind: jint,
    pub base_type: jint,
    pub null_ok: bool,
}

/// An extension event as advertised by `GetExtensionEvents`, copied out of
/// JVMTI-owned memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEvent {
    pub index: jint,
    pub id: String,
    pub params: Vec<ExtensionParam>,
}

/// JVMTI operations used by the correlation components.
///
/// Implementations must be callable from any thread; JVMTI environments are.
pub trait Introspection: Send + Sync {
    /// Text owned by the introspection layer (JVMTI-allocated for `Jvmti`).
    type Text: Deref<Target = CStr>;

    fn potential_capabilities(&self) -> std::result::Result<jvmtiCapabilities, jvmtiError>;
    fn add_capabilities(&self, caps: &jvmtiCapabilities) -> std::result::Result<(), jvmtiError>;
    fn relinquish_capabilities(&self, caps: &jvmtiCapabilities) -> std::result::Result<(), jvmtiError>;

    /// Globally enables or disables delivery of `event`.
    fn set_event_notification(&self, enable: bool, event: u32) -> std::result::Result<(), jvmtiError>;
    fn set_heap_sampling_interval(&self, bytes: jint) -> std::result::Result<(), jvmtiError>;

    /// Installs the `SampledObjectAlloc` event callback.
    fn install_allocation_hook(&self) -> std::result::Result<(), jvmtiError>;

    /// Fills `frames` from the top of `thread`'s stack (null = current thread),
    /// skipping `start_depth` frames. Returns the number of frames written.
    fn stack_trace(
        &self,
        thread: jthread,
        start_depth: jint,
        frames: &mut [jvmtiFrameInfo],
    ) -> std::result::Result<usize, jvmtiError>;

    fn method_declaring_class(&self, method: jmethodID) -> std::result::Result<jclass, jvmtiError>;
    fn method_name(
        &self,
        method: jmethodID,
        with_signature: bool,
    ) -> std::result::Result<MethodName<Self::Text>, jvmtiError>;

    fn extension_events(&self) -> std::result::Result<Vec<ExtensionEvent>, jvmtiError>;

    /// Installs the native handler for `transition` on extension event
    /// `index`, or clears it when `transition` is `None`.
    fn set_transition_handler(
        &self,
        index: jint,
        transition: Option<Transition>,
    ) -> std::result::Result<(), jvmtiError>;

    /// Releases the environment. No other call is valid afterwards.
    fn dispose(&self) -> std::result::Result<(), jvmtiError>;
}

/// A resolved static method: a global class reference plus its method id.
///
/// Both stay valid on every thread until released through
/// [`Runtime::release_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRef {
    pub class: jclass,
    pub method: jmethodID,
}

unsafe impl Send for CallbackRef {}
unsafe impl Sync for CallbackRef {}

/// The hosting JVM.
pub trait Runtime {
    type Introspection: Introspection;

    /// Acquires a JVMTI environment of the requested version.
    fn acquire_introspection(&self, version: jint) -> Result<Self::Introspection>;

    /// Resolves `target` to a pinned callback reference, `None` if the class
    /// or method does not exist.
    fn resolve_callback(&self, target: &CallbackTarget) -> Option<CallbackRef>;

    fn release_callback(&self, callback: CallbackRef);
}
