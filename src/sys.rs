//! Raw `#[repr(C)]` JNI and JVMTI bindings.

pub mod jni;
pub mod jvmti;
