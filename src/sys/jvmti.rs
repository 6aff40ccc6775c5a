// jvmti-correlation/src/sys/jvmti.rs
//
// JVMTI (JVM Tool Interface) bindings, trimmed to what the correlation
// agent calls. Unused vtable slots are kept as padding arrays so every
// named function sits at its jvmti.h offset.
//
// The vtable is 1-based in jvmti.h; slot 1 is reserved and is the first
// field here. Slot numbers in comments match the header.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]

use crate::sys::jni::{jboolean, jclass, jint, jlong, jmethodID, jobject, jthread, JNIEnv};
use std::os::raw::{c_char, c_uchar, c_void};

// --- Versions ---
pub const JVMTI_VERSION_1_2: jint = 0x30010200;
pub const JVMTI_VERSION_21: jint = 0x30150000;

// --- Events ---
pub const JVMTI_EVENT_SAMPLED_OBJECT_ALLOC: u32 = 86;
pub const JVMTI_EVENT_VIRTUAL_THREAD_START: u32 = 87;
pub const JVMTI_EVENT_VIRTUAL_THREAD_END: u32 = 88;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

// --- Extension function/event parameter kinds ---
pub const JVMTI_KIND_IN: jint = 91;
pub const JVMTI_KIND_IN_PTR: jint = 92;
pub const JVMTI_KIND_IN_BUF: jint = 93;
pub const JVMTI_KIND_ALLOC_BUF: jint = 94;
pub const JVMTI_KIND_ALLOC_ALLOC_BUF: jint = 95;
pub const JVMTI_KIND_OUT: jint = 96;
pub const JVMTI_KIND_OUT_BUF: jint = 97;

// --- Extension parameter base types ---
pub const JVMTI_TYPE_JBYTE: jint = 101;
pub const JVMTI_TYPE_JCHAR: jint = 102;
pub const JVMTI_TYPE_JSHORT: jint = 103;
pub const JVMTI_TYPE_JINT: jint = 104;
pub const JVMTI_TYPE_JLONG: jint = 105;
pub const JVMTI_TYPE_JFLOAT: jint = 106;
pub const JVMTI_TYPE_JDOUBLE: jint = 107;
pub const JVMTI_TYPE_JBOOLEAN: jint = 108;
pub const JVMTI_TYPE_JOBJECT: jint = 109;
pub const JVMTI_TYPE_JTHREAD: jint = 110;
pub const JVMTI_TYPE_JCLASS: jint = 111;
pub const JVMTI_TYPE_JVALUE: jint = 112;
pub const JVMTI_TYPE_JFIELDID: jint = 113;
pub const JVMTI_TYPE_JMETHODID: jint = 114;
pub const JVMTI_TYPE_CCHAR: jint = 115;
pub const JVMTI_TYPE_CVOID: jint = 116;
pub const JVMTI_TYPE_JNIENV: jint = 117;

// --- Error Codes ---
//
// A transparent newtype rather than an enum: the JVM may hand back any
// code, and materialising an unknown discriminant into a Rust enum is UB.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct jvmtiError(pub u32);

impl jvmtiError {
    pub const NONE: jvmtiError = jvmtiError(0);
    pub const INVALID_THREAD: jvmtiError = jvmtiError(10);
    pub const THREAD_NOT_ALIVE: jvmtiError = jvmtiError(15);
    pub const INVALID_CLASS: jvmtiError = jvmtiError(21);
    pub const INVALID_METHODID: jvmtiError = jvmtiError(23);
    pub const NOT_AVAILABLE: jvmtiError = jvmtiError(98);
    pub const MUST_POSSESS_CAPABILITY: jvmtiError = jvmtiError(99);
    pub const NULL_POINTER: jvmtiError = jvmtiError(100);
    pub const ABSENT_INFORMATION: jvmtiError = jvmtiError(101);
    pub const INVALID_EVENT_TYPE: jvmtiError = jvmtiError(102);
    pub const ILLEGAL_ARGUMENT: jvmtiError = jvmtiError(103);
    pub const OUT_OF_MEMORY: jvmtiError = jvmtiError(110);
    pub const WRONG_PHASE: jvmtiError = jvmtiError(112);
    pub const INTERNAL: jvmtiError = jvmtiError(113);
    pub const UNATTACHED_THREAD: jvmtiError = jvmtiError(115);
    pub const INVALID_ENVIRONMENT: jvmtiError = jvmtiError(116);

    pub fn is_ok(self) -> bool {
        self == Self::NONE
    }

    /// Symbolic name for the codes above, `None` for anything else.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NONE => "JVMTI_ERROR_NONE",
            Self::INVALID_THREAD => "JVMTI_ERROR_INVALID_THREAD",
            Self::THREAD_NOT_ALIVE => "JVMTI_ERROR_THREAD_NOT_ALIVE",
            Self::INVALID_CLASS => "JVMTI_ERROR_INVALID_CLASS",
            Self::INVALID_METHODID => "JVMTI_ERROR_INVALID_METHODID",
            Self::NOT_AVAILABLE => "JVMTI_ERROR_NOT_AVAILABLE",
            Self::MUST_POSSESS_CAPABILITY => "JVMTI_ERROR_MUST_POSSESS_CAPABILITY",
            Self::NULL_POINTER => "JVMTI_ERROR_NULL_POINTER",
            Self::ABSENT_INFORMATION => "JVMTI_ERROR_ABSENT_INFORMATION",
            Self::INVALID_EVENT_TYPE => "JVMTI_ERROR_INVALID_EVENT_TYPE",
            Self::ILLEGAL_ARGUMENT => "JVMTI_ERROR_ILLEGAL_ARGUMENT",
            Self::OUT_OF_MEMORY => "JVMTI_ERROR_OUT_OF_MEMORY",
            Self::WRONG_PHASE => "JVMTI_ERROR_WRONG_PHASE",
            Self::INTERNAL => "JVMTI_ERROR_INTERNAL",
            Self::UNATTACHED_THREAD => "JVMTI_ERROR_UNATTACHED_THREAD",
            Self::INVALID_ENVIRONMENT => "JVMTI_ERROR_INVALID_ENVIRONMENT",
            _ => return None,
        })
    }
}

pub type jlocation = jlong;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiFrameInfo {
    pub method: jmethodID,
    pub location: jlocation,
}

impl Default for jvmtiFrameInfo {
    fn default() -> Self {
        jvmtiFrameInfo { method: std::ptr::null_mut(), location: 0 }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiParamInfo {
    pub name: *mut c_char,
    pub kind: jint,
    pub base_type: jint,
    pub null_ok: jboolean,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiExtensionEventInfo {
    pub extension_event_index: jint,
    pub id: *mut c_char,
    pub short_description: *mut c_char,
    pub param_count: jint,
    pub params: *mut jvmtiParamInfo,
}

/// Extension events are varargs in jvmti.h; handlers are installed through
/// this erased pointer type and cast back by the JVM.
pub type jvmtiExtensionEvent = Option<unsafe extern "system" fn()>;

/// Shape of the HotSpot virtual thread mount/unmount extension events.
pub type JvmtiVirtualThreadTransitionFn =
    unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread);

// --- Capabilities ---
//
// jvmtiCapabilities is a 128-bit bitfield. Only the bits this agent
// negotiates get accessors.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl Default for jvmtiCapabilities {
    fn default() -> Self { Self { bits: [0; 4] } }
}

impl jvmtiCapabilities {
    fn set_bit(&mut self, bit_offset: usize, value: bool) {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        if value {
            self.bits[word_index] |= 1 << bit_index;
        } else {
            self.bits[word_index] &= !(1 << bit_index);
        }
    }

    fn get_bit(&self, bit_offset: usize) -> bool {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        (self.bits[word_index] & (1 << bit_index)) != 0
    }

    // [43]
    pub fn set_can_generate_sampled_object_alloc_events(&mut self, v: bool) { self.set_bit(43, v); }
    pub fn can_generate_sampled_object_alloc_events(&self) -> bool { self.get_bit(43) }

    // [44]
    pub fn set_can_support_virtual_threads(&mut self, v: bool) { self.set_bit(44, v); }
    pub fn can_support_virtual_threads(&self) -> bool { self.get_bit(44) }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }
}

// --- Function types ---

pub type JvmtiSetEventNotificationModeFn = unsafe extern "C" fn(env: *mut jvmtiEnv, mode: jint, event_type: u32, event_thread: jthread, ...) -> jvmtiError;
pub type JvmtiDeallocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type JvmtiGetMethodNameFn = unsafe extern "system" fn(env: *mut jvmtiEnv, method: jmethodID, name_ptr: *mut *mut c_char, signature_ptr: *mut *mut c_char, generic_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetMethodDeclaringClassFn = unsafe extern "system" fn(env: *mut jvmtiEnv, method: jmethodID, declaring_class_ptr: *mut jclass) -> jvmtiError;
pub type JvmtiGetCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *mut jvmtiCapabilities) -> jvmtiError;
pub type JvmtiGetStackTraceFn = unsafe extern "system" fn(env: *mut jvmtiEnv, thread: jthread, start_depth: jint, max_frame_count: jint, frame_buffer: *mut jvmtiFrameInfo, count_ptr: *mut jint) -> jvmtiError;
pub type JvmtiSetEventCallbacksFn = unsafe extern "system" fn(env: *mut jvmtiEnv, callbacks: *const jvmtiEventCallbacks, size_of_callbacks: jint) -> jvmtiError;
pub type JvmtiGetExtensionEventsFn = unsafe extern "system" fn(env: *mut jvmtiEnv, extension_count_ptr: *mut jint, extensions: *mut *mut jvmtiExtensionEventInfo) -> jvmtiError;
pub type JvmtiSetExtensionEventCallbackFn = unsafe extern "system" fn(env: *mut jvmtiEnv, extension_event_index: jint, callback: jvmtiExtensionEvent) -> jvmtiError;
pub type JvmtiDisposeEnvironmentFn = unsafe extern "system" fn(env: *mut jvmtiEnv) -> jvmtiError;
pub type JvmtiGetErrorNameFn = unsafe extern "system" fn(env: *mut jvmtiEnv, error: jvmtiError, name_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetPotentialCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *mut jvmtiCapabilities) -> jvmtiError;
pub type JvmtiAddCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;
pub type JvmtiRelinquishCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;
pub type JvmtiSetHeapSamplingIntervalFn = unsafe extern "system" fn(env: *mut jvmtiEnv, sampling_interval: jint) -> jvmtiError;

// --- Event callback types ---

pub type JvmtiSampledObjectAllocFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    thread: jthread,
    object: jobject,
    object_klass: jclass,
    size: jlong
);

type Slot = *mut c_void;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct jvmtiInterface_1_ {
    /*   1: RESERVED */
    pub reserved1: Slot,
    /*   2: Set Event Notification Mode */
    pub SetEventNotificationMode: Option<JvmtiSetEventNotificationModeFn>,
    /*   3-46 */
    _slots_3_46: [Slot; 44],
    /*  47: Deallocate */
    pub Deallocate: Option<JvmtiDeallocateFn>,
    /*  48-63 */
    _slots_48_63: [Slot; 16],
    /*  64: Get Method Name (and Signature) */
    pub GetMethodName: Option<JvmtiGetMethodNameFn>,
    /*  65: Get Method Declaring Class */
    pub GetMethodDeclaringClass: Option<JvmtiGetMethodDeclaringClassFn>,
    /*  66-88 */
    _slots_66_88: [Slot; 23],
    /*  89: Get Capabilities */
    pub GetCapabilities: Option<JvmtiGetCapabilitiesFn>,
    /*  90-103 */
    _slots_90_103: [Slot; 14],
    /* 104: Get Stack Trace */
    pub GetStackTrace: Option<JvmtiGetStackTraceFn>,
    /* 105-121 */
    _slots_105_121: [Slot; 17],
    /* 122: Set Event Callbacks */
    pub SetEventCallbacks: Option<JvmtiSetEventCallbacksFn>,
    /* 123-124 */
    _slots_123_124: [Slot; 2],
    /* 125: Get Extension Events */
    pub GetExtensionEvents: Option<JvmtiGetExtensionEventsFn>,
    /* 126: Set Extension Event Callback */
    pub SetExtensionEventCallback: Option<JvmtiSetExtensionEventCallbackFn>,
    /* 127: Dispose Environment */
    pub DisposeEnvironment: Option<JvmtiDisposeEnvironmentFn>,
    /* 128: Get Error Name */
    pub GetErrorName: Option<JvmtiGetErrorNameFn>,
    /* 129-139 */
    _slots_129_139: [Slot; 11],
    /* 140: Get Potential Capabilities */
    pub GetPotentialCapabilities: Option<JvmtiGetPotentialCapabilitiesFn>,
    /* 141: RESERVED */
    pub reserved141: Slot,
    /* 142: Add Capabilities */
    pub AddCapabilities: Option<JvmtiAddCapabilitiesFn>,
    /* 143: Relinquish Capabilities */
    pub RelinquishCapabilities: Option<JvmtiRelinquishCapabilitiesFn>,
    /* 144-155 */
    _slots_144_155: [Slot; 12],
    /* 156: Set Heap Sampling Interval */
    pub SetHeapSamplingInterval: Option<JvmtiSetHeapSamplingIntervalFn>,
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}

/// Event callback table. Events 50..=85 precede `SampledObjectAlloc`; this
/// agent only installs the sampled allocation hook, so they stay null.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiEventCallbacks {
    _events_50_85: [Slot; 36],
    pub SampledObjectAlloc: Option<JvmtiSampledObjectAllocFn>,
    pub VirtualThreadStart: Slot,
    pub VirtualThreadEnd: Slot,
}

impl Default for jvmtiEventCallbacks {
    fn default() -> Self {
        jvmtiEventCallbacks {
            _events_50_85: [std::ptr::null_mut(); 36],
            SampledObjectAlloc: None,
            VirtualThreadStart: std::ptr::null_mut(),
            VirtualThreadEnd: std::ptr::null_mut(),
        }
    }
}
