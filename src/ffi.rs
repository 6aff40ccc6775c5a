//! JVM entry points.
//!
//! The JVM-facing agent lives in one process-wide [`CorrelationAgent`]. It is
//! configured by `Agent_OnLoad` when the library is loaded with
//! `-agentpath:...=<options>`, otherwise from [`OPTIONS_ENV`] on first use.
//! `JNI_OnLoad` registers the native methods on the bridge class; each one
//! converts an [`AgentError`] into a thrown Java exception and a negative
//! status (or `null` for reference results).
//!
//! [`OPTIONS_ENV`]: crate::config::OPTIONS_ENV

use crate::agent::CorrelationAgent;
use crate::channel::default_channel_path;
use crate::config::AgentConfig;
use crate::correlation::{self, Region};
use crate::error::{AgentError, Result, SUCCESS};
use crate::jni_wrapper::{JniEnv, LongArraySink};
use crate::jvmti_wrapper::Jvmti;
use crate::stack::{FrameEncoding, StackRequest};
use crate::sys::jni::{self, jboolean, jbyteArray, jclass, jint, jlong, jlongArray, jobject, jstring, jthread, JNIEnv, JavaVM};
use crate::sys::jvmti::jvmtiEnv;
use crate::vthread::Transition;
use log::{error, warn};
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

static AGENT: OnceLock<CorrelationAgent<Jvmti>> = OnceLock::new();

/// Address of the published process correlation region, null when none.
/// Exported so an out-of-process reader can locate it via the symbol table.
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static jvmti_correlation_process_storage: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());

/// Size of the region at [`jvmti_correlation_process_storage`].
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static jvmti_correlation_process_storage_size: AtomicUsize = AtomicUsize::new(0);

/// The process-wide agent, created from the environment if `Agent_OnLoad`
/// did not configure it.
pub fn agent() -> &'static CorrelationAgent<Jvmti> {
    AGENT.get_or_init(|| {
        let config = AgentConfig::from_env().unwrap_or_else(|e| {
            warn!("ignoring invalid options: {e}");
            AgentConfig::default()
        });
        CorrelationAgent::new(config)
    })
}

fn init_logging() {
    #[cfg(feature = "stderr-log")]
    {
        let _ = env_logger::try_init();
    }
}

fn publish_process_storage(agent: &CorrelationAgent<Jvmti>) {
    match agent.process_storage() {
        Some(region) => {
            jvmti_correlation_process_storage_size.store(region.len(), Ordering::Release);
            jvmti_correlation_process_storage.store(region.as_ptr(), Ordering::Release);
        }
        None => {
            jvmti_correlation_process_storage.store(ptr::null_mut(), Ordering::Release);
            jvmti_correlation_process_storage_size.store(0, Ordering::Release);
        }
    }
}

/// The calling thread's correlation region for in-process native readers.
/// Writes its size to `size_out` when non-null; returns null if unset.
#[no_mangle]
pub unsafe extern "C" fn jvmti_correlation_thread_storage(size_out: *mut usize) -> *mut u8 {
    let region = correlation::thread_storage();
    if !size_out.is_null() {
        *size_out = region.map_or(0, |r| r.len());
    }
    region.map_or(ptr::null_mut(), |r| r.as_ptr())
}

// =============================================================================
// Load hooks
// =============================================================================

#[no_mangle]
pub unsafe extern "system" fn Agent_OnLoad(_vm: *mut JavaVM, options: *mut c_char, _reserved: *mut c_void) -> jint {
    init_logging();
    let options = if options.is_null() {
        String::new()
    } else {
        CStr::from_ptr(options).to_string_lossy().into_owned()
    };
    let config = if options.is_empty() { AgentConfig::from_env() } else { AgentConfig::parse(&options) };
    match config {
        Ok(config) => {
            if AGENT.set(CorrelationAgent::new(config)).is_err() {
                warn!("agent already configured, ignoring options '{options}'");
            }
            jni::JNI_OK
        }
        Err(e) => {
            error!("invalid agent options: {e}");
            jni::JNI_ERR
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn JNI_OnLoad(vm: *mut JavaVM, _reserved: *mut c_void) -> jint {
    init_logging();
    let mut env_ptr: *mut c_void = ptr::null_mut();
    if ((**vm).GetEnv)(vm, &mut env_ptr, jni::JNI_VERSION_1_8) != jni::JNI_OK {
        return jni::JNI_ERR;
    }
    let env = JniEnv::from_raw(env_ptr as *mut JNIEnv);
    let bridge_class = &agent().config().bridge_class;
    if let Err(e) = register_natives(&env, bridge_class) {
        // The library stays loaded for the JVMTI side, but every bridge
        // native will fail with UnsatisfiedLinkError.
        error!("could not register the bridge natives: {e}");
    }
    jni::JNI_VERSION_1_8
}

macro_rules! native {
    ($name:literal, $sig:literal, $f:expr) => {
        jni::JNINativeMethod {
            name: concat!($name, "\0").as_ptr() as *const c_char,
            signature: concat!($sig, "\0").as_ptr() as *const c_char,
            fnPtr: $f as *mut c_void,
        }
    };
}

fn register_natives(env: &JniEnv, bridge_class: &str) -> Result<()> {
    let class = env.find_class(bridge_class).ok_or_else(|| {
        env.exception_clear();
        AgentError::ResolutionFailure(format!("bridge class {bridge_class}"))
    })?;
    let methods = [
        native!("initAgent", "()I", init_agent),
        native!("destroyAgent", "()I", destroy_agent),
        native!("captureStackTrace", "(Ljava/lang/Thread;IIZ[J)I", capture_stack_trace),
        native!("getDeclaringClass", "(J)Ljava/lang/Class;", get_declaring_class),
        native!("getMethodName", "(JZ)Ljava/lang/String;", get_method_name),
        native!("isAllocationSamplingSupported", "()Z", is_allocation_sampling_supported),
        native!("setAllocationSamplingEnabled", "(ZI)I", set_allocation_sampling_enabled),
        native!("setAllocationSamplingRate", "(I)I", set_allocation_sampling_rate),
        native!("setThreadCorrelationStorage", "(Ljava/nio/ByteBuffer;)I", set_thread_correlation_storage),
        native!("setProcessCorrelationStorage", "(Ljava/nio/ByteBuffer;)I", set_process_correlation_storage),
        native!("aliasThreadCorrelationStorage", "(J)Ljava/nio/ByteBuffer;", alias_thread_correlation_storage),
        native!("aliasProcessCorrelationStorage", "(J)Ljava/nio/ByteBuffer;", alias_process_correlation_storage),
        native!("openReturnChannel", "(Ljava/lang/String;)I", open_return_channel),
        native!("getReturnChannelPath", "()Ljava/lang/String;", get_return_channel_path),
        native!("closeReturnChannel", "()I", close_return_channel),
        native!("sendToReturnChannel", "([B)I", send_to_return_channel),
        native!("readReturnChannel", "(Ljava/nio/ByteBuffer;I)I", read_return_channel),
        native!("setVirtualThreadCallbacksEnabled", "(Z)I", set_virtual_thread_callbacks_enabled),
        native!("checkVirtualThreadMountSupport", "()Ljava/lang/String;", check_virtual_thread_mount_support),
    ];
    let result = env
        .register_natives(class, &methods)
        .map_err(|code| AgentError::ResolutionFailure(format!("natives on {bridge_class} (JNI error {code})")));
    env.delete_local_ref(class);
    result
}

// =============================================================================
// Error reporting
// =============================================================================

fn throw(env: &JniEnv, err: &AgentError) {
    if env.exception_check() {
        return;
    }
    if env.throw_new(err.exception_class(), &err.to_string()).is_err() {
        error!("could not throw {}: {err}", err.exception_class());
    }
}

fn status(env: &JniEnv, result: Result<()>) -> jint {
    match result {
        Ok(()) => SUCCESS,
        Err(e) => {
            throw(env, &e);
            e.return_code()
        }
    }
}

fn reference(env: &JniEnv, result: Result<Option<jobject>>) -> jobject {
    match result {
        Ok(obj) => obj.unwrap_or(ptr::null_mut()),
        Err(e) => {
            throw(env, &e);
            ptr::null_mut()
        }
    }
}

fn capacity(requested: jlong) -> Result<usize> {
    usize::try_from(requested)
        .map_err(|_| AgentError::InvalidArgument(format!("capacity must be >= 0, got {requested}")))
}

/// A direct buffer's memory as a region; `None` for a null buffer.
unsafe fn direct_region(env: &JniEnv, buffer: jobject) -> Result<Option<Region>> {
    if buffer.is_null() {
        return Ok(None);
    }
    let (address, len) = env
        .get_direct_buffer(buffer)
        .ok_or(AgentError::BufferAccess("a non-direct ByteBuffer"))?;
    Ok(Region::from_raw_parts(address, len))
}

// =============================================================================
// Native methods
// =============================================================================

unsafe extern "system" fn init_agent(env: *mut JNIEnv, _class: jclass) -> jint {
    let env = JniEnv::from_raw(env);
    status(&env, agent().init(&env))
}

unsafe extern "system" fn destroy_agent(env: *mut JNIEnv, _class: jclass) -> jint {
    let env = JniEnv::from_raw(env);
    let agent = agent();
    let result = agent.destroy(&env);
    publish_process_storage(agent);
    status(&env, result)
}

unsafe extern "system" fn capture_stack_trace(
    env: *mut JNIEnv,
    _class: jclass,
    thread: jthread,
    skip: jint,
    max_frames: jint,
    with_locations: jboolean,
    buffer: jlongArray,
) -> jint {
    let env = JniEnv::from_raw(env);
    let request = StackRequest {
        thread,
        skip,
        max_frames,
        encoding: FrameEncoding::from_flag(with_locations != 0),
    };
    let mut sink = LongArraySink::new(&env, buffer);
    match agent().capture_stack_trace(&request, &mut sink) {
        Ok(count) => count as jint,
        Err(e) => {
            throw(&env, &e);
            e.return_code()
        }
    }
}

unsafe extern "system" fn get_declaring_class(env: *mut JNIEnv, _class: jclass, method: jlong) -> jclass {
    let env = JniEnv::from_raw(env);
    let result = agent().declaring_class(method);
    reference(&env, result)
}

unsafe extern "system" fn get_method_name(
    env: *mut JNIEnv,
    _class: jclass,
    method: jlong,
    append_signature: jboolean,
) -> jstring {
    let env = JniEnv::from_raw(env);
    let result = agent()
        .with_method_name(method, append_signature != 0, |name| env.new_string_utf(name))
        .map(Option::flatten);
    reference(&env, result)
}

unsafe extern "system" fn is_allocation_sampling_supported(env: *mut JNIEnv, _class: jclass) -> jboolean {
    let env = JniEnv::from_raw(env);
    match agent().is_allocation_sampling_supported() {
        Ok(supported) => supported as jboolean,
        Err(e) => {
            throw(&env, &e);
            jni::JNI_FALSE
        }
    }
}

unsafe extern "system" fn set_allocation_sampling_enabled(
    env: *mut JNIEnv,
    _class: jclass,
    enable: jboolean,
    interval: jint,
) -> jint {
    let env = JniEnv::from_raw(env);
    status(&env, agent().set_allocation_sampling_enabled(enable != 0, interval))
}

unsafe extern "system" fn set_allocation_sampling_rate(env: *mut JNIEnv, _class: jclass, interval: jint) -> jint {
    let env = JniEnv::from_raw(env);
    status(&env, agent().set_allocation_sampling_rate(interval))
}

unsafe extern "system" fn set_thread_correlation_storage(env: *mut JNIEnv, _class: jclass, buffer: jobject) -> jint {
    let env = JniEnv::from_raw(env);
    let result = direct_region(&env, buffer).map(correlation::set_thread_storage);
    status(&env, result)
}

unsafe extern "system" fn set_process_correlation_storage(env: *mut JNIEnv, _class: jclass, buffer: jobject) -> jint {
    let env = JniEnv::from_raw(env);
    let agent = agent();
    let result = direct_region(&env, buffer).map(|region| agent.set_process_storage(region));
    publish_process_storage(agent);
    status(&env, result)
}

unsafe extern "system" fn alias_thread_correlation_storage(env: *mut JNIEnv, _class: jclass, requested: jlong) -> jobject {
    let env = JniEnv::from_raw(env);
    let result = capacity(requested).map(|capacity| {
        correlation::alias_thread_storage(capacity).and_then(|view| env.new_direct_byte_buffer(view.as_ptr(), view.len()))
    });
    reference(&env, result)
}

unsafe extern "system" fn alias_process_correlation_storage(env: *mut JNIEnv, _class: jclass, requested: jlong) -> jobject {
    let env = JniEnv::from_raw(env);
    let result = capacity(requested).map(|capacity| {
        agent()
            .alias_process_storage(capacity)
            .and_then(|view| env.new_direct_byte_buffer(view.as_ptr(), view.len()))
    });
    reference(&env, result)
}

unsafe extern "system" fn open_return_channel(env: *mut JNIEnv, _class: jclass, path: jstring) -> jint {
    let env = JniEnv::from_raw(env);
    let path = env.get_string_utf(path).map_or_else(default_channel_path, Into::into);
    status(&env, agent().open_return_channel(path))
}

unsafe extern "system" fn get_return_channel_path(env: *mut JNIEnv, _class: jclass) -> jstring {
    let env = JniEnv::from_raw(env);
    let path = agent()
        .return_channel_path()
        .and_then(|p| std::ffi::CString::new(p.to_string_lossy().into_owned()).ok());
    path.and_then(|p| env.new_string_utf(&p)).unwrap_or(ptr::null_mut())
}

unsafe extern "system" fn close_return_channel(env: *mut JNIEnv, _class: jclass) -> jint {
    let env = JniEnv::from_raw(env);
    status(&env, agent().close_return_channel())
}

unsafe extern "system" fn send_to_return_channel(env: *mut JNIEnv, _class: jclass, message: jbyteArray) -> jint {
    let env = JniEnv::from_raw(env);
    let result = if message.is_null() {
        Err(AgentError::InvalidArgument("message is null".to_string()))
    } else {
        agent().send_to_return_channel(&env.get_byte_array(message))
    };
    status(&env, result)
}

unsafe extern "system" fn read_return_channel(
    env: *mut JNIEnv,
    _class: jclass,
    buffer: jobject,
    bytes_per_message: jint,
) -> jint {
    let env = JniEnv::from_raw(env);
    let result = direct_region(&env, buffer).and_then(|region| {
        let region = region.ok_or_else(|| AgentError::InvalidArgument("buffer is null".to_string()))?;
        let bytes_per_message = usize::try_from(bytes_per_message)
            .map_err(|_| AgentError::InvalidArgument(format!("bytes per message {bytes_per_message}")))?;
        let dst = std::slice::from_raw_parts_mut(region.as_ptr(), region.len());
        agent().receive_from_return_channel(dst, bytes_per_message)
    });
    match result {
        Ok(count) => count as jint,
        Err(e) => {
            throw(&env, &e);
            e.return_code()
        }
    }
}

unsafe extern "system" fn set_virtual_thread_callbacks_enabled(env: *mut JNIEnv, _class: jclass, enable: jboolean) -> jint {
    let env = JniEnv::from_raw(env);
    status(&env, agent().set_virtual_thread_callbacks_enabled(enable != 0))
}

unsafe extern "system" fn check_virtual_thread_mount_support(env: *mut JNIEnv, _class: jclass) -> jstring {
    let env = JniEnv::from_raw(env);
    agent()
        .check_virtual_thread_mount_support()
        .and_then(|message| std::ffi::CString::new(message).ok())
        .and_then(|message| env.new_string_utf(&message))
        .unwrap_or(ptr::null_mut())
}

// =============================================================================
// JVMTI event handlers
// =============================================================================

unsafe fn forward_transition(jni_env: *mut JNIEnv, thread: jthread, transition: Transition) {
    if jni_env.is_null() {
        return;
    }
    let Some(agent) = AGENT.get() else {
        return;
    };
    let env = JniEnv::from_raw(jni_env);
    agent.with_transition_callback(transition, |callback| {
        env.call_static_void_method(callback.class, callback.method, &[jni::jvalue { l: thread }]);
        if env.exception_check() {
            env.exception_clear();
            warn!("virtual thread {} callback threw an exception", transition.name());
        }
    });
}

pub(crate) unsafe extern "system" fn on_virtual_thread_mount(_jvmti: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread) {
    forward_transition(jni_env, thread, Transition::Mount);
}

pub(crate) unsafe extern "system" fn on_virtual_thread_unmount(_jvmti: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread) {
    forward_transition(jni_env, thread, Transition::Unmount);
}

pub(crate) unsafe extern "system" fn on_sampled_object_alloc(
    _jvmti: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    _thread: jthread,
    object: jobject,
    _object_klass: jclass,
    size: jlong,
) {
    if jni_env.is_null() {
        return;
    }
    let Some(agent) = AGENT.get() else {
        return;
    };
    let env = JniEnv::from_raw(jni_env);
    agent.with_allocation_callback(|callback| {
        env.call_static_void_method(callback.class, callback.method, &[jni::jvalue { l: object }, jni::jvalue { j: size }]);
        if env.exception_check() {
            env.exception_clear();
            warn!("sampled allocation callback threw an exception");
        }
    });
}
