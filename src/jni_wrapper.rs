//! Safe wrapper around the JNI environment.
//!
//! Only the JNI calls the correlation agent makes are wrapped: class and
//! method lookup for callbacks, exceptions, references, strings, direct
//! buffers and pinned `long[]` access for frame capture.

use crate::config::CallbackTarget;
use crate::error::{AgentError, Result};
use crate::introspection::{CallbackRef, Runtime};
use crate::jvmti_wrapper::Jvmti;
use crate::stack::FrameSink;
use crate::sys::jni;
use std::ffi::{CStr, CString};
use std::ptr;

/// Safe wrapper around a JNI environment pointer.
///
/// # Thread Safety
///
/// A `JniEnv` is tied to a specific thread and cannot be sent across threads.
/// Each JVM thread has its own JNI environment.
pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// Creates a JniEnv wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is valid and comes from the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    /// Returns the raw JNI environment pointer.
    pub fn raw(&self) -> *mut jni::JNIEnv {
        self.env
    }

    // =========================================================================
    // Classes and methods
    // =========================================================================

    /// Finds a class by its internal name (`java/lang/String`).
    pub fn find_class(&self, name: &str) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).FindClass)(self.env, c_name.as_ptr());
            if cls.is_null() { None } else { Some(cls) }
        }
    }

    /// Gets a static method ID.
    pub fn get_static_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let id = ((*vtable).GetStaticMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if id.is_null() { None } else { Some(id) }
        }
    }

    /// Calls a static void method.
    pub fn call_static_void_method(&self, cls: jni::jclass, method_id: jni::jmethodID, args: &[jni::jvalue]) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallStaticVoidMethodA)(self.env, cls, method_id, args.as_ptr())
        }
    }

    /// Registers native method implementations on `cls`.
    pub fn register_natives(&self, cls: jni::jclass, methods: &[jni::JNINativeMethod]) -> std::result::Result<(), jni::jint> {
        unsafe {
            let vtable = *self.env;
            let res = ((*vtable).RegisterNatives)(self.env, cls, methods.as_ptr(), methods.len() as jni::jint);
            if res == jni::JNI_OK { Ok(()) } else { Err(res) }
        }
    }

    /// The `JavaVM` this environment belongs to.
    pub fn get_java_vm(&self) -> std::result::Result<*mut jni::JavaVM, jni::jint> {
        let mut vm: *mut jni::JavaVM = ptr::null_mut();
        unsafe {
            let vtable = *self.env;
            let res = ((*vtable).GetJavaVM)(self.env, &mut vm);
            if res == jni::JNI_OK { Ok(vm) } else { Err(res) }
        }
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Checks if an exception is pending.
    pub fn exception_check(&self) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionCheck)(self.env) != 0
        }
    }

    /// Clears any pending exception.
    pub fn exception_clear(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionClear)(self.env)
        }
    }

    /// Throws a new exception of class `class_name` with `msg`.
    pub fn throw_new(&self, class_name: &str, msg: &str) -> std::result::Result<(), jni::jint> {
        let cls = self.find_class(class_name).ok_or(jni::JNI_ERR)?;
        let cls = LocalRef::new(self, cls);
        let c_msg = CString::new(msg.replace('\0', " ")).map_err(|_| jni::JNI_ERR)?;
        unsafe {
            let vtable = *self.env;
            let res = ((*vtable).ThrowNew)(self.env, cls.get(), c_msg.as_ptr());
            if res == jni::JNI_OK { Ok(()) } else { Err(res) }
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Creates a global reference.
    pub fn new_global_ref(&self, obj: jni::jobject) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).NewGlobalRef)(self.env, obj)
        }
    }

    /// Deletes a global reference.
    pub fn delete_global_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteGlobalRef)(self.env, obj)
        }
    }

    /// Deletes a local reference.
    pub fn delete_local_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteLocalRef)(self.env, obj)
        }
    }

    // =========================================================================
    // Strings and arrays
    // =========================================================================

    /// Creates a Java string from modified UTF-8.
    pub fn new_string_utf(&self, s: &CStr) -> Option<jni::jstring> {
        unsafe {
            let vtable = *self.env;
            let jstr = ((*vtable).NewStringUTF)(self.env, s.as_ptr());
            if jstr.is_null() { None } else { Some(jstr) }
        }
    }

    /// Copies a Java string into a Rust string.
    pub fn get_string_utf(&self, s: jni::jstring) -> Option<String> {
        if s.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env;
            let chars = ((*vtable).GetStringUTFChars)(self.env, s, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let result = CStr::from_ptr(chars).to_string_lossy().into_owned();
            ((*vtable).ReleaseStringUTFChars)(self.env, s, chars);
            Some(result)
        }
    }

    /// Gets the length of an array.
    pub fn get_array_length(&self, array: jni::jarray) -> jni::jsize {
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetArrayLength)(self.env, array)
        }
    }

    /// Copies a whole `byte[]` out.
    pub fn get_byte_array(&self, array: jni::jbyteArray) -> Vec<u8> {
        let len = self.get_array_length(array).max(0);
        let mut buf = vec![0u8; len as usize];
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetByteArrayRegion)(self.env, array, 0, len, buf.as_mut_ptr() as *mut jni::jbyte);
        }
        buf
    }

    // =========================================================================
    // Direct buffers
    // =========================================================================

    /// Wraps native memory in a `java.nio.DirectByteBuffer`.
    pub fn new_direct_byte_buffer(&self, address: *mut u8, capacity: usize) -> Option<jni::jobject> {
        let capacity = jni::jlong::try_from(capacity).ok()?;
        unsafe {
            let vtable = *self.env;
            let buf = ((*vtable).NewDirectByteBuffer)(self.env, address.cast(), capacity);
            if buf.is_null() { None } else { Some(buf) }
        }
    }

    /// Address and capacity of a direct buffer; `None` for heap buffers.
    pub fn get_direct_buffer(&self, buf: jni::jobject) -> Option<(*mut u8, usize)> {
        unsafe {
            let vtable = *self.env;
            let address = ((*vtable).GetDirectBufferAddress)(self.env, buf);
            let capacity = ((*vtable).GetDirectBufferCapacity)(self.env, buf);
            if address.is_null() || capacity < 0 {
                return None;
            }
            Some((address.cast(), capacity as usize))
        }
    }
}

// =============================================================================
// RAII guards
// =============================================================================

/// A guard that automatically deletes a local reference when dropped.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    pub fn get(&self) -> jni::jobject {
        self.obj
    }
}

impl<'a> Drop for LocalRef<'a> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            self.env.delete_local_ref(self.obj);
        }
    }
}

/// A Java `long[]` used as a frame output buffer.
///
/// Writing pins the array with `GetPrimitiveArrayCritical` so the collector
/// cannot move it mid-copy; it is released (and copied back if the VM had to
/// copy) as soon as the write finishes.
pub struct LongArraySink<'a> {
    env: &'a JniEnv,
    array: jni::jlongArray,
    len: usize,
}

impl<'a> LongArraySink<'a> {
    pub fn new(env: &'a JniEnv, array: jni::jlongArray) -> Self {
        let len = if array.is_null() { 0 } else { env.get_array_length(array).max(0) as usize };
        LongArraySink { env, array, len }
    }
}

impl FrameSink for LongArraySink<'_> {
    fn capacity(&self) -> usize {
        self.len
    }

    fn pin<R>(&mut self, write: impl FnOnce(&mut [i64]) -> R) -> Option<R> {
        if self.array.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env.env;
            let elements = ((*vtable).GetPrimitiveArrayCritical)(self.env.env, self.array, ptr::null_mut());
            if elements.is_null() {
                return None;
            }
            let result = write(std::slice::from_raw_parts_mut(elements as *mut i64, self.len));
            ((*vtable).ReleasePrimitiveArrayCritical)(self.env.env, self.array, elements, 0);
            Some(result)
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

impl Runtime for JniEnv {
    type Introspection = Jvmti;

    fn acquire_introspection(&self, version: jni::jint) -> Result<Jvmti> {
        let vm = self
            .get_java_vm()
            .map_err(|code| AgentError::ResolutionFailure(format!("the JavaVM (JNI error {code})")))?;
        Jvmti::new(vm, version)
            .map_err(|code| AgentError::ResolutionFailure(format!("a JVMTI environment {version:#x} (JNI error {code})")))
    }

    fn resolve_callback(&self, target: &CallbackTarget) -> Option<CallbackRef> {
        let resolved = self.find_class(&target.class).and_then(|class| {
            let class = LocalRef::new(self, class);
            let method = self.get_static_method_id(class.get(), &target.method, &target.descriptor)?;
            let global = self.new_global_ref(class.get());
            (!global.is_null()).then_some(CallbackRef { class: global, method })
        });
        if resolved.is_none() && self.exception_check() {
            // NoClassDefFoundError / NoSuchMethodError
            self.exception_clear();
        }
        resolved
    }

    fn release_callback(&self, callback: CallbackRef) {
        self.delete_global_ref(callback.class);
    }
}
