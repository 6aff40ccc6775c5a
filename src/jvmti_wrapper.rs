// jvmti-correlation/src/jvmti_wrapper.rs
use crate::introspection::{ExtensionEvent, ExtensionParam, Introspection, MethodName};
use crate::sys::jni;
use crate::sys::jvmti;
use crate::vthread::Transition;
use std::ffi::CStr;
use std::ops::Deref;
use std::os::raw::c_char;
use std::ptr;

/// A safe wrapper around the raw JVMTI Environment pointer.
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

// JVMTI functions may be called from any thread attached to the VM.
unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

fn check(err: jvmti::jvmtiError) -> Result<(), jvmti::jvmtiError> {
    if err.is_ok() { Ok(()) } else { Err(err) }
}

impl Jvmti {
    /// Connects to the JVM and retrieves a JVMTI environment of `version`.
    pub fn new(vm: *mut jni::JavaVM, version: jni::jint) -> Result<Self, jni::jint> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();

        unsafe {
            // vm: *mut JavaVM = *mut *const JNIInvokeInterface_
            let get_env_fn = (**vm).GetEnv;
            let res = get_env_fn(vm, &mut env_ptr, version);
            if res != jni::JNI_OK {
                return Err(res);
            }
        }

        Ok(Jvmti { env: env_ptr as *mut jvmti::jvmtiEnv })
    }

    /// Create a Jvmti wrapper from a raw jvmtiEnv pointer
    ///
    /// # Safety
    /// The caller must ensure the pointer is valid for the duration of use.
    pub unsafe fn from_raw(env: *mut jvmti::jvmtiEnv) -> Self {
        Jvmti { env }
    }

    /// Get the raw jvmtiEnv pointer
    pub fn raw(&self) -> *mut jvmti::jvmtiEnv {
        self.env
    }

    fn functions(&self) -> &jvmti::jvmtiInterface_1_ {
        unsafe { &*(*self.env).functions }
    }

    pub fn get_potential_capabilities(&self) -> Result<jvmti::jvmtiCapabilities, jvmti::jvmtiError> {
        let mut caps = jvmti::jvmtiCapabilities::default();
        let f = self.functions().GetPotentialCapabilities.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, &mut caps) })?;
        Ok(caps)
    }

    pub fn add_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        let f = self.functions().AddCapabilities.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, caps) })
    }

    pub fn relinquish_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        let f = self.functions().RelinquishCapabilities.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, caps) })
    }

    /// Enables or disables `event` for all threads (`thread` null) or one.
    pub fn set_event_notification_mode(&self, enable: bool, event: u32, thread: jni::jthread) -> Result<(), jvmti::jvmtiError> {
        let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };
        let f = self.functions().SetEventNotificationMode.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, mode, event, thread) })
    }

    pub fn set_event_callbacks(&self, callbacks: &jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;
        let f = self.functions().SetEventCallbacks.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, callbacks, size) })
    }

    pub fn set_heap_sampling_interval(&self, interval: jni::jint) -> Result<(), jvmti::jvmtiError> {
        let f = self.functions().SetHeapSamplingInterval.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, interval) })
    }

    /// Writes up to `frames.len()` frames into `frames`; returns the count.
    pub fn get_stack_trace(
        &self,
        thread: jni::jthread,
        start_depth: jni::jint,
        frames: &mut [jvmti::jvmtiFrameInfo],
    ) -> Result<usize, jvmti::jvmtiError> {
        let max = jni::jint::try_from(frames.len()).map_err(|_| jvmti::jvmtiError::ILLEGAL_ARGUMENT)?;
        let mut count: jni::jint = 0;
        let f = self.functions().GetStackTrace.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, thread, start_depth, max, frames.as_mut_ptr(), &mut count) })?;
        Ok(count.max(0) as usize)
    }

    pub fn get_method_declaring_class(&self, method: jni::jmethodID) -> Result<jni::jclass, jvmti::jvmtiError> {
        let mut class: jni::jclass = ptr::null_mut();
        let f = self.functions().GetMethodDeclaringClass.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, method, &mut class) })?;
        Ok(class)
    }

    /// Method name and, if requested, its signature. Both strings are freed
    /// when dropped.
    pub fn get_method_name(
        &self,
        method: jni::jmethodID,
        with_signature: bool,
    ) -> Result<(JvmtiString, Option<JvmtiString>), jvmti::jvmtiError> {
        let mut name_ptr: *mut c_char = ptr::null_mut();
        let mut sig_ptr: *mut c_char = ptr::null_mut();
        let sig_out: *mut *mut c_char = if with_signature { &mut sig_ptr } else { ptr::null_mut() };
        let f = self.functions().GetMethodName.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, method, &mut name_ptr, sig_out, ptr::null_mut()) })?;

        let signature = unsafe { JvmtiString::from_raw(self.env, sig_ptr) };
        let name = unsafe { JvmtiString::from_raw(self.env, name_ptr) }.ok_or(jvmti::jvmtiError::NULL_POINTER)?;
        Ok((name, signature))
    }

    /// Copies the advertised extension events out and frees the JVMTI
    /// allocations behind them.
    pub fn get_extension_events(&self) -> Result<Vec<ExtensionEvent>, jvmti::jvmtiError> {
        let mut count: jni::jint = 0;
        let mut infos: *mut jvmti::jvmtiExtensionEventInfo = ptr::null_mut();
        let f = self.functions().GetExtensionEvents.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, &mut count, &mut infos) })?;
        if infos.is_null() {
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(count.max(0) as usize);
        unsafe {
            for info in std::slice::from_raw_parts(infos, count.max(0) as usize) {
                let params = if info.params.is_null() {
                    &[][..]
                } else {
                    std::slice::from_raw_parts(info.params, info.param_count.max(0) as usize)
                };
                events.push(ExtensionEvent {
                    index: info.extension_event_index,
                    id: if info.id.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(info.id).to_string_lossy().into_owned()
                    },
                    params: params
                        .iter()
                        .map(|p| ExtensionParam { kind: p.kind, base_type: p.base_type, null_ok: p.null_ok != 0 })
                        .collect(),
                });

                for param in params {
                    self.deallocate(param.name as *mut u8);
                }
                self.deallocate(info.params as *mut u8);
                self.deallocate(info.id as *mut u8);
                self.deallocate(info.short_description as *mut u8);
            }
            self.deallocate(infos as *mut u8);
        }
        Ok(events)
    }

    pub fn set_extension_event_callback(
        &self,
        index: jni::jint,
        callback: jvmti::jvmtiExtensionEvent,
    ) -> Result<(), jvmti::jvmtiError> {
        let f = self.functions().SetExtensionEventCallback.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env, index, callback) })
    }

    pub fn dispose_environment(&self) -> Result<(), jvmti::jvmtiError> {
        let f = self.functions().DisposeEnvironment.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?;
        check(unsafe { f(self.env) })
    }

    /// Frees JVMTI-allocated memory. Null is ignored.
    pub fn deallocate(&self, mem: *mut u8) {
        unsafe { deallocate(self.env, mem) }
    }
}

unsafe fn deallocate(env: *mut jvmti::jvmtiEnv, mem: *mut u8) {
    if mem.is_null() {
        return;
    }
    if let Some(f) = (*(*env).functions).Deallocate {
        f(env, mem);
    }
}

/// A NUL-terminated string allocated by JVMTI, deallocated on drop.
pub struct JvmtiString {
    env: *mut jvmti::jvmtiEnv,
    ptr: *mut c_char,
}

impl JvmtiString {
    /// # Safety
    /// `ptr` must be null or a string JVMTI allocated in `env`.
    unsafe fn from_raw(env: *mut jvmti::jvmtiEnv, ptr: *mut c_char) -> Option<Self> {
        (!ptr.is_null()).then_some(JvmtiString { env, ptr })
    }
}

impl Deref for JvmtiString {
    type Target = CStr;

    fn deref(&self) -> &CStr {
        unsafe { CStr::from_ptr(self.ptr) }
    }
}

impl Drop for JvmtiString {
    fn drop(&mut self) {
        unsafe { deallocate(self.env, self.ptr as *mut u8) }
    }
}

impl Introspection for Jvmti {
    type Text = JvmtiString;

    fn potential_capabilities(&self) -> Result<jvmti::jvmtiCapabilities, jvmti::jvmtiError> {
        self.get_potential_capabilities()
    }

    fn add_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        Jvmti::add_capabilities(self, caps)
    }

    fn relinquish_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        Jvmti::relinquish_capabilities(self, caps)
    }

    fn set_event_notification(&self, enable: bool, event: u32) -> Result<(), jvmti::jvmtiError> {
        self.set_event_notification_mode(enable, event, ptr::null_mut())
    }

    fn set_heap_sampling_interval(&self, bytes: jni::jint) -> Result<(), jvmti::jvmtiError> {
        Jvmti::set_heap_sampling_interval(self, bytes)
    }

    fn install_allocation_hook(&self) -> Result<(), jvmti::jvmtiError> {
        let mut callbacks = jvmti::jvmtiEventCallbacks::default();
        callbacks.SampledObjectAlloc = Some(crate::ffi::on_sampled_object_alloc);
        self.set_event_callbacks(&callbacks)
    }

    fn stack_trace(
        &self,
        thread: jni::jthread,
        start_depth: jni::jint,
        frames: &mut [jvmti::jvmtiFrameInfo],
    ) -> Result<usize, jvmti::jvmtiError> {
        self.get_stack_trace(thread, start_depth, frames)
    }

    fn method_declaring_class(&self, method: jni::jmethodID) -> Result<jni::jclass, jvmti::jvmtiError> {
        self.get_method_declaring_class(method)
    }

    fn method_name(&self, method: jni::jmethodID, with_signature: bool) -> Result<MethodName<JvmtiString>, jvmti::jvmtiError> {
        let (name, signature) = self.get_method_name(method, with_signature)?;
        Ok(MethodName { name, signature })
    }

    fn extension_events(&self) -> Result<Vec<ExtensionEvent>, jvmti::jvmtiError> {
        self.get_extension_events()
    }

    fn set_transition_handler(&self, index: jni::jint, transition: Option<Transition>) -> Result<(), jvmti::jvmtiError> {
        let handler: Option<jvmti::JvmtiVirtualThreadTransitionFn> = match transition {
            Some(Transition::Mount) => Some(crate::ffi::on_virtual_thread_mount),
            Some(Transition::Unmount) => Some(crate::ffi::on_virtual_thread_unmount),
            None => None,
        };
        // The JVM calls extension handlers with the event's own parameter list.
        let erased = handler.map(|f| unsafe {
            std::mem::transmute::<jvmti::JvmtiVirtualThreadTransitionFn, unsafe extern "system" fn()>(f)
        });
        self.set_extension_event_callback(index, erased)
    }

    fn dispose(&self) -> Result<(), jvmti::jvmtiError> {
        self.dispose_environment()
    }
}
