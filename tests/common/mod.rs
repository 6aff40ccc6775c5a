//! Scriptable stand-ins for a live JVM.
//!
//! `FakeJvmti` answers the `Introspection` calls from a shared `FakeState`
//! that tests configure up front and inspect afterwards; `FakeRuntime` hands
//! out clones of it and resolves callbacks by method name.

#![allow(dead_code)]

use jvmti_correlation::config::CallbackTarget;
use jvmti_correlation::introspection::{CallbackRef, ExtensionEvent, ExtensionParam, Introspection, MethodName, Runtime};
use jvmti_correlation::sys::jni::{jclass, jint, jmethodID, jthread};
use jvmti_correlation::sys::jvmti::{
    jvmtiCapabilities, jvmtiError, jvmtiFrameInfo, JVMTI_KIND_IN, JVMTI_KIND_IN_PTR, JVMTI_TYPE_JNIENV,
    JVMTI_TYPE_JTHREAD,
};
use jvmti_correlation::vthread::Transition;
use jvmti_correlation::{AgentError, CorrelationAgent};
use jvmti_correlation::config::{AgentConfig, MOUNT_EVENT_ID, UNMOUNT_EVENT_ID};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard};

pub const MOUNT_INDEX: jint = 3;
pub const UNMOUNT_INDEX: jint = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddCapabilities(jvmtiCapabilities),
    RelinquishCapabilities(jvmtiCapabilities),
    EventNotification { enable: bool, event: u32 },
    HeapSamplingInterval(jint),
    AllocationHook,
    ExtensionEvents,
    TransitionHandler { index: jint, transition: Option<Transition> },
    Dispose,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub potential: jvmtiCapabilities,
    pub frames: Vec<jvmtiFrameInfo>,
    pub method_names: HashMap<usize, (String, String)>,
    pub declaring_classes: HashMap<usize, usize>,
    pub extension_events: Vec<ExtensionEvent>,
    /// Operation name -> error it fails with.
    pub failures: HashMap<&'static str, jvmtiError>,
    pub failing_installs: HashSet<jint>,
    pub failing_clears: HashSet<jint>,
    pub handlers: HashMap<jint, Transition>,
    pub calls: Vec<Call>,
    pub stack_trace_calls: usize,
    pub last_stack_request: Option<(jint, usize)>,
    pub disposed: bool,
}

// Method ids in `frames` are opaque integers here, never dereferenced.
unsafe impl Send for FakeState {}

#[derive(Debug, Clone, Default)]
pub struct FakeJvmti(pub Arc<Mutex<FakeState>>);

impl FakeJvmti {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn fail(&self, operation: &'static str, err: jvmtiError) {
        self.state().failures.insert(operation, err);
    }

    pub fn heal(&self, operation: &'static str) {
        self.state().failures.remove(operation);
    }

    fn check(state: &FakeState, operation: &'static str) -> Result<(), jvmtiError> {
        match state.failures.get(operation) {
            Some(err) => Err(*err),
            None => Ok(()),
        }
    }

    fn record(&self, operation: &'static str, call: Call) -> Result<(), jvmtiError> {
        let mut state = self.state();
        state.calls.push(call);
        Self::check(&state, operation)
    }
}

impl Introspection for FakeJvmti {
    type Text = CString;

    fn potential_capabilities(&self) -> Result<jvmtiCapabilities, jvmtiError> {
        let state = self.state();
        Self::check(&state, "GetPotentialCapabilities")?;
        Ok(state.potential)
    }

    fn add_capabilities(&self, caps: &jvmtiCapabilities) -> Result<(), jvmtiError> {
        self.record("AddCapabilities", Call::AddCapabilities(*caps))
    }

    fn relinquish_capabilities(&self, caps: &jvmtiCapabilities) -> Result<(), jvmtiError> {
        self.record("RelinquishCapabilities", Call::RelinquishCapabilities(*caps))
    }

    fn set_event_notification(&self, enable: bool, event: u32) -> Result<(), jvmtiError> {
        let operation = if enable { "EnableEvent" } else { "DisableEvent" };
        self.record(operation, Call::EventNotification { enable, event })
    }

    fn set_heap_sampling_interval(&self, bytes: jint) -> Result<(), jvmtiError> {
        self.record("SetHeapSamplingInterval", Call::HeapSamplingInterval(bytes))
    }

    fn install_allocation_hook(&self) -> Result<(), jvmtiError> {
        self.record("SetEventCallbacks", Call::AllocationHook)
    }

    // No heap traffic here: the allocation-free capture test counts on it.
    fn stack_trace(&self, _thread: jthread, start_depth: jint, frames: &mut [jvmtiFrameInfo]) -> Result<usize, jvmtiError> {
        let mut state = self.state();
        state.stack_trace_calls += 1;
        state.last_stack_request = Some((start_depth, frames.len()));
        Self::check(&state, "GetStackTrace")?;
        let available = state.frames.get(start_depth as usize..).unwrap_or(&[]);
        let count = available.len().min(frames.len());
        frames[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }

    fn method_declaring_class(&self, method: jmethodID) -> Result<jclass, jvmtiError> {
        let state = self.state();
        Self::check(&state, "GetMethodDeclaringClass")?;
        state
            .declaring_classes
            .get(&(method as usize))
            .map(|class| *class as jclass)
            .ok_or(jvmtiError::INVALID_METHODID)
    }

    fn method_name(&self, method: jmethodID, with_signature: bool) -> Result<MethodName<CString>, jvmtiError> {
        let state = self.state();
        Self::check(&state, "GetMethodName")?;
        let (name, signature) = state.method_names.get(&(method as usize)).ok_or(jvmtiError::INVALID_METHODID)?;
        Ok(MethodName {
            name: CString::new(name.as_str()).unwrap(),
            signature: with_signature.then(|| CString::new(signature.as_str()).unwrap()),
        })
    }

    fn extension_events(&self) -> Result<Vec<ExtensionEvent>, jvmtiError> {
        self.record("GetExtensionEvents", Call::ExtensionEvents)?;
        Ok(self.state().extension_events.clone())
    }

    fn set_transition_handler(&self, index: jint, transition: Option<Transition>) -> Result<(), jvmtiError> {
        let mut state = self.state();
        state.calls.push(Call::TransitionHandler { index, transition });
        let failing = match transition {
            Some(_) => state.failing_installs.contains(&index),
            None => state.failing_clears.contains(&index),
        };
        if failing {
            return Err(jvmtiError::ILLEGAL_ARGUMENT);
        }
        match transition {
            Some(t) => state.handlers.insert(index, t),
            None => state.handlers.remove(&index),
        };
        Ok(())
    }

    fn dispose(&self) -> Result<(), jvmtiError> {
        let mut state = self.state();
        state.calls.push(Call::Dispose);
        Self::check(&state, "DisposeEnvironment")?;
        state.disposed = true;
        Ok(())
    }
}

pub struct FakeRuntime {
    pub jvmti: FakeJvmti,
    pub resolvable: Mutex<HashSet<String>>,
    pub resolved: Mutex<Vec<(String, CallbackRef)>>,
    pub released: Mutex<Vec<CallbackRef>>,
    pub versions: Mutex<Vec<jint>>,
    pub acquire_error: Mutex<Option<AgentError>>,
}

impl FakeRuntime {
    /// A JVM that supports everything the agent asks for.
    pub fn new() -> Self {
        let jvmti = FakeJvmti::default();
        {
            let mut state = jvmti.state();
            state.potential.set_can_generate_sampled_object_alloc_events(true);
            state.potential.set_can_support_virtual_threads(true);
            state.extension_events = hotspot_events();
        }
        FakeRuntime {
            jvmti,
            resolvable: Mutex::new(
                ["onVirtualThreadMount", "onVirtualThreadUnmount", "onSampledAllocation"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            resolved: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            versions: Mutex::new(Vec::new()),
            acquire_error: Mutex::new(None),
        }
    }

    pub fn without_callback(self, method: &str) -> Self {
        self.resolvable.lock().unwrap().remove(method);
        self
    }

    pub fn resolved_refs(&self) -> Vec<CallbackRef> {
        self.resolved.lock().unwrap().iter().map(|(_, r)| *r).collect()
    }

    pub fn released_refs(&self) -> Vec<CallbackRef> {
        self.released.lock().unwrap().clone()
    }

    pub fn callback(&self, method: &str) -> Option<CallbackRef> {
        self.resolved.lock().unwrap().iter().find(|(m, _)| m == method).map(|(_, r)| *r)
    }
}

impl Runtime for FakeRuntime {
    type Introspection = FakeJvmti;

    fn acquire_introspection(&self, version: jint) -> jvmti_correlation::Result<FakeJvmti> {
        self.versions.lock().unwrap().push(version);
        match self.acquire_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(self.jvmti.clone()),
        }
    }

    fn resolve_callback(&self, target: &CallbackTarget) -> Option<CallbackRef> {
        if !self.resolvable.lock().unwrap().contains(&target.method) {
            return None;
        }
        let mut resolved = self.resolved.lock().unwrap();
        let n = resolved.len() + 1;
        let callback = CallbackRef { class: (0x1000 * n) as jclass, method: (0x1000 * n + 8) as jmethodID };
        resolved.push((target.method.clone(), callback));
        Some(callback)
    }

    fn release_callback(&self, callback: CallbackRef) {
        self.released.lock().unwrap().push(callback);
    }
}

pub fn transition_params() -> Vec<ExtensionParam> {
    vec![
        ExtensionParam { kind: JVMTI_KIND_IN_PTR, base_type: JVMTI_TYPE_JNIENV, null_ok: false },
        ExtensionParam { kind: JVMTI_KIND_IN, base_type: JVMTI_TYPE_JTHREAD, null_ok: false },
    ]
}

pub fn event(index: jint, id: &str, params: Vec<ExtensionParam>) -> ExtensionEvent {
    ExtensionEvent { index, id: id.to_string(), params }
}

/// What HotSpot advertises: an unrelated event plus the two transitions.
pub fn hotspot_events() -> Vec<ExtensionEvent> {
    vec![
        event(1, "com.sun.hotspot.events.ClassUnload", vec![]),
        event(MOUNT_INDEX, MOUNT_EVENT_ID, transition_params()),
        event(UNMOUNT_INDEX, UNMOUNT_EVENT_ID, transition_params()),
    ]
}

pub fn method_id(n: usize) -> jmethodID {
    (0x7f00_0000 + n * 16) as jmethodID
}

/// `n` frames with distinct methods and locations `10 * i`.
pub fn frames(n: usize) -> Vec<jvmtiFrameInfo> {
    (0..n)
        .map(|i| jvmtiFrameInfo { method: method_id(i), location: (10 * i) as i64 })
        .collect()
}

pub fn agent(config: AgentConfig) -> CorrelationAgent<FakeJvmti> {
    CorrelationAgent::new(config)
}

pub fn initialized() -> (CorrelationAgent<FakeJvmti>, FakeRuntime) {
    let runtime = FakeRuntime::new();
    let agent = agent(AgentConfig::default());
    agent.init(&runtime).unwrap();
    (agent, runtime)
}
