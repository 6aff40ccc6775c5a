//! The agent context.
//!
//! [`CorrelationAgent`] owns everything the components share: the JVMTI
//! environment, the sampling and bridge flags, cached extension event
//! indices, the return channel and the resolved callbacks. Lifecycle changes
//! take the state lock for writing; capture, resolution and transport only
//! read it, so samplers on different threads never wait on each other.
//!
//! Callbacks sit behind their own lock because event handlers read them on
//! hot paths (every virtual thread mount) and must not queue behind an
//! enable/disable in progress. A handler holds that lock for the whole
//! upcall, so teardown cannot release a reference that is still in use.
//! Lifecycle changes take the callbacks lock before the state lock; an
//! upcall may therefore call back into the agent, except to init or destroy.

use crate::channel::ReturnChannel;
use crate::config::{AgentConfig, CallbackTarget};
use crate::correlation::{BufferView, ProcessStorage, Region};
use crate::error::{AgentError, Result};
use crate::guard::Rollback;
use crate::introspection::{CallbackRef, Introspection, Runtime};
use crate::sampling;
use crate::stack::{self, FrameSink, MethodHandle, StackRequest};
use crate::sys::jni::{jclass, jint};
use crate::sys::jvmti::{jvmtiCapabilities, JVMTI_VERSION_1_2, JVMTI_VERSION_21};
use crate::vthread::{self, Transition, TransitionEvents};
use log::{debug, info, warn};
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct AgentState<I> {
    jvmti: Option<I>,
    allocation_sampling: bool,
    sampling_interval: jint,
    transition_handlers: bool,
    /// Filled on first discovery, dropped at teardown.
    transition_events: Option<TransitionEvents>,
    return_channel: Option<ReturnChannel>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Callbacks {
    mount: Option<CallbackRef>,
    unmount: Option<CallbackRef>,
    allocation: Option<CallbackRef>,
}

impl Callbacks {
    fn iter(self) -> impl Iterator<Item = CallbackRef> {
        [self.mount, self.unmount, self.allocation].into_iter().flatten()
    }
}

pub struct CorrelationAgent<I: Introspection> {
    config: AgentConfig,
    state: RwLock<AgentState<I>>,
    callbacks: RwLock<Callbacks>,
    process_storage: ProcessStorage,
}

impl<I: Introspection> CorrelationAgent<I> {
    pub fn new(config: AgentConfig) -> Self {
        let sampling_interval = config.sampling_interval;
        CorrelationAgent {
            config,
            state: RwLock::new(AgentState {
                jvmti: None,
                allocation_sampling: false,
                sampling_interval,
                transition_handlers: false,
                transition_events: None,
                return_channel: None,
            }),
            callbacks: RwLock::new(Callbacks::default()),
            process_storage: ProcessStorage::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, AgentState<I>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, AgentState<I>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_callbacks(&self) -> RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_callbacks(&self) -> RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_jvmti<T>(&self, f: impl FnOnce(&I) -> Result<T>) -> Result<T> {
        let state = self.read_state();
        let jvmti = state.jvmti.as_ref().ok_or(AgentError::NotInitialized)?;
        f(jvmti)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_initialized(&self) -> bool {
        self.read_state().jvmti.is_some()
    }

    /// Resolves the callbacks, acquires JVMTI and negotiates capabilities.
    /// Nothing acquired survives a failure.
    pub fn init<R>(&self, runtime: &R) -> Result<()>
    where
        R: Runtime<Introspection = I>,
    {
        let mut callbacks = self.write_callbacks();
        let mut state = self.write_state();
        if state.jvmti.is_some() {
            return Err(AgentError::AlreadyInitialized);
        }

        let mount = resolve(runtime, &self.config.mount_callback())?;
        let mount_ref = Rollback::new(|| runtime.release_callback(mount));
        let unmount = resolve(runtime, &self.config.unmount_callback())?;
        let unmount_ref = Rollback::new(|| runtime.release_callback(unmount));
        let allocation = runtime.resolve_callback(&self.config.allocation_callback());
        if allocation.is_none() {
            debug!("{} not found, sampled allocations will not be forwarded", self.config.allocation_callback());
        }
        let allocation_ref = Rollback::new(|| {
            if let Some(callback) = allocation {
                runtime.release_callback(callback);
            }
        });

        let version = if self.config.virtual_threads { JVMTI_VERSION_21 } else { JVMTI_VERSION_1_2 };
        let jvmti = runtime.acquire_introspection(version)?;
        let environment = Rollback::new(|| {
            if let Err(e) = jvmti.dispose() {
                warn!("could not dispose the JVMTI environment: {}", e.0);
            }
        });
        if self.config.virtual_threads {
            negotiate_virtual_threads(&jvmti)?;
        }
        jvmti
            .install_allocation_hook()
            .map_err(|e| AgentError::jvmti("SetEventCallbacks", e))?;

        environment.commit();
        allocation_ref.commit();
        unmount_ref.commit();
        mount_ref.commit();

        *callbacks = Callbacks {
            mount: Some(mount),
            unmount: Some(unmount),
            allocation,
        };
        state.jvmti = Some(jvmti);
        state.allocation_sampling = false;
        state.sampling_interval = self.config.sampling_interval;
        state.transition_handlers = false;
        state.transition_events = None;
        info!("correlation agent initialized");
        Ok(())
    }

    /// Tears everything down in reverse order. The agent is uninitialized
    /// afterwards even if a step failed; the first failure is returned.
    pub fn destroy<R>(&self, runtime: &R) -> Result<()>
    where
        R: Runtime<Introspection = I>,
    {
        // Waits for handlers still running a forwarded upcall.
        let mut callbacks_guard = self.write_callbacks();
        let mut guard = self.write_state();
        let state = &mut *guard;
        let jvmti = state.jvmti.take().ok_or(AgentError::NotInitialized)?;
        let callbacks = std::mem::take(&mut *callbacks_guard);
        drop(callbacks_guard);
        let mut first_error: Option<AgentError> = None;
        let mut record = |result: Result<()>, what: &str| {
            if let Err(e) = result {
                warn!("{what} failed during teardown: {e}");
                first_error.get_or_insert(e);
            }
        };

        if state.transition_handlers {
            if let Some(events) = state.transition_events {
                record(vthread::uninstall(&jvmti, events), "removing virtual thread handlers");
            }
            state.transition_handlers = false;
        }
        state.transition_events = None;
        if state.allocation_sampling {
            record(sampling::disable(&jvmti), "disabling allocation sampling");
            state.allocation_sampling = false;
        }

        record(
            jvmti.dispose().map_err(|e| AgentError::jvmti("DisposeEnvironment", e)),
            "disposing the JVMTI environment",
        );
        self.process_storage.set(None);
        if let Some(channel) = state.return_channel.take() {
            record(channel.close(), "closing the return channel");
        }
        for callback in callbacks.iter() {
            runtime.release_callback(callback);
        }

        info!("correlation agent destroyed");
        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Stack traces and method metadata
    // =========================================================================

    pub fn capture_stack_trace<S>(&self, request: &StackRequest, out: &mut S) -> Result<usize>
    where
        S: FrameSink + ?Sized,
    {
        self.with_jvmti(|jvmti| stack::capture_stack_trace(jvmti, request, out))
    }

    /// `method` is a word read back from a frame buffer. `Ok(None)` when it
    /// does not name a method or the method cannot be resolved.
    pub fn declaring_class(&self, method: i64) -> Result<Option<jclass>> {
        self.with_jvmti(|jvmti| Ok(MethodHandle::from_raw(method).and_then(|m| stack::declaring_class(jvmti, m))))
    }

    /// See [`stack::with_method_name`]. `Ok(None)` when `method` does not
    /// name a method or the method cannot be resolved.
    pub fn with_method_name<R>(
        &self,
        method: i64,
        append_signature: bool,
        f: impl FnOnce(&CStr) -> R,
    ) -> Result<Option<R>> {
        self.with_jvmti(|jvmti| {
            Ok(MethodHandle::from_raw(method).and_then(|m| stack::with_method_name(jvmti, m, append_signature, f)))
        })
    }

    // =========================================================================
    // Allocation sampling
    // =========================================================================

    pub fn is_allocation_sampling_supported(&self) -> Result<bool> {
        self.with_jvmti(|jvmti| sampling::is_supported(jvmti))
    }

    pub fn allocation_sampling_enabled(&self) -> bool {
        self.read_state().allocation_sampling
    }

    /// Current mean sampling interval in bytes.
    pub fn sampling_interval(&self) -> jint {
        self.read_state().sampling_interval
    }

    /// Switches sampling on (at `interval` bytes) or off. Asking for the
    /// current state succeeds without touching JVMTI.
    pub fn set_allocation_sampling_enabled(&self, enable: bool, interval: jint) -> Result<()> {
        let mut guard = self.write_state();
        let state = &mut *guard;
        let jvmti = state.jvmti.as_ref().ok_or(AgentError::NotInitialized)?;
        if state.allocation_sampling == enable {
            return Ok(());
        }
        if enable {
            sampling::enable(jvmti, interval)?;
            state.sampling_interval = interval;
        } else {
            sampling::disable(jvmti)?;
        }
        state.allocation_sampling = enable;
        Ok(())
    }

    pub fn set_allocation_sampling_rate(&self, interval: jint) -> Result<()> {
        let mut guard = self.write_state();
        let state = &mut *guard;
        let jvmti = state.jvmti.as_ref().ok_or(AgentError::NotInitialized)?;
        if !state.allocation_sampling {
            return Err(AgentError::InvalidState("allocation sampling is not enabled"));
        }
        sampling::set_interval(jvmti, interval)?;
        state.sampling_interval = interval;
        Ok(())
    }

    // =========================================================================
    // Process correlation storage
    // =========================================================================

    pub fn set_process_storage(&self, region: Option<Region>) {
        self.process_storage.set(region);
    }

    pub fn process_storage(&self) -> Option<Region> {
        self.process_storage.get()
    }

    pub fn alias_process_storage(&self, capacity: usize) -> Option<BufferView> {
        self.process_storage.alias(capacity)
    }

    // =========================================================================
    // Return channel
    // =========================================================================

    pub fn open_return_channel(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.write_state();
        if state.return_channel.is_some() {
            return Err(AgentError::InvalidState("the return channel is already open"));
        }
        state.return_channel = Some(ReturnChannel::open(path)?);
        Ok(())
    }

    pub fn close_return_channel(&self) -> Result<()> {
        let channel = self
            .write_state()
            .return_channel
            .take()
            .ok_or(AgentError::InvalidState("the return channel is not open"))?;
        channel.close()
    }

    pub fn return_channel_path(&self) -> Option<PathBuf> {
        self.read_state().return_channel.as_ref().map(|c| c.path().to_path_buf())
    }

    pub fn send_to_return_channel(&self, message: &[u8]) -> Result<()> {
        self.with_channel(|channel| channel.send(message))
    }

    pub fn receive_from_return_channel(&self, dst: &mut [u8], bytes_per_message: usize) -> Result<usize> {
        self.with_channel(|channel| channel.receive(dst, bytes_per_message))
    }

    fn with_channel<T>(&self, f: impl FnOnce(&ReturnChannel) -> Result<T>) -> Result<T> {
        let state = self.read_state();
        let channel = state
            .return_channel
            .as_ref()
            .ok_or(AgentError::InvalidState("the return channel is not open"))?;
        f(channel)
    }

    // =========================================================================
    // Virtual thread bridge
    // =========================================================================

    pub fn virtual_thread_callbacks_enabled(&self) -> bool {
        self.read_state().transition_handlers
    }

    pub fn set_virtual_thread_callbacks_enabled(&self, enable: bool) -> Result<()> {
        let mut guard = self.write_state();
        let state = &mut *guard;
        let jvmti = state.jvmti.as_ref().ok_or(AgentError::NotInitialized)?;
        if state.transition_handlers == enable {
            return Ok(());
        }
        let events = self.transition_events(jvmti, &mut state.transition_events)?;
        if enable {
            vthread::install(jvmti, events)?;
        } else {
            vthread::uninstall(jvmti, events)?;
        }
        state.transition_handlers = enable;
        debug!("virtual thread callbacks {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// `None` if the bridge can be enabled, otherwise why not.
    pub fn check_virtual_thread_mount_support(&self) -> Option<String> {
        let mut guard = self.write_state();
        let state = &mut *guard;
        let Some(jvmti) = state.jvmti.as_ref() else {
            return Some(AgentError::NotInitialized.to_string());
        };
        self.transition_events(jvmti, &mut state.transition_events)
            .err()
            .map(|e| e.to_string())
    }

    fn transition_events(&self, jvmti: &I, cache: &mut Option<TransitionEvents>) -> Result<TransitionEvents> {
        if let Some(events) = *cache {
            return Ok(events);
        }
        let events = vthread::discover(jvmti, &self.config.mount_event, &self.config.unmount_event)?;
        *cache = Some(events);
        Ok(events)
    }

    // =========================================================================
    // Callback lookup for event handlers
    // =========================================================================

    /// Runs `f` with the callback forwarding `transition`, `None` when there
    /// is none. The reference stays valid until `f` returns.
    pub fn with_transition_callback<R>(&self, transition: Transition, f: impl FnOnce(CallbackRef) -> R) -> Option<R> {
        let callbacks = self.read_callbacks();
        let callback = match transition {
            Transition::Mount => callbacks.mount,
            Transition::Unmount => callbacks.unmount,
        };
        callback.map(f)
    }

    pub fn with_allocation_callback<R>(&self, f: impl FnOnce(CallbackRef) -> R) -> Option<R> {
        self.read_callbacks().allocation.map(f)
    }
}

fn resolve<R: Runtime>(runtime: &R, target: &CallbackTarget) -> Result<CallbackRef> {
    runtime
        .resolve_callback(target)
        .ok_or_else(|| AgentError::ResolutionFailure(format!("callback {target}")))
}

fn negotiate_virtual_threads<I: Introspection>(jvmti: &I) -> Result<()> {
    let potential = jvmti
        .potential_capabilities()
        .map_err(|e| AgentError::jvmti("GetPotentialCapabilities", e))?;
    if !potential.can_support_virtual_threads() {
        return Err(AgentError::Unsupported("virtual thread support"));
    }
    let mut caps = jvmtiCapabilities::default();
    caps.set_can_support_virtual_threads(true);
    jvmti
        .add_capabilities(&caps)
        .map_err(|e| AgentError::jvmti("AddCapabilities", e))
}
