//! # jvmti-correlation
//!
//! A native JVMTI agent that lets an out-of-process sampling profiler tie the
//! stacks it samples to the trace context running inside the JVM.
//!
//! The profiler cannot pause the JVM, so correlation goes through side
//! channels that never block either party:
//!
//! - **Correlation buffers**: memory the JVM writes (per thread and per
//!   process) and the profiler reads
//! - **Return channel**: a non-blocking Unix datagram socket the profiler
//!   sends fixed-size result frames to
//! - **Virtual thread bridge**: mount/unmount forwarding, since a virtual
//!   thread's trace context moves with it across carrier threads
//! - **Stack capture**: allocation-free for the common frame counts, with
//!   method metadata resolved on demand
//! - **Allocation sampling**: capability negotiation and rate control
//!
//! ## Loading
//!
//! ```bash
//! cargo build --release
//! java -agentpath:./target/release/libjvmti_correlation.so=virtual_threads=true MyApp
//! ```
//!
//! or `System.load` from the bridge class, which makes `JNI_OnLoad` register
//! its native methods. See [`config`] for the option keys.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            JNI natives + JVMTI event handlers            │
//! │                        (ffi)                             │
//! ├─────────────────────────────────────────────────────────┤
//! │               CorrelationAgent<I> context                │
//! │    lifecycle, flags, cached event indices, callbacks     │
//! ├──────────┬──────────┬─────────────┬──────────┬──────────┤
//! │  stack   │ sampling │ correlation │ channel  │ vthread  │
//! ├──────────┴──────────┴─────────────┴──────────┴──────────┤
//! │       Introspection / Runtime collaborator traits        │
//! │        (Jvmti and JniEnv for a live JVM, fakes in tests) │
//! ├─────────────────────────────────────────────────────────┤
//! │              Raw FFI Bindings (sys module)               │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`agent`] | The agent context and its lifecycle |
//! | [`stack`] | Stack trace capture, method handles, metadata resolution |
//! | [`sampling`] | Allocation sampling negotiation |
//! | [`correlation`] | Correlation regions, bounded views, record layouts |
//! | [`channel`] | Return channel transport and frame format |
//! | [`vthread`] | Virtual thread mount/unmount bridge |
//! | [`introspection`] | Collaborator traits |
//! | [`env`] | JVMTI and JNI wrappers |
//! | [`sys::jni`], [`sys::jvmti`] | Raw bindings |
//!
//! ## Embedding
//!
//! The agent is an ordinary value; the JNI layer owns one, tests and other
//! hosts can own as many as they like:
//!
//! ```rust,ignore
//! use jvmti_correlation::prelude::*;
//!
//! let agent = CorrelationAgent::new(AgentConfig::default());
//! agent.init(&jni_env)?;
//! agent.open_return_channel(default_channel_path())?;
//! let mut frames = vec![0i64; 64];
//! let request = StackRequest::current_thread(0, 32, FrameEncoding::WithLocations);
//! let count = agent.capture_stack_trace(&request, &mut frames)?;
//! agent.destroy(&jni_env)?;
//! ```

pub mod sys;
pub mod env;
pub mod prelude;

pub mod agent;
pub mod channel;
pub mod config;
pub mod correlation;
pub mod error;
pub mod ffi;
pub mod introspection;
pub mod sampling;
pub mod stack;
pub mod vthread;

mod guard;

// Implementation modules (use `env` module for the public API)
#[doc(hidden)]
pub mod jvmti_wrapper;
#[doc(hidden)]
pub mod jni_wrapper;

pub use agent::CorrelationAgent;
pub use error::{AgentError, Result};
