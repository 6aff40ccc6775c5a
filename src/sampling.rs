//! Allocation sampling negotiation.
//!
//! Enabling acquires `can_generate_sampled_object_alloc_events`, turns on
//! `SampledObjectAlloc` notification and applies the interval. Each step is
//! undone if a later one fails, so a failed enable leaves the environment as
//! it found it.

use crate::error::{AgentError, Result};
use crate::guard::Rollback;
use crate::introspection::Introspection;
use crate::sys::jni::jint;
use crate::sys::jvmti::{jvmtiCapabilities, JVMTI_EVENT_SAMPLED_OBJECT_ALLOC};
use log::{debug, warn};

fn sampling_capability() -> jvmtiCapabilities {
    let mut caps = jvmtiCapabilities::default();
    caps.set_can_generate_sampled_object_alloc_events(true);
    caps
}

/// Whether the JVM can deliver sampled allocation events at all.
pub fn is_supported<I: Introspection + ?Sized>(jvmti: &I) -> Result<bool> {
    let potential = jvmti
        .potential_capabilities()
        .map_err(|e| AgentError::jvmti("GetPotentialCapabilities", e))?;
    Ok(potential.can_generate_sampled_object_alloc_events())
}

pub(crate) fn enable<I: Introspection + ?Sized>(jvmti: &I, interval: jint) -> Result<()> {
    check_interval(interval)?;
    if !is_supported(jvmti)? {
        return Err(AgentError::Unsupported("sampled object allocation"));
    }

    let caps = sampling_capability();
    jvmti
        .add_capabilities(&caps)
        .map_err(|e| AgentError::jvmti("AddCapabilities", e))?;
    let capability = Rollback::new(|| {
        if let Err(e) = jvmti.relinquish_capabilities(&caps) {
            warn!("could not relinquish the allocation sampling capability: {}", e.0);
        }
    });

    jvmti
        .set_event_notification(true, JVMTI_EVENT_SAMPLED_OBJECT_ALLOC)
        .map_err(|e| AgentError::jvmti("SetEventNotificationMode", e))?;
    let notification = Rollback::new(|| {
        if let Err(e) = jvmti.set_event_notification(false, JVMTI_EVENT_SAMPLED_OBJECT_ALLOC) {
            warn!("could not disable sampled allocation events: {}", e.0);
        }
    });

    jvmti
        .set_heap_sampling_interval(interval)
        .map_err(|e| AgentError::jvmti("SetHeapSamplingInterval", e))?;

    notification.commit();
    capability.commit();
    debug!("allocation sampling enabled, interval {interval} bytes");
    Ok(())
}

pub(crate) fn disable<I: Introspection + ?Sized>(jvmti: &I) -> Result<()> {
    jvmti
        .set_event_notification(false, JVMTI_EVENT_SAMPLED_OBJECT_ALLOC)
        .map_err(|e| AgentError::jvmti("SetEventNotificationMode", e))?;
    jvmti
        .relinquish_capabilities(&sampling_capability())
        .map_err(|e| AgentError::jvmti("RelinquishCapabilities", e))?;
    debug!("allocation sampling disabled");
    Ok(())
}

pub(crate) fn set_interval<I: Introspection + ?Sized>(jvmti: &I, interval: jint) -> Result<()> {
    check_interval(interval)?;
    jvmti
        .set_heap_sampling_interval(interval)
        .map_err(|e| AgentError::jvmti("SetHeapSamplingInterval", e))
}

fn check_interval(interval: jint) -> Result<()> {
    if interval < 0 {
        return Err(AgentError::InvalidArgument(format!(
            "sampling interval must be >= 0, got {interval}"
        )));
    }
    Ok(())
}
