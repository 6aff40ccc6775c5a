//! Virtual thread mount/unmount forwarding.
//!
//! HotSpot advertises the mount and unmount transitions of virtual threads as
//! JVMTI extension events. The bridge finds them by id and shape, installs a
//! native handler on each, and every firing calls the matching static
//! callback on the bridge class with the virtual thread.

use crate::error::{AgentError, Result};
use crate::introspection::{ExtensionEvent, ExtensionParam, Introspection};
use crate::sys::jni::jint;
use crate::sys::jvmti::{JVMTI_KIND_IN, JVMTI_KIND_IN_PTR, JVMTI_TYPE_JNIENV, JVMTI_TYPE_JTHREAD};
use crate::guard::Rollback;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Mount,
    Unmount,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Mount => "mount",
            Transition::Unmount => "unmount",
        }
    }
}

/// Extension event indices of the two transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEvents {
    pub mount: jint,
    pub unmount: jint,
}

/// `(JNIEnv*, jthread)`, both non-null.
const TRANSITION_SHAPE: [ExtensionParam; 2] = [
    ExtensionParam { kind: JVMTI_KIND_IN_PTR, base_type: JVMTI_TYPE_JNIENV, null_ok: false },
    ExtensionParam { kind: JVMTI_KIND_IN, base_type: JVMTI_TYPE_JTHREAD, null_ok: false },
];

/// Index of the event called `id` if its parameters have the transition shape.
pub fn find_transition_event(events: &[ExtensionEvent], id: &str) -> Option<jint> {
    events
        .iter()
        .find(|event| event.id == id && event.params == TRANSITION_SHAPE)
        .map(|event| event.index)
}

/// Looks both events up. Fails naming the first one that is missing.
pub fn discover<I: Introspection + ?Sized>(jvmti: &I, mount_id: &str, unmount_id: &str) -> Result<TransitionEvents> {
    let events = jvmti
        .extension_events()
        .map_err(|e| AgentError::jvmti("GetExtensionEvents", e))?;
    let lookup = |id: &str| {
        find_transition_event(&events, id)
            .ok_or_else(|| AgentError::ResolutionFailure(format!("extension event {id}")))
    };
    let mount = lookup(mount_id)?;
    let unmount = lookup(unmount_id)?;
    debug!("virtual thread events: mount #{mount}, unmount #{unmount}");
    Ok(TransitionEvents { mount, unmount })
}

/// Installs both handlers; a failed unmount install takes the mount one out
/// again.
pub(crate) fn install<I: Introspection + ?Sized>(jvmti: &I, events: TransitionEvents) -> Result<()> {
    jvmti
        .set_transition_handler(events.mount, Some(Transition::Mount))
        .map_err(|e| AgentError::jvmti("SetExtensionEventCallback", e))?;
    let mount = Rollback::new(|| {
        if let Err(e) = jvmti.set_transition_handler(events.mount, None) {
            warn!("could not remove the virtual thread mount handler: {}", e.0);
        }
    });

    jvmti
        .set_transition_handler(events.unmount, Some(Transition::Unmount))
        .map_err(|e| AgentError::jvmti("SetExtensionEventCallback", e))?;

    mount.commit();
    Ok(())
}

/// Clears both handlers, attempting the second even if the first fails, and
/// reports the first failure.
pub(crate) fn uninstall<I: Introspection + ?Sized>(jvmti: &I, events: TransitionEvents) -> Result<()> {
    let mount = jvmti.set_transition_handler(events.mount, None);
    let unmount = jvmti.set_transition_handler(events.unmount, None);
    mount
        .and(unmount)
        .map_err(|e| AgentError::jvmti("SetExtensionEventCallback", e))
}
