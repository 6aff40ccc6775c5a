//! Agent configuration.
//!
//! Options use the JVM agent option syntax, `key=value[,key=value...]`, so the
//! same string works after `-agentpath:libjvmti_correlation.so=` and in the
//! [`OPTIONS_ENV`] environment variable.
//!
//! | Key | Default |
//! |-----|---------|
//! | `bridge_class` | `correlation/agent/NativeBridge` |
//! | `virtual_threads` | `false` |
//! | `sampling_interval` | `524288` |
//! | `mount_event` | `com.sun.hotspot.events.VirtualThreadMount` |
//! | `unmount_event` | `com.sun.hotspot.events.VirtualThreadUnmount` |
//! | `mount_callback` | `onVirtualThreadMount` |
//! | `unmount_callback` | `onVirtualThreadUnmount` |
//! | `allocation_callback` | `onSampledAllocation` |

use crate::error::{AgentError, Result};

/// Environment variable consulted when the JVM passes no agent options.
pub const OPTIONS_ENV: &str = "JVMTI_CORRELATION_OPTIONS";

pub const DEFAULT_BRIDGE_CLASS: &str = "correlation/agent/NativeBridge";
pub const DEFAULT_SAMPLING_INTERVAL: i32 = 512 * 1024;
pub const MOUNT_EVENT_ID: &str = "com.sun.hotspot.events.VirtualThreadMount";
pub const UNMOUNT_EVENT_ID: &str = "com.sun.hotspot.events.VirtualThreadUnmount";

const TRANSITION_DESCRIPTOR: &str = "(Ljava/lang/Thread;)V";
const ALLOCATION_DESCRIPTOR: &str = "(Ljava/lang/Object;J)V";

/// A static method on a managed class, addressed the way JNI resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    pub class: String,
    pub method: String,
    pub descriptor: String,
}

impl CallbackTarget {
    pub fn new(class: &str, method: &str, descriptor: &str) -> Self {
        CallbackTarget {
            class: class.to_string(),
            method: method.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl std::fmt::Display for CallbackTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.class, self.method, self.descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Class declaring the native methods and the static callbacks.
    pub bridge_class: String,
    /// Negotiate `can_support_virtual_threads` during init.
    pub virtual_threads: bool,
    /// Mean bytes between allocation samples until a rate is set.
    pub sampling_interval: i32,
    pub mount_event: String,
    pub unmount_event: String,
    mount_callback: String,
    unmount_callback: String,
    allocation_callback: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            bridge_class: DEFAULT_BRIDGE_CLASS.to_string(),
            virtual_threads: false,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            mount_event: MOUNT_EVENT_ID.to_string(),
            unmount_event: UNMOUNT_EVENT_ID.to_string(),
            mount_callback: "onVirtualThreadMount".to_string(),
            unmount_callback: "onVirtualThreadUnmount".to_string(),
            allocation_callback: "onSampledAllocation".to_string(),
        }
    }
}

impl AgentConfig {
    /// Parses an option string. Empty input yields the defaults.
    pub fn parse(options: &str) -> Result<Self> {
        let mut config = AgentConfig::default();
        for entry in options.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| AgentError::InvalidArgument(format!("option '{entry}' is not key=value")))?;
            config.apply(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    /// Options from [`OPTIONS_ENV`], or the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(OPTIONS_ENV) {
            Ok(options) => Self::parse(&options),
            Err(_) => Ok(Self::default()),
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(AgentError::InvalidArgument(format!("option '{key}' has an empty value")));
        }
        match key {
            "bridge_class" => self.bridge_class = value.replace('.', "/"),
            "virtual_threads" => {
                self.virtual_threads = value
                    .parse()
                    .map_err(|_| AgentError::InvalidArgument(format!("virtual_threads={value} is not a boolean")))?;
            }
            "sampling_interval" => {
                self.sampling_interval = value
                    .parse::<i32>()
                    .ok()
                    .filter(|v| *v >= 0)
                    .ok_or_else(|| AgentError::InvalidArgument(format!("sampling_interval={value}")))?;
            }
            "mount_event" => self.mount_event = value.to_string(),
            "unmount_event" => self.unmount_event = value.to_string(),
            "mount_callback" => self.mount_callback = value.to_string(),
            "unmount_callback" => self.unmount_callback = value.to_string(),
            "allocation_callback" => self.allocation_callback = value.to_string(),
            _ => return Err(AgentError::InvalidArgument(format!("unknown option '{key}'"))),
        }
        Ok(())
    }

    pub fn mount_callback(&self) -> CallbackTarget {
        CallbackTarget::new(&self.bridge_class, &self.mount_callback, TRANSITION_DESCRIPTOR)
    }

    pub fn unmount_callback(&self) -> CallbackTarget {
        CallbackTarget::new(&self.bridge_class, &self.unmount_callback, TRANSITION_DESCRIPTOR)
    }

    pub fn allocation_callback(&self) -> CallbackTarget {
        CallbackTarget::new(&self.bridge_class, &self.allocation_callback, ALLOCATION_DESCRIPTOR)
    }
}
