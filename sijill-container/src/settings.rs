//! Container settings.
//!
//! Usually deserialized by whatever loads the application configuration,
//! then handed to [`ContainerBuilder::settings`](crate::container::ContainerBuilder::settings).
//! Every field has a default, so a partial document is fine.

use std::time::Duration;

use serde::Deserialize;

/// What `publish` does when the async dispatch queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Wait for room (backpressure on the publisher).
    #[default]
    Block,
    /// Return `DispatchQueueFull` right away.
    Fail,
}

/// Tunables for the container and its event bus.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Worker threads running async listeners.
    pub async_workers: usize,
    /// Pending async listener invocations before the policy kicks in.
    pub async_queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    /// Upper bound on draining async work at shutdown.
    pub shutdown_timeout_ms: u64,
    /// Run pending async work at shutdown instead of discarding it.
    pub drain_on_shutdown: bool,
    /// Publish `LifecycleEvent` and `ContainerEvent` on the bus.
    pub publish_lifecycle_events: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            async_workers: 4,
            async_queue_capacity: 256,
            queue_full_policy: QueueFullPolicy::Block,
            shutdown_timeout_ms: 5_000,
            drain_on_shutdown: true,
            publish_lifecycle_events: true,
        }
    }
}

impl ContainerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ContainerSettings::default();
        assert_eq!(settings.async_workers, 4);
        assert_eq!(settings.queue_full_policy, QueueFullPolicy::Block);
        assert_eq!(settings.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let settings: ContainerSettings = serde_json::from_str(
            r#"{ "async_queue_capacity": 8, "queue_full_policy": "fail" }"#,
        )
        .unwrap();

        assert_eq!(settings.async_queue_capacity, 8);
        assert_eq!(settings.queue_full_policy, QueueFullPolicy::Fail);
        assert_eq!(settings.async_workers, 4);
        assert!(settings.drain_on_shutdown);
    }

    #[test]
    fn unknown_policy_rejected() {
        let parsed = serde_json::from_str::<ContainerSettings>(r#"{ "queue_full_policy": "drop" }"#);
        assert!(parsed.is_err());
    }
}
