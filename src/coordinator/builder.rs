/*!
 * Coordinator Builder
 * Explicit construction with injected configuration and environment snapshot
 */

use super::manager::Coordinator;
use crate::core::config::SandboxConfig;
use crate::core::errors::SandboxResult;
use crate::security::{CapabilityPolicy, EnvironmentPolicy};
use std::collections::HashMap;

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder {
    config: SandboxConfig,
    environment: Option<HashMap<String, String>>,
    event_capacity: Option<usize>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: SandboxConfig::default(),
            environment: None,
            event_capacity: None,
        }
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the capability policy of the current config
    pub fn with_capability_policy(mut self, policy: CapabilityPolicy) -> Self {
        self.config.capabilities = policy;
        self
    }

    /// Replace the environment policy of the current config
    pub fn with_environment_policy(mut self, policy: EnvironmentPolicy) -> Self {
        self.config.environment = policy;
        self
    }

    /// Configuration values units may read (after filtering)
    ///
    /// Without this the process environment is snapshotted at build time.
    pub fn with_environment(mut self, snapshot: HashMap<String, String>) -> Self {
        self.environment = Some(snapshot);
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.config.strict_mode = strict;
        self
    }

    /// Buffer size of the supervisor event channel
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Validate the configuration and build the coordinator
    pub fn build(self) -> SandboxResult<Coordinator> {
        self.config.validate()?;
        let environment = self
            .environment
            .unwrap_or_else(|| std::env::vars().collect());
        Ok(Coordinator::from_parts(
            self.config,
            environment,
            self.event_capacity
                .unwrap_or(crate::core::limits::EVENT_CHANNEL_CAPACITY),
        ))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
