/*!
 * Capability Gate
 * Default-deny interception of capability acquisition inside one execution unit
 */

use super::policy::{CapabilityDecision, CapabilityPolicy};
use super::proxy::RestrictedModule;
use crate::core::types::ExecutionId;
use crate::security::traits::ViolationSink;
use crate::security::types::{Severity, Violation, ViolationKind, ViolationSource};
use miette::Diagnostic;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Refused capability acquisition
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum CapabilityDenied {
    #[error("Capability '{0}' is deny-listed")]
    #[diagnostic(code(capability::deny_listed))]
    DenyListed(String),

    #[error("Capability '{0}' is not allow-listed")]
    #[diagnostic(code(capability::not_allowed))]
    NotAllowed(String),

    #[error("Operation '{operation}' is not exposed by restricted capability '{module}'")]
    #[diagnostic(code(capability::operation_hidden))]
    OperationHidden { module: String, operation: String },

    #[error("{0} with a string callback is not permitted")]
    #[diagnostic(code(capability::timer_source))]
    TimerSource(String),

    #[error("Dynamic code generation via {0} is not permitted")]
    #[diagnostic(code(capability::dynamic_code))]
    DynamicCode(String),

    #[error("Capability gate is not installed")]
    #[diagnostic(code(capability::not_installed))]
    NotInstalled,
}

impl CapabilityDenied {
    /// Severity of the violation recorded for this refusal
    pub fn severity(&self) -> Severity {
        match self {
            CapabilityDenied::DenyListed(_) => Severity::Critical,
            CapabilityDenied::NotAllowed(_)
            | CapabilityDenied::TimerSource(_)
            | CapabilityDenied::DynamicCode(_)
            | CapabilityDenied::NotInstalled => Severity::High,
            CapabilityDenied::OperationHidden { .. } => Severity::Medium,
        }
    }
}

/// Gate lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Uninitialized,
    Active,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GateState::Uninitialized => write!(f, "uninitialized"),
            GateState::Active => write!(f, "active"),
        }
    }
}

/// Per-unit capability gate
///
/// Never shared across units: each unit gets its own instance wired to its
/// own violation sink.
pub struct CapabilityGate {
    execution_id: ExecutionId,
    policy: Arc<CapabilityPolicy>,
    sink: Arc<dyn ViolationSink>,
    state: GateState,
}

impl CapabilityGate {
    pub fn new(
        execution_id: ExecutionId,
        policy: Arc<CapabilityPolicy>,
        sink: Arc<dyn ViolationSink>,
    ) -> Self {
        Self {
            execution_id,
            policy,
            sink,
            state: GateState::Uninitialized,
        }
    }

    /// Activate the gate; returns false if it was already active
    pub fn install(&mut self) -> bool {
        if self.state == GateState::Active {
            return false;
        }
        self.state = GateState::Active;
        debug!(execution_id = %self.execution_id, "Capability gate installed");
        true
    }

    #[inline]
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Acquire a named capability
    pub fn acquire(&self, name: &str) -> Result<RestrictedModule, CapabilityDenied> {
        if self.state != GateState::Active {
            return Err(self.refuse(CapabilityDenied::NotInstalled, name));
        }

        let normalized = CapabilityPolicy::normalize(name);
        match self.policy.decide(normalized) {
            CapabilityDecision::Allowed(operations) => {
                debug!(
                    execution_id = %self.execution_id,
                    capability = normalized,
                    "Capability granted through restricted proxy"
                );
                Ok(RestrictedModule::new(normalized, operations))
            }
            CapabilityDecision::Denied => {
                Err(self.refuse(CapabilityDenied::DenyListed(normalized.to_string()), normalized))
            }
            CapabilityDecision::Unlisted => {
                Err(self.refuse(CapabilityDenied::NotAllowed(normalized.to_string()), normalized))
            }
        }
    }

    /// Check an operation against a proxy's exposed subset
    pub fn check_operation(
        &self,
        module: &RestrictedModule,
        operation: &str,
    ) -> Result<(), CapabilityDenied> {
        if module.exposes(operation) {
            return Ok(());
        }
        let subject = format!("{}.{}", module.name(), operation);
        Err(self.refuse(
            CapabilityDenied::OperationHidden {
                module: module.name().to_string(),
                operation: operation.to_string(),
            },
            &subject,
        ))
    }

    /// Reject timer APIs invoked with executable text
    pub fn reject_timer_source(&self, api: &str) -> CapabilityDenied {
        self.refuse(CapabilityDenied::TimerSource(api.to_string()), api)
    }

    /// Reject runtime code generation
    pub fn reject_dynamic_code(&self, api: &str) -> CapabilityDenied {
        self.refuse(CapabilityDenied::DynamicCode(api.to_string()), api)
    }

    fn refuse(&self, denial: CapabilityDenied, subject: &str) -> CapabilityDenied {
        let severity = denial.severity();
        warn!(
            execution_id = %self.execution_id,
            capability = subject,
            severity = %severity,
            "Capability denied: {}",
            denial
        );
        self.sink.record(
            Violation::new(
                ViolationKind::CapabilityDenied,
                severity,
                ViolationSource::CapabilityGate,
                denial.to_string(),
            )
            .with_subject(subject),
        );
        denial
    }
}
