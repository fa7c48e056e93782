/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sandbox operation result
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Coordinator-level errors
///
/// These never describe policy violations (those are recorded as
/// violations in the report); they describe why a request could not be run.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SandboxError {
    #[error("Coordinator is shutting down")]
    #[diagnostic(
        code(sandbox::shutting_down),
        help("The coordinator no longer accepts executions. Build a new one.")
    )]
    ShuttingDown,

    #[error("Execution {0} is already active")]
    #[diagnostic(
        code(sandbox::duplicate_execution),
        help("Request ids must be unique among in-flight executions.")
    )]
    DuplicateExecution(String),

    #[error("Unsupported language: {0}")]
    #[diagnostic(
        code(sandbox::unsupported_language),
        help("Supported language tags: javascript, js, node, ecmascript.")
    )]
    UnsupportedLanguage(String),

    #[error("Supervisor setup failed: {0}")]
    #[diagnostic(
        code(sandbox::supervisor_setup),
        help("Supervisors need a running tokio runtime with the time driver enabled.")
    )]
    SupervisorSetup(String),

    #[error("Execution unit failed to start: {0}")]
    #[diagnostic(code(sandbox::unit_spawn))]
    UnitSpawn(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(sandbox::invalid_config),
        help("Check SANDBOX_* environment variables and limit ceilings.")
    )]
    InvalidConfig(String),
}

/// Supervisor lifecycle errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SupervisorError {
    #[error("No tokio runtime available to host the supervisor")]
    #[diagnostic(
        code(supervisor::no_runtime),
        help("Call execute_securely from within a tokio runtime.")
    )]
    NoRuntime,

    #[error("Supervisor is already running")]
    #[diagnostic(code(supervisor::already_started))]
    AlreadyStarted,

    #[error("Supervisor was never started")]
    #[diagnostic(code(supervisor::not_started))]
    NotStarted,

    #[error("Supervisor task failed: {0}")]
    #[diagnostic(code(supervisor::task_failed))]
    TaskFailed(String),
}

impl From<SupervisorError> for SandboxError {
    fn from(err: SupervisorError) -> Self {
        SandboxError::SupervisorSetup(err.to_string())
    }
}
