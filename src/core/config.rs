/*!
 * Sandbox Configuration
 * Process-wide defaults with SANDBOX_* environment overrides
 */

use super::errors::{SandboxError, SandboxResult};
use super::limits;
use super::types::{LimitCeilings, ResourceLimits};
use crate::security::capability::CapabilityPolicy;
use crate::security::environment::EnvironmentPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// Everything the coordinator needs to know before accepting requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SandboxConfig {
    pub limits: ResourceLimits,
    pub ceilings: LimitCeilings,
    /// Reject before spawning on any high or critical static finding
    pub strict_mode: bool,
    pub max_source_bytes: usize,
    pub max_output_bytes: usize,
    pub capabilities: CapabilityPolicy,
    pub environment: EnvironmentPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            ceilings: LimitCeilings::default(),
            strict_mode: true,
            max_source_bytes: limits::DEFAULT_MAX_SOURCE_BYTES,
            max_output_bytes: limits::DEFAULT_MAX_OUTPUT_BYTES,
            capabilities: CapabilityPolicy::default(),
            environment: EnvironmentPolicy::default(),
        }
    }
}

impl SandboxConfig {
    /// Defaults overlaid with `SANDBOX_*` variables from the process environment
    pub fn from_env() -> SandboxResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from an arbitrary lookup
    pub fn from_lookup<F>(lookup: F) -> SandboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let l = &mut config.limits;

        overlay(&lookup, "SANDBOX_MAX_EXECUTION_MS", &mut l.max_execution_time_ms)?;
        overlay(&lookup, "SANDBOX_MAX_CPU_MS", &mut l.max_cpu_time_ms)?;
        overlay(&lookup, "SANDBOX_MAX_HEAP_BYTES", &mut l.max_heap_bytes)?;
        overlay(&lookup, "SANDBOX_MAX_RSS_BYTES", &mut l.max_rss_bytes)?;
        overlay(&lookup, "SANDBOX_MAX_BUFFER_BYTES", &mut l.max_buffer_bytes)?;
        overlay(&lookup, "SANDBOX_SAMPLE_INTERVAL_MS", &mut l.sample_interval_ms)?;
        overlay(
            &lookup,
            "SANDBOX_TIMEOUT_SAMPLE_INTERVAL_MS",
            &mut l.timeout_sample_interval_ms,
        )?;
        overlay(&lookup, "SANDBOX_MAX_SOURCE_BYTES", &mut config.max_source_bytes)?;

        if let Some(raw) = lookup("SANDBOX_STRICT_MODE") {
            config.strict_mode = parse_flag(&raw).ok_or_else(|| {
                SandboxError::InvalidConfig(format!("SANDBOX_STRICT_MODE: not a boolean: {}", raw))
            })?;
        }

        if let Some(raw) = lookup("SANDBOX_ENV_ALLOW") {
            config.environment.allowed.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from),
            );
        }

        config.validate()?;
        debug!(limits = ?config.limits, strict_mode = config.strict_mode, "Loaded sandbox configuration");
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> SandboxResult<()> {
        let l = &self.limits;
        let fail = |msg: String| Err(SandboxError::InvalidConfig(msg));

        if l.max_execution_time_ms < limits::MIN_EXECUTION_TIME_MS {
            return fail(format!(
                "max_execution_time_ms must be at least {}",
                limits::MIN_EXECUTION_TIME_MS
            ));
        }
        if l.max_execution_time_ms > self.ceilings.max_execution_time_ms {
            return fail(format!(
                "max_execution_time_ms {} exceeds ceiling {}",
                l.max_execution_time_ms, self.ceilings.max_execution_time_ms
            ));
        }
        if l.max_cpu_time_ms == 0 {
            return fail("max_cpu_time_ms must be positive".into());
        }
        if l.max_heap_bytes < limits::MIN_HEAP_BYTES {
            return fail(format!("max_heap_bytes must be at least {}", limits::MIN_HEAP_BYTES));
        }
        if l.max_heap_bytes > self.ceilings.max_heap_bytes {
            return fail(format!(
                "max_heap_bytes {} exceeds ceiling {}",
                l.max_heap_bytes, self.ceilings.max_heap_bytes
            ));
        }
        if l.max_rss_bytes == 0 || l.max_buffer_bytes == 0 {
            return fail("rss and buffer ceilings must be positive".into());
        }
        if l.sample_interval_ms == 0 || l.timeout_sample_interval_ms == 0 {
            return fail("sampling intervals must be positive".into());
        }
        if self.max_source_bytes == 0 || self.max_output_bytes == 0 {
            return fail("source and output caps must be positive".into());
        }
        Ok(())
    }
}

fn overlay<F, T>(lookup: &F, name: &str, target: &mut T) -> SandboxResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw.trim().parse().map_err(|_| {
            SandboxError::InvalidConfig(format!("{}: not a valid number: {}", name, raw))
        })?;
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
