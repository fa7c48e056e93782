/*!
 * Core Module
 * Fundamental sandbox types, limits, configuration and error handling
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod serde;
pub mod types;

// Re-export for convenience
pub use config::SandboxConfig;
pub use errors::*;
pub use types::*;
