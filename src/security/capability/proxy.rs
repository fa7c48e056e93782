/*!
 * Restricted Capability Proxy
 */

use std::collections::BTreeSet;
use std::sync::Arc;

/// Handle to an allow-listed capability exposing only a named subset of
/// its operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedModule {
    name: Arc<str>,
    operations: Arc<BTreeSet<String>>,
}

impl RestrictedModule {
    pub(super) fn new(name: &str, operations: &BTreeSet<String>) -> Self {
        Self {
            name: Arc::from(name),
            operations: Arc::new(operations.clone()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the proxy exposes an operation
    #[inline]
    pub fn exposes(&self, operation: &str) -> bool {
        self.operations.contains(operation)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_exposes_only_subset() {
        let ops: BTreeSet<String> = ["join".to_string()].into_iter().collect();
        let module = RestrictedModule::new("path", &ops);
        assert_eq!(module.name(), "path");
        assert!(module.exposes("join"));
        assert!(!module.exposes("resolve"));
        assert_eq!(module.operations().collect::<Vec<_>>(), vec!["join"]);
    }
}
