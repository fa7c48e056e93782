/*!
 * Serde Helpers
 * Field adapters shared by violations and reports
 */

use serde::{Deserialize, Deserializer, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `SystemTime` as integer microseconds since the UNIX epoch
///
/// Violation timestamps are compared at this precision when reports are
/// ordered, so the wire form keeps all of it.
pub mod system_time_micros {
    use super::*;

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let micros = u64::deserialize(deserializer)?;
        UNIX_EPOCH
            .checked_add(Duration::from_micros(micros))
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}

pub fn is_none<T>(value: &Option<T>) -> bool {
    value.is_none()
}

pub fn is_false(value: &bool) -> bool {
    !*value
}
