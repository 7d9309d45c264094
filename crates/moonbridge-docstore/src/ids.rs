//! Document identifiers and timestamps
//!
//! [`ObjectId`] crosses the boundary as its 24-character hex string, in both
//! directions. [`Timestamp`] is pushed to scripts as seconds since the Unix
//! epoch and cannot be read back.

use moonbridge_engine::{Bridge, BridgeResult, LuaApi, LuaType, Transformer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Unique document identifier: creation second plus a process-wide sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    seconds: u32,
    sequence: u64,
}

impl ObjectId {
    /// Allocate a new id
    pub fn new() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        Self {
            seconds,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Second the id was allocated in
    pub fn seconds(&self) -> u32 {
        self.seconds
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:016x}", self.seconds, self.sequence)
    }
}

/// Error parsing an [`ObjectId`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object id {0:?}")]
pub struct ParseObjectIdError(String);

impl FromStr for ObjectId {
    type Err = ParseObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseObjectIdError(s.to_string());
        if s.len() != 24 || !s.is_ascii() {
            return Err(invalid());
        }
        let seconds = u32::from_str_radix(&s[..8], 16).map_err(|_| invalid())?;
        let sequence = u64::from_str_radix(&s[8..], 16).map_err(|_| invalid())?;
        Ok(Self { seconds, sequence })
    }
}

/// Moment a document was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Current time
    pub fn now() -> Self {
        Timestamp(SystemTime::now())
    }

    /// Seconds since the Unix epoch
    pub fn as_secs_f64(&self) -> f64 {
        self.0
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
    }
}

// ============================================================================
// Transformers
// ============================================================================

/// `ObjectId` ↔ hex string
pub struct ObjectIdTransformer;

impl Transformer for ObjectIdTransformer {
    type Target = ObjectId;

    fn convert(&self, _bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &ObjectId) -> BridgeResult<i32> {
        vm.push_string(&value.to_string());
        Ok(1)
    }

    fn try_parse(
        &self,
        _bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        idx: i32,
        keep: bool,
    ) -> BridgeResult<Option<ObjectId>> {
        if vm.type_of(idx) != LuaType::String {
            return Ok(None);
        }
        let Some(id) = vm.to_str(idx).and_then(|s| s.parse().ok()) else {
            return Ok(None);
        };
        if !keep {
            vm.remove(idx)?;
        }
        Ok(Some(id))
    }
}

/// `Timestamp` → seconds since the epoch
pub struct TimestampTransformer;

impl Transformer for TimestampTransformer {
    type Target = Timestamp;

    fn convert(&self, _bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &Timestamp) -> BridgeResult<i32> {
        vm.push_number(value.as_secs_f64());
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_form() {
        let id = ObjectId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 24);
        assert_eq!(text.parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert!(a < b || a.seconds() != b.seconds());
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!("".parse::<ObjectId>().is_err());
        assert!("zz000000000000000000000z".parse::<ObjectId>().is_err());
        assert!("0123456789abcdef01234567ff".parse::<ObjectId>().is_err());
    }
}
