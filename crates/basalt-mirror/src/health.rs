// File: crates/basalt-mirror/src/health.rs

//! Fleet-health attribute reporting.
//!
//! The coordinator publishes a small set of per-pool attributes to an
//! external fleet-management daemon through this seam. The sink schema has
//! no namespace dimension, so only the coordinator for a pool's root
//! namespace publishes (sub-namespace coordinators skip the sink entirely).

use crate::types::PoolId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute key for the instance id this process publishes to the fleet.
pub const INSTANCE_ID_KEY: &str = "instance_id";

/// Attribute key for the number of mirror-enabled images in the local pool.
pub const IMAGE_LOCAL_COUNT_KEY: &str = "image_local_count";

/// Attribute key for the number of mirror-enabled images in the remote pool.
pub const IMAGE_REMOTE_COUNT_KEY: &str = "image_remote_count";

/// Value payload for one fleet-health attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean flag.
    Bool(bool),
    /// Unsigned counter or gauge.
    U64(u64),
    /// Free-form string (identifiers, names).
    Str(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::U64(v) => write!(f, "{v}"),
            AttributeValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        AttributeValue::U64(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

/// Sink for per-pool health attributes, owned by the enclosing process and
/// shared across every namespace coordinator in it.
pub trait FleetHealthSink: Send + Sync {
    /// Record `value` under `key` for `pool_id`, replacing any prior value.
    fn add_or_update_attribute(&self, pool_id: PoolId, key: &str, value: AttributeValue);
}
