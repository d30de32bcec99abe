//! Identifiers and pool addressing shared across the mirroring subsystems.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Numeric identifier of a storage pool within a cluster.
pub type PoolId = i64;

/// Unique identifier of one mirroring peer (one side of a peering).
pub type MirrorUuid = String;

/// Cluster-independent identifier for a mirrored image, stable across
/// local/remote naming differences.
pub type GlobalImageId = String;

/// Identifier a worker process publishes for itself within the fleet.
pub type InstanceId = String;

/// One discovered image: its global identity plus the pool-local image id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId {
    /// Cluster-independent identity.
    pub global_id: GlobalImageId,
    /// Pool-local image id on the observed side.
    pub id: String,
}

impl ImageId {
    /// Create an image id pair.
    pub fn new(global_id: impl Into<GlobalImageId>, id: impl Into<String>) -> Self {
        Self {
            global_id: global_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.global_id, self.id)
    }
}

/// Ordered set of discovered images, as delivered by a pool watcher.
///
/// Ordering and equality are by `(global_id, id)`, so reducing a delta to its
/// global-identity set is a stable, deterministic operation.
pub type ImageIds = BTreeSet<ImageId>;

/// An owned reference into one pool, optionally narrowed to a namespace.
///
/// The coordinator duplicates the caller's handles at construction and narrows
/// them to its namespace; nothing else mutates these copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHandle {
    /// Pool id within the owning cluster.
    pub pool_id: PoolId,
    /// Human-readable pool name.
    pub pool_name: String,
    /// Namespace this handle is narrowed to; empty means the root namespace.
    pub namespace: String,
}

impl PoolHandle {
    /// Handle addressing the root namespace of a pool.
    pub fn new(pool_id: PoolId, pool_name: impl Into<String>) -> Self {
        Self {
            pool_id,
            pool_name: pool_name.into(),
            namespace: String::new(),
        }
    }

    /// Copy of this handle narrowed to `namespace`.
    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            pool_id: self.pool_id,
            pool_name: self.pool_name.clone(),
            namespace: namespace.into(),
        }
    }

    /// True when this handle addresses the pool's root namespace.
    pub fn is_root_namespace(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.pool_id, self.pool_name)
        } else {
            write!(f, "{}/{}/{}", self.pool_id, self.pool_name, self.namespace)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ids_order_by_global_then_local() {
        let mut set = ImageIds::new();
        set.insert(ImageId::new("g2", "b"));
        set.insert(ImageId::new("g1", "z"));
        set.insert(ImageId::new("g1", "a"));

        let ordered: Vec<_> = set.iter().map(|i| i.to_string()).collect();
        assert_eq!(ordered, vec!["g1/a", "g1/z", "g2/b"]);
    }

    #[test]
    fn with_namespace_preserves_pool_identity() {
        let root = PoolHandle::new(3, "tank");
        let ns = root.with_namespace("tenant-a");

        assert_eq!(ns.pool_id, root.pool_id);
        assert_eq!(ns.pool_name, root.pool_name);
        assert!(!ns.is_root_namespace());
        assert!(root.is_root_namespace());
    }

    #[test]
    fn display_includes_namespace_when_set() {
        let root = PoolHandle::new(1, "tank");
        assert_eq!(root.to_string(), "1/tank");
        assert_eq!(root.with_namespace("ns1").to_string(), "1/tank/ns1");
    }
}
