//! Subsystem seams owned by the namespace coordinator.
//!
//! This module defines the traits for the six collaborating subsystems
//! (status watcher, instance replayer, instance watcher, image map, pool
//! watcher, image deleter), the callback traits the coordinator registers
//! with the watchers and the map, and the factory that constructs them.
//!
//! Construction is synchronous; bringing a subsystem online is a separate
//! async `init`, and a subsystem is considered live only between a
//! successful `init` and the completion of `shut_down`.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::throttle::Throttler;
use crate::types::{GlobalImageId, ImageIds, InstanceId, MirrorUuid, PoolHandle};

/// Publishes and observes aggregate mirroring status for the namespace.
#[async_trait]
pub trait StatusWatcher: Send + Sync {
    /// Bring the watcher online.
    async fn init(&self) -> Result<()>;

    /// Tear the watcher down.
    async fn shut_down(&self) -> Result<()>;
}

/// Supervises per-volume replay state machines for images assigned to this
/// instance.
#[async_trait]
pub trait InstanceReplayer: Send + Sync {
    /// Bring the replayer online.
    async fn init(&self) -> Result<()>;

    /// Tear the replayer down, draining in-flight replay state.
    async fn shut_down(&self) -> Result<()>;

    /// Register the remote peer the replayer pulls from.
    fn add_peer(&self, mirror_uuid: &str, pool: &PoolHandle);

    /// Release every per-volume assignment currently held and drain it.
    async fn release_all(&self) -> Result<()>;

    /// Begin replaying assigned volumes.
    fn start(&self);

    /// Stop replaying assigned volumes.
    fn stop(&self);

    /// Restart replay of assigned volumes.
    fn restart(&self);

    /// Flush pending replay work.
    fn flush(&self);

    /// Status snapshot for operator reporting.
    fn status(&self) -> serde_json::Value;
}

/// Publishes this process's instance identity and signals peer instances.
#[async_trait]
pub trait InstanceWatcher: Send + Sync {
    /// Bring the watcher online and publish this instance.
    async fn init(&self) -> Result<()>;

    /// Withdraw this instance and tear the watcher down.
    async fn shut_down(&self) -> Result<()>;

    /// Identity this process publishes for itself within the fleet.
    fn instance_id(&self) -> InstanceId;

    /// Tell `instance_id` to take over replay of `global_image_id`.
    async fn notify_image_acquire(&self, instance_id: &str, global_image_id: &str) -> Result<()>;

    /// Tell `instance_id` to stop replaying `global_image_id`.
    async fn notify_image_release(&self, instance_id: &str, global_image_id: &str) -> Result<()>;

    /// Tell `instance_id` that the peer identified by `mirror_uuid` removed
    /// `global_image_id`.
    async fn notify_peer_image_removed(
        &self,
        instance_id: &str,
        global_image_id: &str,
        mirror_uuid: &str,
    ) -> Result<()>;

    /// This instance became the leader-facing notification endpoint.
    fn handle_acquire_leader(&self);

    /// This instance is no longer the leader-facing endpoint.
    fn handle_release_leader(&self);

    /// Relay of the current leader's instance id.
    fn handle_update_leader(&self, leader_instance_id: &str);
}

/// Assignment layer: maps discovered volumes to live instances and rebalances
/// on topology change. Exists only while this process is leader.
#[async_trait]
pub trait ImageMap: Send + Sync {
    /// Bring the map online.
    async fn init(&self) -> Result<()>;

    /// Tear the map down.
    async fn shut_down(&self) -> Result<()>;

    /// Apply a deduplicated discovery delta from the side identified by
    /// `mirror_uuid`. The map serializes its own mutations.
    async fn update_images(
        &self,
        mirror_uuid: MirrorUuid,
        added: BTreeSet<GlobalImageId>,
        removed: BTreeSet<GlobalImageId>,
    );

    /// Instances joined the fleet; rebalance toward them.
    async fn update_instances_added(&self, instance_ids: &[InstanceId]);

    /// Instances left the fleet; reassign what they held.
    async fn update_instances_removed(&self, instance_ids: &[InstanceId]);
}

/// Watches one pool for mirror-enabled images and reports deltas to its
/// listener.
#[async_trait]
pub trait PoolWatcher: Send + Sync {
    /// Bring the watcher online and deliver the initial image set.
    async fn init(&self) -> Result<()>;

    /// Tear the watcher down.
    async fn shut_down(&self) -> Result<()>;

    /// True once this process has been fenced from the watched cluster.
    fn is_fenced(&self) -> bool;

    /// Number of mirror-enabled images currently known in the pool.
    fn image_count(&self) -> u64;
}

/// Throttled asynchronous deletion queue for mirrored images scheduled for
/// removal. Exists only while this process is leader.
#[async_trait]
pub trait ImageDeleter: Send + Sync {
    /// Bring the deleter online.
    async fn init(&self) -> Result<()>;

    /// Tear the deleter down.
    async fn shut_down(&self) -> Result<()>;

    /// Status snapshot for operator reporting.
    fn status(&self) -> serde_json::Value;
}

// ============================================================================
// Callbacks into the coordinator
// ============================================================================

/// Callback a pool watcher delivers image-existence deltas through.
///
/// A watcher awaits each delivery, so deltas from one watcher arrive in
/// order; deltas from different watchers may interleave.
#[async_trait]
pub trait PoolWatcherListener: Send + Sync {
    /// Images appeared or disappeared on the side identified by
    /// `mirror_uuid`.
    async fn handle_update(&self, mirror_uuid: MirrorUuid, added: ImageIds, removed: ImageIds);
}

/// Callbacks the image map invokes as it changes volume-to-instance
/// assignments.
#[async_trait]
pub trait ImageMapListener: Send + Sync {
    /// `instance_id` should take over replay of `global_image_id`.
    async fn acquire_image(&self, global_image_id: &str, instance_id: &str) -> Result<()>;

    /// `instance_id` should stop replaying `global_image_id`.
    async fn release_image(&self, global_image_id: &str, instance_id: &str) -> Result<()>;

    /// The side identified by `mirror_uuid` permanently removed
    /// `global_image_id`; `instance_id` should drop it.
    async fn remove_image(
        &self,
        mirror_uuid: &str,
        global_image_id: &str,
        instance_id: &str,
    ) -> Result<()>;
}

/// Constructs the coordinator's subsystems.
///
/// Production wiring and the test fleet both live behind this seam; the
/// coordinator decides when each subsystem is created and initialized but
/// not how it is built.
pub trait SubsystemFactory: Send + Sync {
    /// Status watcher for the namespace in `pool`.
    fn create_status_watcher(&self, pool: &PoolHandle) -> Arc<dyn StatusWatcher>;

    /// Instance replayer for the local side.
    fn create_instance_replayer(
        &self,
        pool: &PoolHandle,
        local_mirror_uuid: &str,
    ) -> Arc<dyn InstanceReplayer>;

    /// Instance watcher wired to `replayer`, sharing the fleet-wide sync
    /// throttler.
    fn create_instance_watcher(
        &self,
        pool: &PoolHandle,
        replayer: Arc<dyn InstanceReplayer>,
        sync_throttler: Arc<Throttler>,
    ) -> Arc<dyn InstanceWatcher>;

    /// Image map publishing assignment decisions to `listener`.
    fn create_image_map(
        &self,
        pool: &PoolHandle,
        instance_id: &str,
        listener: Arc<dyn ImageMapListener>,
    ) -> Arc<dyn ImageMap>;

    /// Pool watcher delivering deltas from `pool` to `listener`.
    fn create_pool_watcher(
        &self,
        pool: &PoolHandle,
        listener: Arc<dyn PoolWatcherListener>,
    ) -> Arc<dyn PoolWatcher>;

    /// Image deleter sharing the fleet-wide deletion throttler.
    fn create_image_deleter(
        &self,
        pool: &PoolHandle,
        deletion_throttler: Arc<Throttler>,
    ) -> Arc<dyn ImageDeleter>;
}
