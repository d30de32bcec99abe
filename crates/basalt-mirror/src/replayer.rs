//! Per-namespace replication coordinator.
//!
//! `NamespaceReplayer` owns one instance of each collaborating subsystem
//! (status watcher, instance replayer, instance watcher, image map, two pool
//! watchers, image deleter) and drives them through strictly-ordered async
//! lifecycle sequences. The leader-election collaborator calls the
//! `handle_acquire_leader`/`handle_release_leader` entry points; pool
//! watchers and the image map call back in through listener adapters.
//!
//! All slot and state transitions happen under one `std::sync::Mutex` that is
//! never held across an await: each step clones the handles it needs out of
//! the slots, drops the guard, then awaits the subsystem.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{MirrorError, Result};
use crate::health::{self, AttributeValue, FleetHealthSink};
use crate::subsystems::{
    ImageDeleter, ImageMap, ImageMapListener, InstanceReplayer, InstanceWatcher, PoolWatcher,
    PoolWatcherListener, StatusWatcher, SubsystemFactory,
};
use crate::throttle::Throttler;
use crate::types::{GlobalImageId, ImageIds, InstanceId, MirrorUuid, PoolHandle};

/// Identity of one namespace coordinator.
///
/// The pool handles are duplicated and narrowed to `namespace` at
/// construction; callers keep their own copies.
#[derive(Debug, Clone)]
pub struct NamespaceReplayerConfig {
    /// Namespace to replicate; empty selects the pools' root namespace.
    pub namespace: String,
    /// Local pool the namespace lives in.
    pub local_pool: PoolHandle,
    /// Remote pool the namespace is mirrored to.
    pub remote_pool: PoolHandle,
    /// Mirror uuid of the local side.
    pub local_mirror_uuid: MirrorUuid,
    /// Mirror uuid of the remote side.
    pub remote_mirror_uuid: MirrorUuid,
}

/// Lifecycle state of a coordinator.
///
/// `Stopped`, `Running`, and `Leading` are the rest states; the others mark a
/// sequence in flight. At most one sequence runs at a time, enforced by the
/// entry assertions of each lifecycle method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayerState {
    /// No subsystems initialized.
    Stopped,
    /// Base init sequence in flight.
    Initializing,
    /// Base subsystems live; not leader.
    Running,
    /// Leadership acquisition in flight.
    AcquiringLeader,
    /// Leader-role subsystems live.
    Leading,
    /// Leadership release in flight.
    ReleasingLeader,
    /// Full teardown in flight.
    ShuttingDown,
}

/// Point-in-time status document for one namespace.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStatus {
    /// Namespace the coordinator replicates.
    pub namespace: String,
    /// Instance replayer status; absent until `init` completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_replayer: Option<serde_json::Value>,
    /// Image deleter status; present only while leader.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_deleter: Option<serde_json::Value>,
}

/// Subsystem ownership slots. A populated slot is the sole evidence that the
/// subsystem is initialized; slots are populated only after a successful
/// `init`, so a subsystem that failed to come up is dropped, never shut down.
struct Slots {
    state: ReplayerState,
    status_watcher: Option<Arc<dyn StatusWatcher>>,
    instance_replayer: Option<Arc<dyn InstanceReplayer>>,
    instance_watcher: Option<Arc<dyn InstanceWatcher>>,
    image_map: Option<Arc<dyn ImageMap>>,
    local_pool_watcher: Option<Arc<dyn PoolWatcher>>,
    remote_pool_watcher: Option<Arc<dyn PoolWatcher>>,
    image_deleter: Option<Arc<dyn ImageDeleter>>,
}

impl Slots {
    fn new() -> Self {
        Self {
            state: ReplayerState::Stopped,
            status_watcher: None,
            instance_replayer: None,
            instance_watcher: None,
            image_map: None,
            local_pool_watcher: None,
            remote_pool_watcher: None,
            image_deleter: None,
        }
    }
}

struct Inner {
    config: NamespaceReplayerConfig,
    factory: Arc<dyn SubsystemFactory>,
    sync_throttler: Arc<Throttler>,
    deletion_throttler: Arc<Throttler>,
    health_sink: Arc<dyn FleetHealthSink>,
    slots: Mutex<Slots>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap()
    }
}

/// Handle to one per-namespace replication coordinator.
///
/// Cheap to clone; all clones share the same state. The constructor wires
/// nothing up — `init` brings the base subsystems online, and the election
/// collaborator drives the leader role from there.
#[derive(Clone)]
pub struct NamespaceReplayer {
    inner: Arc<Inner>,
}

impl NamespaceReplayer {
    /// Create a coordinator for `config.namespace`.
    ///
    /// The throttlers and health sink are process-wide collaborators shared
    /// with every other namespace coordinator.
    pub fn new(
        config: NamespaceReplayerConfig,
        factory: Arc<dyn SubsystemFactory>,
        sync_throttler: Arc<Throttler>,
        deletion_throttler: Arc<Throttler>,
        health_sink: Arc<dyn FleetHealthSink>,
    ) -> Self {
        let local_pool = config.local_pool.with_namespace(config.namespace.clone());
        let remote_pool = config.remote_pool.with_namespace(config.namespace.clone());
        let config = NamespaceReplayerConfig {
            local_pool,
            remote_pool,
            ..config
        };
        debug!("created namespace replayer for {}", config.local_pool);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                sync_throttler,
                deletion_throttler,
                health_sink,
                slots: Mutex::new(Slots::new()),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Namespace this coordinator replicates.
    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplayerState {
        self.inner.slots().state
    }

    /// True while this process holds the leader role for the namespace:
    /// image map, both pool watchers, and image deleter are all live.
    pub fn is_leader(&self) -> bool {
        let slots = self.inner.slots();
        slots.image_map.is_some()
            && slots.local_pool_watcher.is_some()
            && slots.remote_pool_watcher.is_some()
            && slots.image_deleter.is_some()
    }

    /// True once either pool watcher reports this process fenced from its
    /// cluster. Not an error: the enclosing coordinator polls this and
    /// relinquishes leadership externally.
    pub fn is_fenced(&self) -> bool {
        let slots = self.inner.slots();
        slots
            .local_pool_watcher
            .as_ref()
            .map_or(false, |w| w.is_fenced())
            || slots
                .remote_pool_watcher
                .as_ref()
                .map_or(false, |w| w.is_fenced())
    }

    /// Bring the base (non-leader) subsystems online.
    ///
    /// Order: status watcher, instance replayer (the remote peer is
    /// registered once it is up), instance watcher. On a step failure the
    /// subsystems that had come up are unwound in reverse order and the
    /// failing step's error is returned; unwind errors are logged and
    /// dropped. On success the published instance id goes to the
    /// fleet-health sink (root namespace only).
    pub async fn init(&self) -> Result<()> {
        self.begin_sequence(
            &[ReplayerState::Stopped],
            ReplayerState::Initializing,
            "init",
        );
        debug!(
            "initializing namespace replayer for {}",
            self.inner.config.local_pool
        );

        let status_watcher = self
            .inner
            .factory
            .create_status_watcher(&self.inner.config.local_pool);
        if let Err(err) = status_watcher.init().await {
            error!("error initializing mirror status watcher: {err}");
            self.finish_sequence(ReplayerState::Stopped);
            return Err(err);
        }
        self.inner.slots().status_watcher = Some(status_watcher);

        let replayer = self.inner.factory.create_instance_replayer(
            &self.inner.config.local_pool,
            &self.inner.config.local_mirror_uuid,
        );
        if let Err(err) = replayer.init().await {
            error!("error initializing instance replayer: {err}");
            let mut first = Some(err.clone());
            self.tear_down_base(&mut first).await;
            self.finish_sequence(ReplayerState::Stopped);
            return Err(err);
        }
        replayer.add_peer(
            &self.inner.config.remote_mirror_uuid,
            &self.inner.config.remote_pool,
        );
        self.inner.slots().instance_replayer = Some(Arc::clone(&replayer));

        let instance_watcher = self.inner.factory.create_instance_watcher(
            &self.inner.config.local_pool,
            replayer,
            Arc::clone(&self.inner.sync_throttler),
        );
        if let Err(err) = instance_watcher.init().await {
            error!("error initializing instance watcher: {err}");
            let mut first = Some(err.clone());
            self.tear_down_base(&mut first).await;
            self.finish_sequence(ReplayerState::Stopped);
            return Err(err);
        }
        let instance_id = instance_watcher.instance_id();
        self.inner.slots().instance_watcher = Some(instance_watcher);

        // TODO: publish per-namespace attributes once the sink schema gains
        // a namespace dimension.
        if self.inner.config.local_pool.is_root_namespace() {
            self.inner.health_sink.add_or_update_attribute(
                self.inner.config.local_pool.pool_id,
                health::INSTANCE_ID_KEY,
                AttributeValue::Str(instance_id),
            );
        }

        self.finish_sequence(ReplayerState::Running);
        info!(
            "namespace replayer up for {}",
            self.inner.config.local_pool
        );
        Ok(())
    }

    /// Tear everything down, releasing the leader role first when held.
    ///
    /// The release chain and base teardown share one first-error
    /// accumulator, so the returned error is the first failure anywhere in
    /// the sequence; later failures are logged and dropped.
    pub async fn shut_down(&self) -> Result<()> {
        self.begin_sequence(
            &[ReplayerState::Running, ReplayerState::Leading],
            ReplayerState::ShuttingDown,
            "shut_down",
        );
        debug!(
            "shutting down namespace replayer for {}",
            self.inner.config.local_pool
        );

        let mut first = None;

        let releasing = self.inner.slots().image_map.is_some();
        if releasing {
            let instance_watcher = self
                .inner
                .slots()
                .instance_watcher
                .clone()
                .expect("instance watcher not initialized");
            instance_watcher.handle_release_leader();
            self.release_leader_subsystems(&mut first).await;
        }

        self.tear_down_base(&mut first).await;

        {
            let mut slots = self.inner.slots();
            debug_assert!(slots.image_map.is_none());
            debug_assert!(slots.image_deleter.is_none());
            debug_assert!(slots.local_pool_watcher.is_none());
            debug_assert!(slots.remote_pool_watcher.is_none());
            debug_assert!(slots.instance_watcher.is_none());
            debug_assert!(slots.instance_replayer.is_none());
            debug_assert!(slots.status_watcher.is_none());
            slots.state = ReplayerState::Stopped;
        }
        info!(
            "namespace replayer down for {}",
            self.inner.config.local_pool
        );
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Take the leader role for this namespace.
    ///
    /// Notifies the instance watcher synchronously, then brings up, in
    /// order: image map, local pool watcher, remote pool watcher, image
    /// deleter. A `NotConfigured` failure from the remote watcher is benign:
    /// the watcher stays registered and reports images once the remote side
    /// enables mirroring. Any other failure unwinds the leader subsystems
    /// that had come up and returns that step's error.
    pub async fn handle_acquire_leader(&self) -> Result<()> {
        self.begin_sequence(
            &[ReplayerState::Running],
            ReplayerState::AcquiringLeader,
            "handle_acquire_leader",
        );
        info!(
            "acquiring leader role for {}",
            self.inner.config.local_pool
        );

        let instance_watcher = self
            .inner
            .slots()
            .instance_watcher
            .clone()
            .expect("instance watcher not initialized");
        instance_watcher.handle_acquire_leader();
        let instance_id = instance_watcher.instance_id();

        let listener: Arc<dyn ImageMapListener> = Arc::new(MapAssignments {
            inner: Arc::downgrade(&self.inner),
        });
        let image_map = self.inner.factory.create_image_map(
            &self.inner.config.local_pool,
            &instance_id,
            listener,
        );
        debug!("initializing image map");
        if let Err(err) = image_map.init().await {
            error!("failed to init image map: {err}");
            return Err(self.abort_acquire(err).await);
        }
        self.inner.slots().image_map = Some(image_map);

        // Fresh local watcher on every acquisition, so the initial image
        // set is current for the new role.
        let listener: Arc<dyn PoolWatcherListener> = Arc::new(WatcherUpdates {
            inner: Arc::downgrade(&self.inner),
        });
        let local_watcher = self
            .inner
            .factory
            .create_pool_watcher(&self.inner.config.local_pool, listener);
        debug!("initializing local pool watcher");
        if let Err(err) = local_watcher.init().await {
            error!("failed to retrieve local images: {err}");
            return Err(self.abort_acquire(err).await);
        }
        self.inner.slots().local_pool_watcher = Some(local_watcher);

        let listener: Arc<dyn PoolWatcherListener> = Arc::new(WatcherUpdates {
            inner: Arc::downgrade(&self.inner),
        });
        let remote_watcher = self
            .inner
            .factory
            .create_pool_watcher(&self.inner.config.remote_pool, listener);
        debug!("initializing remote pool watcher");
        match remote_watcher.init().await {
            Ok(()) => {}
            Err(err) if err.is_not_configured() => {
                // The watcher stays registered and starts reporting images
                // once the remote side enables mirroring.
                info!("remote peer does not have mirroring configured");
            }
            Err(err) => {
                error!("failed to retrieve remote images: {err}");
                return Err(self.abort_acquire(err).await);
            }
        }
        self.inner.slots().remote_pool_watcher = Some(remote_watcher);

        let image_deleter = self.inner.factory.create_image_deleter(
            &self.inner.config.local_pool,
            Arc::clone(&self.inner.deletion_throttler),
        );
        debug!("initializing image deleter");
        if let Err(err) = image_deleter.init().await {
            error!("failed to init image deleter: {err}");
            return Err(self.abort_acquire(err).await);
        }
        self.inner.slots().image_deleter = Some(image_deleter);

        self.finish_sequence(ReplayerState::Leading);
        info!("acquired leader role for {}", self.inner.config.local_pool);
        Ok(())
    }

    /// Give up the leader role for this namespace.
    ///
    /// Notifies the instance watcher synchronously, then tears down in
    /// strict reverse of acquisition: image deleter, both pool watchers (in
    /// parallel), image map, and finally releases every per-volume
    /// assignment the replayer holds. Accepted while merely `Running` too,
    /// where it degenerates to the watcher notification — that is how the
    /// election collaborator cancels after a failed acquisition.
    pub async fn handle_release_leader(&self) -> Result<()> {
        self.begin_sequence(
            &[ReplayerState::Running, ReplayerState::Leading],
            ReplayerState::ReleasingLeader,
            "handle_release_leader",
        );
        info!("releasing leader role for {}", self.inner.config.local_pool);

        let instance_watcher = self
            .inner
            .slots()
            .instance_watcher
            .clone()
            .expect("instance watcher not initialized");
        instance_watcher.handle_release_leader();

        let mut first = None;
        self.release_leader_subsystems(&mut first).await;
        self.finish_sequence(ReplayerState::Running);
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Relay the current leader's instance id to the instance watcher.
    pub fn handle_update_leader(&self, leader_instance_id: &str) {
        debug!("leader_instance_id={leader_instance_id}");
        let instance_watcher = self
            .inner
            .slots()
            .instance_watcher
            .clone()
            .expect("instance watcher not initialized");
        instance_watcher.handle_update_leader(leader_instance_id);
    }

    /// Apply a discovery delta from one pool watcher.
    ///
    /// No-op while not leader: discovery callbacks race harmlessly with
    /// leadership loss. While leader, current image counts go to the
    /// fleet-health sink (root namespace only) and the delta, reduced to
    /// deduplicated global-id sets, is forwarded to the image map.
    pub async fn handle_update(&self, mirror_uuid: MirrorUuid, added: ImageIds, removed: ImageIds) {
        let image_map = {
            let slots = self.inner.slots();
            let Some(image_map) = slots.image_map.clone() else {
                debug!("not leader");
                return;
            };

            debug!(
                "mirror_uuid={mirror_uuid}, added_count={}, removed_count={}",
                added.len(),
                removed.len()
            );

            // TODO: publish per-namespace attributes once the sink schema
            // gains a namespace dimension.
            if self.inner.config.local_pool.is_root_namespace() {
                let local = slots
                    .local_pool_watcher
                    .as_ref()
                    .expect("local pool watcher not initialized");
                self.inner.health_sink.add_or_update_attribute(
                    self.inner.config.local_pool.pool_id,
                    health::IMAGE_LOCAL_COUNT_KEY,
                    AttributeValue::U64(local.image_count()),
                );
                if let Some(remote) = slots.remote_pool_watcher.as_ref() {
                    self.inner.health_sink.add_or_update_attribute(
                        self.inner.config.local_pool.pool_id,
                        health::IMAGE_REMOTE_COUNT_KEY,
                        AttributeValue::U64(remote.image_count()),
                    );
                }
            }
            image_map
        };

        let added = global_ids(&added);
        let removed = global_ids(&removed);
        image_map.update_images(mirror_uuid, added, removed).await;
    }

    /// Forward fleet joins to the image map for rebalancing. Leader only;
    /// receiving this while not leader is a caller contract violation.
    pub async fn handle_instances_added(&self, instance_ids: &[InstanceId]) {
        debug!("instance_ids={instance_ids:?}");
        let image_map = self
            .inner
            .slots()
            .image_map
            .clone()
            .expect("image map not initialized; topology updates are leader-only");
        image_map.update_instances_added(instance_ids).await;
    }

    /// Forward fleet departures to the image map for reassignment. Leader
    /// only; receiving this while not leader is a caller contract violation.
    pub async fn handle_instances_removed(&self, instance_ids: &[InstanceId]) {
        debug!("instance_ids={instance_ids:?}");
        let image_map = self
            .inner
            .slots()
            .image_map
            .clone()
            .expect("image map not initialized; topology updates are leader-only");
        image_map.update_instances_removed(instance_ids).await;
    }

    /// Tell `instance_id` to take over replay of `global_image_id`. The
    /// instance watcher's own result is passed through untouched.
    pub async fn handle_acquire_image(
        &self,
        global_image_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        debug!("global_image_id={global_image_id}, instance_id={instance_id}");
        let instance_watcher = self
            .inner
            .slots()
            .instance_watcher
            .clone()
            .expect("instance watcher not initialized");
        instance_watcher
            .notify_image_acquire(instance_id, global_image_id)
            .await
    }

    /// Tell `instance_id` to stop replaying `global_image_id`.
    pub async fn handle_release_image(
        &self,
        global_image_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        debug!("global_image_id={global_image_id}, instance_id={instance_id}");
        let instance_watcher = self
            .inner
            .slots()
            .instance_watcher
            .clone()
            .expect("instance watcher not initialized");
        instance_watcher
            .notify_image_release(instance_id, global_image_id)
            .await
    }

    /// Tell `instance_id` that the peer identified by `mirror_uuid` removed
    /// `global_image_id`. `mirror_uuid` must be non-empty — it names the
    /// side that originated the removal.
    pub async fn handle_remove_image(
        &self,
        mirror_uuid: &str,
        global_image_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        assert!(
            !mirror_uuid.is_empty(),
            "remove notifications must identify the originating mirror uuid"
        );
        debug!(
            "mirror_uuid={mirror_uuid}, global_image_id={global_image_id}, \
             instance_id={instance_id}"
        );
        let instance_watcher = self
            .inner
            .slots()
            .instance_watcher
            .clone()
            .expect("instance watcher not initialized");
        instance_watcher
            .notify_peer_image_removed(instance_id, global_image_id, mirror_uuid)
            .await
    }

    /// Begin replaying assigned volumes.
    pub fn start(&self) {
        debug!("starting instance replayer");
        self.inner
            .slots()
            .instance_replayer
            .as_ref()
            .expect("instance replayer not initialized")
            .start();
    }

    /// Stop replaying assigned volumes.
    pub fn stop(&self) {
        debug!("stopping instance replayer");
        self.inner
            .slots()
            .instance_replayer
            .as_ref()
            .expect("instance replayer not initialized")
            .stop();
    }

    /// Restart replay of assigned volumes.
    pub fn restart(&self) {
        debug!("restarting instance replayer");
        self.inner
            .slots()
            .instance_replayer
            .as_ref()
            .expect("instance replayer not initialized")
            .restart();
    }

    /// Flush pending replay work.
    pub fn flush(&self) {
        debug!("flushing instance replayer");
        self.inner
            .slots()
            .instance_replayer
            .as_ref()
            .expect("instance replayer not initialized")
            .flush();
    }

    /// Point-in-time status snapshot. Safe to call concurrently with any
    /// transition; absent subsystems yield absent sections.
    pub fn status(&self) -> NamespaceStatus {
        let slots = self.inner.slots();
        NamespaceStatus {
            namespace: self.inner.config.namespace.clone(),
            instance_replayer: slots.instance_replayer.as_ref().map(|r| r.status()),
            image_deleter: slots.image_deleter.as_ref().map(|d| d.status()),
        }
    }

    fn begin_sequence(&self, expected: &[ReplayerState], next: ReplayerState, op: &str) {
        let mut slots = self.inner.slots();
        assert!(
            expected.contains(&slots.state),
            "{op} called in state {:?}; lifecycle sequences may not overlap",
            slots.state
        );
        slots.state = next;
    }

    fn finish_sequence(&self, next: ReplayerState) {
        self.inner.slots().state = next;
    }

    async fn abort_acquire(&self, err: MirrorError) -> MirrorError {
        let mut first = Some(err.clone());
        self.release_leader_subsystems(&mut first).await;
        self.finish_sequence(ReplayerState::Running);
        err
    }

    /// Tear down the leader-only subsystems in reverse acquisition order,
    /// then release the replayer's per-volume assignments. Empty slots are
    /// skipped, so the same chain serves leadership release, acquisition
    /// unwind, and the shutdown prefix.
    async fn release_leader_subsystems(&self, first: &mut Option<MirrorError>) {
        let image_deleter = self.inner.slots().image_deleter.take();
        if let Some(deleter) = image_deleter {
            debug!("shutting down image deleter");
            if let Err(err) = deleter.shut_down().await {
                error!("error shutting image deleter down: {err}");
                fold_first(first, err);
            }
        }

        let (local, remote) = {
            let mut slots = self.inner.slots();
            (
                slots.local_pool_watcher.take(),
                slots.remote_pool_watcher.take(),
            )
        };
        if local.is_some() || remote.is_some() {
            debug!("shutting down pool watchers");
            let (local_res, remote_res) =
                tokio::join!(shut_down_pool_watcher(local), shut_down_pool_watcher(remote));
            if let Some(Err(err)) = local_res {
                error!("error shutting local pool watcher down: {err}");
                fold_first(first, err);
            }
            if let Some(Err(err)) = remote_res {
                error!("error shutting remote pool watcher down: {err}");
                fold_first(first, err);
            }
        }

        let image_map = self.inner.slots().image_map.take();
        if let Some(map) = image_map {
            debug!("shutting down image map");
            match map.shut_down().await {
                Ok(()) => {}
                Err(err @ MirrorError::Fenced { .. }) => {
                    // Expected during fencing, logged below error level.
                    debug!("image map shut down while fenced: {err}");
                    fold_first(first, err);
                }
                Err(err) => {
                    error!("failed to shut down image map: {err}");
                    fold_first(first, err);
                }
            }

            // Assignments are released only once the map has stopped
            // handing them out.
            let replayer = self
                .inner
                .slots()
                .instance_replayer
                .clone()
                .expect("instance replayer not initialized");
            debug!("releasing all image assignments");
            if let Err(err) = replayer.release_all().await {
                error!("error releasing image assignments: {err}");
                fold_first(first, err);
            }
        }
    }

    /// Tear down the base subsystems in reverse init order. Empty slots are
    /// skipped, so the same chain serves init unwind and shutdown.
    async fn tear_down_base(&self, first: &mut Option<MirrorError>) {
        let instance_watcher = self.inner.slots().instance_watcher.take();
        if let Some(watcher) = instance_watcher {
            debug!("shutting down instance watcher");
            if let Err(err) = watcher.shut_down().await {
                error!("error shutting instance watcher down: {err}");
                fold_first(first, err);
            }
        }

        let instance_replayer = self.inner.slots().instance_replayer.take();
        if let Some(replayer) = instance_replayer {
            debug!("shutting down instance replayer");
            if let Err(err) = replayer.shut_down().await {
                error!("error shutting instance replayer down: {err}");
                fold_first(first, err);
            }
        }

        let status_watcher = self.inner.slots().status_watcher.take();
        if let Some(watcher) = status_watcher {
            debug!("shutting down mirror status watcher");
            if let Err(err) = watcher.shut_down().await {
                error!("error shutting mirror status watcher down: {err}");
                fold_first(first, err);
            }
        }
    }
}

impl fmt::Debug for NamespaceReplayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots();
        f.debug_struct("NamespaceReplayer")
            .field("namespace", &self.inner.config.namespace)
            .field("state", &slots.state)
            .finish()
    }
}

async fn shut_down_pool_watcher(watcher: Option<Arc<dyn PoolWatcher>>) -> Option<Result<()>> {
    match watcher {
        Some(watcher) => Some(watcher.shut_down().await),
        None => None,
    }
}

fn fold_first(first: &mut Option<MirrorError>, err: MirrorError) {
    if first.is_none() {
        *first = Some(err);
    }
}

fn global_ids(image_ids: &ImageIds) -> BTreeSet<GlobalImageId> {
    image_ids
        .iter()
        .map(|image_id| image_id.global_id.clone())
        .collect()
}

/// Discovery listener handed to each pool watcher. Holds a weak reference so
/// a dropped coordinator cannot be resurrected by a late delivery.
struct WatcherUpdates {
    inner: Weak<Inner>,
}

#[async_trait]
impl PoolWatcherListener for WatcherUpdates {
    async fn handle_update(&self, mirror_uuid: MirrorUuid, added: ImageIds, removed: ImageIds) {
        let Some(inner) = self.inner.upgrade() else {
            debug!("discovery update after coordinator shutdown");
            return;
        };
        NamespaceReplayer::from_inner(inner)
            .handle_update(mirror_uuid, added, removed)
            .await;
    }
}

/// Assignment listener handed to the image map.
struct MapAssignments {
    inner: Weak<Inner>,
}

#[async_trait]
impl ImageMapListener for MapAssignments {
    async fn acquire_image(&self, global_image_id: &str, instance_id: &str) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(MirrorError::ShuttingDown);
        };
        NamespaceReplayer::from_inner(inner)
            .handle_acquire_image(global_image_id, instance_id)
            .await
    }

    async fn release_image(&self, global_image_id: &str, instance_id: &str) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(MirrorError::ShuttingDown);
        };
        NamespaceReplayer::from_inner(inner)
            .handle_release_image(global_image_id, instance_id)
            .await
    }

    async fn remove_image(
        &self,
        mirror_uuid: &str,
        global_image_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(MirrorError::ShuttingDown);
        };
        NamespaceReplayer::from_inner(inner)
            .handle_remove_image(mirror_uuid, global_image_id, instance_id)
            .await
    }
}
