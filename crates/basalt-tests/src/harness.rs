//! Mock subsystem fleet for coordinator tests.
//!
//! Every mock in a fleet shares an append-only [`OpLog`] and a [`FaultPlan`]
//! keyed by `"subsystem.op"` step names, so suites can assert exact lifecycle
//! ordering and inject a failure at any step. [`TestFleet`] wires one
//! coordinator to a full mock fleet with a recording health sink.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use basalt_mirror::error::{MirrorError, Result};
use basalt_mirror::health::{AttributeValue, FleetHealthSink};
use basalt_mirror::replayer::{NamespaceReplayer, NamespaceReplayerConfig};
use basalt_mirror::subsystems::{
    ImageDeleter, ImageMap, ImageMapListener, InstanceReplayer, InstanceWatcher, PoolWatcher,
    PoolWatcherListener, StatusWatcher, SubsystemFactory,
};
use basalt_mirror::throttle::Throttler;
use basalt_mirror::types::{GlobalImageId, ImageId, ImageIds, InstanceId, MirrorUuid, PoolHandle, PoolId};

/// Pool id the fixture uses for the local cluster.
pub const LOCAL_POOL_ID: PoolId = 1;
/// Pool id the fixture uses for the remote cluster.
pub const REMOTE_POOL_ID: PoolId = 2;
/// Instance id the mock instance watcher publishes.
pub const TEST_INSTANCE_ID: &str = "inst-4100";

/// Opt-in tracing for debugging test runs (`RUST_LOG=debug cargo test`).
/// Idempotent; every fleet calls it.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Image-id set literal: `image_ids(&[("g1", "id-a"), ("g2", "id-b")])`.
pub fn image_ids(pairs: &[(&str, &str)]) -> ImageIds {
    pairs
        .iter()
        .map(|(global, local)| ImageId::new(*global, *local))
        .collect()
}

/// Append-only log of subsystem operations, shared by every mock in a fleet.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl OpLog {
    /// Fresh empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    /// Snapshot of all entries in record order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// True if `entry` was recorded.
    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }

    /// Number of entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Assert `before` was recorded and precedes `after`.
    pub fn assert_order(&self, before: &str, after: &str) {
        let entries = self.entries();
        let b = self
            .position(before)
            .unwrap_or_else(|| panic!("{before} not recorded in {entries:?}"));
        let a = self
            .position(after)
            .unwrap_or_else(|| panic!("{after} not recorded in {entries:?}"));
        assert!(b < a, "{before} did not precede {after} in {entries:?}");
    }
}

/// Failures to inject, keyed by `"subsystem.op"` step name. Each fault fires
/// at most once.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Arc<Mutex<HashMap<String, MirrorError>>>,
}

impl FaultPlan {
    /// Fresh plan with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `step` fail once with `err`.
    pub fn fail(&self, step: &str, err: MirrorError) {
        self.faults.lock().unwrap().insert(step.to_string(), err);
    }

    fn take(&self, step: &str) -> Option<MirrorError> {
        self.faults.lock().unwrap().remove(step)
    }
}

/// Shared plumbing for one mock subsystem: its step name prefix, the fleet
/// log, and the fleet fault plan.
#[derive(Debug, Clone)]
struct MockCore {
    name: &'static str,
    log: OpLog,
    faults: FaultPlan,
}

impl MockCore {
    fn step(&self, op: &str) -> Result<()> {
        self.step_with(op, format!("{}.{}", self.name, op))
    }

    fn step_with(&self, op: &str, entry: String) -> Result<()> {
        self.log.record(entry);
        match self.faults.take(&format!("{}.{}", self.name, op)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn note(&self, op: &str) {
        self.log.record(format!("{}.{}", self.name, op));
    }
}

/// Status watcher mock: records init/shut_down.
pub struct MockStatusWatcher {
    core: MockCore,
}

#[async_trait]
impl StatusWatcher for MockStatusWatcher {
    async fn init(&self) -> Result<()> {
        self.core.step("init")
    }

    async fn shut_down(&self) -> Result<()> {
        self.core.step("shut_down")
    }
}

/// Instance replayer mock: records lifecycle, controls, and peers.
pub struct MockInstanceReplayer {
    core: MockCore,
    peers: Mutex<Vec<(MirrorUuid, PoolHandle)>>,
}

impl MockInstanceReplayer {
    /// Peers registered through `add_peer`, in registration order.
    pub fn peers(&self) -> Vec<(MirrorUuid, PoolHandle)> {
        self.peers.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceReplayer for MockInstanceReplayer {
    async fn init(&self) -> Result<()> {
        self.core.step("init")
    }

    async fn shut_down(&self) -> Result<()> {
        self.core.step("shut_down")
    }

    fn add_peer(&self, mirror_uuid: &str, pool: &PoolHandle) {
        self.core.note(&format!("add_peer:{mirror_uuid}"));
        self.peers
            .lock()
            .unwrap()
            .push((mirror_uuid.to_string(), pool.clone()));
    }

    async fn release_all(&self) -> Result<()> {
        self.core.step("release_all")
    }

    fn start(&self) {
        self.core.note("start");
    }

    fn stop(&self) {
        self.core.note("stop");
    }

    fn restart(&self) {
        self.core.note("restart");
    }

    fn flush(&self) {
        self.core.note("flush");
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({ "state": "idle", "peers": self.peers.lock().unwrap().len() })
    }
}

/// Instance watcher mock: records notifies and leadership relays.
pub struct MockInstanceWatcher {
    core: MockCore,
    instance_id: InstanceId,
}

#[async_trait]
impl InstanceWatcher for MockInstanceWatcher {
    async fn init(&self) -> Result<()> {
        self.core.step("init")
    }

    async fn shut_down(&self) -> Result<()> {
        self.core.step("shut_down")
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id.clone()
    }

    async fn notify_image_acquire(&self, instance_id: &str, global_image_id: &str) -> Result<()> {
        self.core.step_with(
            "notify_image_acquire",
            format!(
                "{}.notify_image_acquire:{instance_id}:{global_image_id}",
                self.core.name
            ),
        )
    }

    async fn notify_image_release(&self, instance_id: &str, global_image_id: &str) -> Result<()> {
        self.core.step_with(
            "notify_image_release",
            format!(
                "{}.notify_image_release:{instance_id}:{global_image_id}",
                self.core.name
            ),
        )
    }

    async fn notify_peer_image_removed(
        &self,
        instance_id: &str,
        global_image_id: &str,
        mirror_uuid: &str,
    ) -> Result<()> {
        self.core.step_with(
            "notify_peer_image_removed",
            format!(
                "{}.notify_peer_image_removed:{instance_id}:{global_image_id}:{mirror_uuid}",
                self.core.name
            ),
        )
    }

    fn handle_acquire_leader(&self) {
        self.core.note("handle_acquire_leader");
    }

    fn handle_release_leader(&self) {
        self.core.note("handle_release_leader");
    }

    fn handle_update_leader(&self, leader_instance_id: &str) {
        self.core
            .note(&format!("handle_update_leader:{leader_instance_id}"));
    }
}

/// Image map mock: records lifecycle and structured update calls.
pub struct MockImageMap {
    core: MockCore,
    listener: Arc<dyn ImageMapListener>,
    updates: Mutex<Vec<(MirrorUuid, BTreeSet<GlobalImageId>, BTreeSet<GlobalImageId>)>>,
    instances_added: Mutex<Vec<Vec<InstanceId>>>,
    instances_removed: Mutex<Vec<Vec<InstanceId>>>,
}

impl MockImageMap {
    /// The assignment listener the coordinator registered.
    pub fn listener(&self) -> Arc<dyn ImageMapListener> {
        Arc::clone(&self.listener)
    }

    /// `update_images` calls in delivery order.
    pub fn updates(&self) -> Vec<(MirrorUuid, BTreeSet<GlobalImageId>, BTreeSet<GlobalImageId>)> {
        self.updates.lock().unwrap().clone()
    }

    /// `update_instances_added` batches in delivery order.
    pub fn instances_added(&self) -> Vec<Vec<InstanceId>> {
        self.instances_added.lock().unwrap().clone()
    }

    /// `update_instances_removed` batches in delivery order.
    pub fn instances_removed(&self) -> Vec<Vec<InstanceId>> {
        self.instances_removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageMap for MockImageMap {
    async fn init(&self) -> Result<()> {
        self.core.step("init")
    }

    async fn shut_down(&self) -> Result<()> {
        self.core.step("shut_down")
    }

    async fn update_images(
        &self,
        mirror_uuid: MirrorUuid,
        added: BTreeSet<GlobalImageId>,
        removed: BTreeSet<GlobalImageId>,
    ) {
        self.core.note("update_images");
        self.updates
            .lock()
            .unwrap()
            .push((mirror_uuid, added, removed));
    }

    async fn update_instances_added(&self, instance_ids: &[InstanceId]) {
        self.core.note("update_instances_added");
        self.instances_added
            .lock()
            .unwrap()
            .push(instance_ids.to_vec());
    }

    async fn update_instances_removed(&self, instance_ids: &[InstanceId]) {
        self.core.note("update_instances_removed");
        self.instances_removed
            .lock()
            .unwrap()
            .push(instance_ids.to_vec());
    }
}

/// Pool watcher mock: settable fenced flag and image count, plus a `deliver`
/// helper that pushes a delta through the listener the coordinator
/// registered, the way the production watcher would.
pub struct MockPoolWatcher {
    core: MockCore,
    listener: Arc<dyn PoolWatcherListener>,
    fenced: AtomicBool,
    images: AtomicU64,
}

impl MockPoolWatcher {
    /// Flip the fenced flag.
    pub fn set_fenced(&self, fenced: bool) {
        self.fenced.store(fenced, Ordering::SeqCst);
    }

    /// Set the image count `image_count` reports.
    pub fn set_image_count(&self, count: u64) {
        self.images.store(count, Ordering::SeqCst);
    }

    /// Deliver a discovery delta through the registered listener.
    pub async fn deliver(&self, mirror_uuid: &str, added: ImageIds, removed: ImageIds) {
        self.listener
            .handle_update(mirror_uuid.to_string(), added, removed)
            .await;
    }
}

#[async_trait]
impl PoolWatcher for MockPoolWatcher {
    async fn init(&self) -> Result<()> {
        self.core.step("init")
    }

    async fn shut_down(&self) -> Result<()> {
        self.core.step("shut_down")
    }

    fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    fn image_count(&self) -> u64 {
        self.images.load(Ordering::SeqCst)
    }
}

/// Image deleter mock: records lifecycle.
pub struct MockImageDeleter {
    core: MockCore,
}

#[async_trait]
impl ImageDeleter for MockImageDeleter {
    async fn init(&self) -> Result<()> {
        self.core.step("init")
    }

    async fn shut_down(&self) -> Result<()> {
        self.core.step("shut_down")
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({ "queued_deletions": 0 })
    }
}

#[derive(Default)]
struct Created {
    instance_replayer: Option<Arc<MockInstanceReplayer>>,
    instance_watcher: Option<Arc<MockInstanceWatcher>>,
    image_maps: Vec<Arc<MockImageMap>>,
    local_pool_watchers: Vec<Arc<MockPoolWatcher>>,
    remote_pool_watchers: Vec<Arc<MockPoolWatcher>>,
    image_deleters: Vec<Arc<MockImageDeleter>>,
    watcher_throttler: Option<Arc<Throttler>>,
    deleter_throttler: Option<Arc<Throttler>>,
}

/// Factory producing the mock fleet. Keeps every subsystem it creates so
/// tests can reach the mocks after the coordinator has taken ownership.
pub struct MockFactory {
    log: OpLog,
    faults: FaultPlan,
    local_pool_id: PoolId,
    instance_id: InstanceId,
    created: Mutex<Created>,
}

impl MockFactory {
    /// Factory recording into `log` and failing per `faults`.
    pub fn new(log: OpLog, faults: FaultPlan, local_pool_id: PoolId, instance_id: &str) -> Self {
        Self {
            log,
            faults,
            local_pool_id,
            instance_id: instance_id.to_string(),
            created: Mutex::new(Created::default()),
        }
    }

    fn core(&self, name: &'static str) -> MockCore {
        MockCore {
            name,
            log: self.log.clone(),
            faults: self.faults.clone(),
        }
    }

    /// The instance replayer, once created.
    pub fn instance_replayer(&self) -> Arc<MockInstanceReplayer> {
        self.created
            .lock()
            .unwrap()
            .instance_replayer
            .clone()
            .expect("instance replayer not created")
    }

    /// The instance watcher, once created.
    pub fn instance_watcher(&self) -> Arc<MockInstanceWatcher> {
        self.created
            .lock()
            .unwrap()
            .instance_watcher
            .clone()
            .expect("instance watcher not created")
    }

    /// The image map from the most recent leadership acquisition.
    pub fn image_map(&self) -> Arc<MockImageMap> {
        self.created
            .lock()
            .unwrap()
            .image_maps
            .last()
            .cloned()
            .expect("image map not created")
    }

    /// The local pool watcher from the most recent acquisition.
    pub fn local_pool_watcher(&self) -> Arc<MockPoolWatcher> {
        self.created
            .lock()
            .unwrap()
            .local_pool_watchers
            .last()
            .cloned()
            .expect("local pool watcher not created")
    }

    /// The remote pool watcher from the most recent acquisition.
    pub fn remote_pool_watcher(&self) -> Arc<MockPoolWatcher> {
        self.created
            .lock()
            .unwrap()
            .remote_pool_watchers
            .last()
            .cloned()
            .expect("remote pool watcher not created")
    }

    /// The image deleter from the most recent acquisition.
    pub fn image_deleter(&self) -> Arc<MockImageDeleter> {
        self.created
            .lock()
            .unwrap()
            .image_deleters
            .last()
            .cloned()
            .expect("image deleter not created")
    }

    /// Number of image maps created across all acquisitions.
    pub fn image_maps_created(&self) -> usize {
        self.created.lock().unwrap().image_maps.len()
    }

    /// Throttler the instance watcher was created with.
    pub fn watcher_throttler(&self) -> Arc<Throttler> {
        self.created
            .lock()
            .unwrap()
            .watcher_throttler
            .clone()
            .expect("instance watcher not created")
    }

    /// Throttler the image deleter was created with.
    pub fn deleter_throttler(&self) -> Arc<Throttler> {
        self.created
            .lock()
            .unwrap()
            .deleter_throttler
            .clone()
            .expect("image deleter not created")
    }
}

impl SubsystemFactory for MockFactory {
    fn create_status_watcher(&self, _pool: &PoolHandle) -> Arc<dyn StatusWatcher> {
        Arc::new(MockStatusWatcher {
            core: self.core("status_watcher"),
        })
    }

    fn create_instance_replayer(
        &self,
        _pool: &PoolHandle,
        _local_mirror_uuid: &str,
    ) -> Arc<dyn InstanceReplayer> {
        let replayer = Arc::new(MockInstanceReplayer {
            core: self.core("instance_replayer"),
            peers: Mutex::new(Vec::new()),
        });
        self.created.lock().unwrap().instance_replayer = Some(Arc::clone(&replayer));
        replayer
    }

    fn create_instance_watcher(
        &self,
        _pool: &PoolHandle,
        _replayer: Arc<dyn InstanceReplayer>,
        sync_throttler: Arc<Throttler>,
    ) -> Arc<dyn InstanceWatcher> {
        let watcher = Arc::new(MockInstanceWatcher {
            core: self.core("instance_watcher"),
            instance_id: self.instance_id.clone(),
        });
        let mut created = self.created.lock().unwrap();
        created.instance_watcher = Some(Arc::clone(&watcher));
        created.watcher_throttler = Some(sync_throttler);
        watcher
    }

    fn create_image_map(
        &self,
        _pool: &PoolHandle,
        _instance_id: &str,
        listener: Arc<dyn ImageMapListener>,
    ) -> Arc<dyn ImageMap> {
        let map = Arc::new(MockImageMap {
            core: self.core("image_map"),
            listener,
            updates: Mutex::new(Vec::new()),
            instances_added: Mutex::new(Vec::new()),
            instances_removed: Mutex::new(Vec::new()),
        });
        self.created.lock().unwrap().image_maps.push(Arc::clone(&map));
        map
    }

    fn create_pool_watcher(
        &self,
        pool: &PoolHandle,
        listener: Arc<dyn PoolWatcherListener>,
    ) -> Arc<dyn PoolWatcher> {
        let local = pool.pool_id == self.local_pool_id;
        let watcher = Arc::new(MockPoolWatcher {
            core: self.core(if local {
                "local_pool_watcher"
            } else {
                "remote_pool_watcher"
            }),
            listener,
            fenced: AtomicBool::new(false),
            images: AtomicU64::new(0),
        });
        let mut created = self.created.lock().unwrap();
        if local {
            created.local_pool_watchers.push(Arc::clone(&watcher));
        } else {
            created.remote_pool_watchers.push(Arc::clone(&watcher));
        }
        watcher
    }

    fn create_image_deleter(
        &self,
        _pool: &PoolHandle,
        deletion_throttler: Arc<Throttler>,
    ) -> Arc<dyn ImageDeleter> {
        let deleter = Arc::new(MockImageDeleter {
            core: self.core("image_deleter"),
        });
        let mut created = self.created.lock().unwrap();
        created.image_deleters.push(Arc::clone(&deleter));
        created.deleter_throttler = Some(deletion_throttler);
        deleter
    }
}

/// Recording fleet-health sink.
#[derive(Debug, Default)]
pub struct MockSink {
    attributes: Mutex<Vec<(PoolId, String, AttributeValue)>>,
}

impl MockSink {
    /// Fresh empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded `(pool_id, key, value)` triple, in arrival order.
    pub fn recorded(&self) -> Vec<(PoolId, String, AttributeValue)> {
        self.attributes.lock().unwrap().clone()
    }

    /// Most recent value recorded under `key`, if any.
    pub fn latest(&self, key: &str) -> Option<AttributeValue> {
        self.attributes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, k, _)| k == key)
            .map(|(_, _, v)| v.clone())
    }
}

impl FleetHealthSink for MockSink {
    fn add_or_update_attribute(&self, pool_id: PoolId, key: &str, value: AttributeValue) {
        self.attributes
            .lock()
            .unwrap()
            .push((pool_id, key.to_string(), value));
    }
}

/// One coordinator wired to a full mock fleet.
pub struct TestFleet {
    /// The coordinator under test.
    pub replayer: NamespaceReplayer,
    /// Factory holding every mock the coordinator created.
    pub factory: Arc<MockFactory>,
    /// Recording health sink.
    pub sink: Arc<MockSink>,
    /// Fleet-wide operation log.
    pub log: OpLog,
    /// Fleet-wide fault plan.
    pub faults: FaultPlan,
    /// Mirror uuid of the local side.
    pub local_mirror_uuid: String,
    /// Mirror uuid of the remote side.
    pub remote_mirror_uuid: String,
}

impl TestFleet {
    /// Fleet on the pools' root namespace.
    pub fn new() -> Self {
        Self::for_namespace("")
    }

    /// Fleet on a named sub-namespace.
    pub fn for_namespace(namespace: &str) -> Self {
        init_tracing();
        let log = OpLog::new();
        let faults = FaultPlan::new();
        let factory = Arc::new(MockFactory::new(
            log.clone(),
            faults.clone(),
            LOCAL_POOL_ID,
            TEST_INSTANCE_ID,
        ));
        let sink = Arc::new(MockSink::new());
        let local_mirror_uuid = Uuid::new_v4().to_string();
        let remote_mirror_uuid = Uuid::new_v4().to_string();

        let config = NamespaceReplayerConfig {
            namespace: namespace.to_string(),
            local_pool: PoolHandle::new(LOCAL_POOL_ID, "tank"),
            remote_pool: PoolHandle::new(REMOTE_POOL_ID, "tank-dr"),
            local_mirror_uuid: local_mirror_uuid.clone(),
            remote_mirror_uuid: remote_mirror_uuid.clone(),
        };
        let replayer = NamespaceReplayer::new(
            config,
            Arc::clone(&factory) as Arc<dyn SubsystemFactory>,
            Arc::new(Throttler::with_limit(4)),
            Arc::new(Throttler::with_limit(2)),
            Arc::clone(&sink) as Arc<dyn FleetHealthSink>,
        );

        Self {
            replayer,
            factory,
            sink,
            log,
            faults,
            local_mirror_uuid,
            remote_mirror_uuid,
        }
    }

    /// Run `init`, expecting success.
    pub async fn init(&self) {
        self.replayer.init().await.expect("init failed");
    }

    /// Run `init` and `handle_acquire_leader`, expecting success.
    pub async fn lead(&self) {
        self.init().await;
        self.replayer
            .handle_acquire_leader()
            .await
            .expect("leader acquisition failed");
    }
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}
