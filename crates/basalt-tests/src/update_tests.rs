//! Discovery suite: pool-watcher deltas, image-map forwarding, fleet
//! topology changes, and health-sink reporting.

use std::collections::BTreeSet;

use crate::harness::{image_ids, TestFleet, LOCAL_POOL_ID};
use basalt_mirror::health::AttributeValue;

fn globals(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn discovery_delta_reaches_the_image_map() {
    let fleet = TestFleet::new();
    fleet.lead().await;
    fleet.factory.local_pool_watcher().set_image_count(3);
    fleet.factory.remote_pool_watcher().set_image_count(5);
    fleet.log.clear();

    fleet
        .factory
        .local_pool_watcher()
        .deliver(
            &fleet.local_mirror_uuid,
            image_ids(&[("g1", "a"), ("g2", "b")]),
            image_ids(&[]),
        )
        .await;

    assert_eq!(
        fleet.factory.image_map().updates(),
        vec![(
            fleet.local_mirror_uuid.clone(),
            globals(&["g1", "g2"]),
            BTreeSet::new(),
        )]
    );
    assert_eq!(
        fleet.sink.latest("image_local_count"),
        Some(AttributeValue::U64(3))
    );
    assert_eq!(
        fleet.sink.latest("image_remote_count"),
        Some(AttributeValue::U64(5))
    );
    assert!(fleet
        .sink
        .recorded()
        .iter()
        .all(|(pool_id, _, _)| *pool_id == LOCAL_POOL_ID));
}

#[tokio::test]
async fn discovery_reduces_deltas_to_global_identities() {
    let fleet = TestFleet::new();
    fleet.lead().await;

    // Two pool-local ids for the same global identity collapse to one entry.
    fleet
        .factory
        .local_pool_watcher()
        .deliver(
            &fleet.local_mirror_uuid,
            image_ids(&[("g1", "a"), ("g1", "b")]),
            image_ids(&[("g2", "x"), ("g2", "y")]),
        )
        .await;

    assert_eq!(
        fleet.factory.image_map().updates(),
        vec![(
            fleet.local_mirror_uuid.clone(),
            globals(&["g1"]),
            globals(&["g2"]),
        )]
    );
}

#[tokio::test]
async fn remote_deltas_carry_the_remote_mirror_uuid() {
    let fleet = TestFleet::new();
    fleet.lead().await;

    fleet
        .factory
        .remote_pool_watcher()
        .deliver(
            &fleet.remote_mirror_uuid,
            image_ids(&[("g7", "r")]),
            image_ids(&[]),
        )
        .await;

    let updates = fleet.factory.image_map().updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, fleet.remote_mirror_uuid);
}

#[tokio::test]
async fn discovery_while_not_leader_is_dropped() {
    let fleet = TestFleet::new();
    fleet.init().await;

    fleet
        .replayer
        .handle_update(
            fleet.local_mirror_uuid.clone(),
            image_ids(&[("g1", "a")]),
            image_ids(&[]),
        )
        .await;

    assert_eq!(fleet.log.count("image_map.update_images"), 0);
    // Only the instance id from init reached the sink.
    assert_eq!(fleet.sink.recorded().len(), 1);
    assert_eq!(fleet.sink.latest("image_local_count"), None);
}

#[tokio::test]
async fn counts_track_the_watchers_between_deltas() {
    let fleet = TestFleet::new();
    fleet.lead().await;
    let local = fleet.factory.local_pool_watcher();

    local.set_image_count(1);
    local
        .deliver(&fleet.local_mirror_uuid, image_ids(&[("g1", "a")]), image_ids(&[]))
        .await;
    assert_eq!(
        fleet.sink.latest("image_local_count"),
        Some(AttributeValue::U64(1))
    );

    local.set_image_count(9);
    local
        .deliver(&fleet.local_mirror_uuid, image_ids(&[("g2", "b")]), image_ids(&[]))
        .await;
    assert_eq!(
        fleet.sink.latest("image_local_count"),
        Some(AttributeValue::U64(9))
    );
}

#[tokio::test]
async fn sub_namespace_coordinator_never_touches_the_health_sink() {
    let fleet = TestFleet::for_namespace("tenant-a");
    fleet.lead().await;
    assert!(fleet.sink.recorded().is_empty());

    // The subsystems still see the namespace-narrowed pool.
    let peers = fleet.factory.instance_replayer().peers();
    assert_eq!(peers[0].1.namespace, "tenant-a");

    fleet
        .factory
        .local_pool_watcher()
        .deliver(
            &fleet.local_mirror_uuid,
            image_ids(&[("g1", "a")]),
            image_ids(&[]),
        )
        .await;

    // Forwarding works; reporting stays root-namespace-only.
    assert_eq!(fleet.factory.image_map().updates().len(), 1);
    assert!(fleet.sink.recorded().is_empty());
}

#[tokio::test]
async fn instance_topology_changes_reach_the_image_map() {
    let fleet = TestFleet::new();
    fleet.lead().await;

    fleet
        .replayer
        .handle_instances_added(&["inst-a".to_string(), "inst-b".to_string()])
        .await;
    fleet
        .replayer
        .handle_instances_removed(&["inst-c".to_string()])
        .await;

    let map = fleet.factory.image_map();
    assert_eq!(
        map.instances_added(),
        vec![vec!["inst-a".to_string(), "inst-b".to_string()]]
    );
    assert_eq!(map.instances_removed(), vec![vec!["inst-c".to_string()]]);
    fleet.log.assert_order(
        "image_map.update_instances_added",
        "image_map.update_instances_removed",
    );
}

#[tokio::test]
#[should_panic(expected = "topology updates are leader-only")]
async fn topology_update_while_not_leader_panics() {
    let fleet = TestFleet::new();
    fleet.init().await;
    fleet
        .replayer
        .handle_instances_added(&["inst-a".to_string()])
        .await;
}

#[tokio::test]
async fn delivery_after_coordinator_drop_is_ignored() {
    let fleet = TestFleet::new();
    fleet.lead().await;
    let TestFleet {
        replayer,
        factory,
        log,
        local_mirror_uuid,
        ..
    } = fleet;
    let watcher = factory.local_pool_watcher();
    drop(replayer);

    watcher
        .deliver(&local_mirror_uuid, image_ids(&[("g1", "a")]), image_ids(&[]))
        .await;

    assert!(factory.image_map().updates().is_empty());
    assert_eq!(log.count("image_map.update_images"), 0);
}
