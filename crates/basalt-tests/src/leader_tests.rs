//! Leadership suite: acquisition ordering, benign unconfigured peers,
//! failure unwinding, and release semantics.

use proptest::prelude::*;

use crate::harness::{image_ids, TestFleet};
use basalt_mirror::error::MirrorError;
use basalt_mirror::health::AttributeValue;
use basalt_mirror::replayer::ReplayerState;

#[tokio::test]
async fn acquire_brings_leader_subsystems_up_in_order() {
    let fleet = TestFleet::new();
    fleet.init().await;
    fleet.log.clear();

    fleet
        .replayer
        .handle_acquire_leader()
        .await
        .expect("acquire failed");

    assert_eq!(
        fleet.log.entries(),
        vec![
            "instance_watcher.handle_acquire_leader",
            "image_map.init",
            "local_pool_watcher.init",
            "remote_pool_watcher.init",
            "image_deleter.init",
        ]
    );
    assert_eq!(fleet.replayer.state(), ReplayerState::Leading);
    assert!(fleet.replayer.is_leader());
}

#[tokio::test]
#[should_panic(expected = "lifecycle sequences may not overlap")]
async fn acquire_before_init_panics() {
    let fleet = TestFleet::new();
    let _ = fleet.replayer.handle_acquire_leader().await;
}

#[tokio::test]
#[should_panic(expected = "lifecycle sequences may not overlap")]
async fn acquire_while_already_leading_panics() {
    let fleet = TestFleet::new();
    fleet.lead().await;
    let _ = fleet.replayer.handle_acquire_leader().await;
}

#[tokio::test]
async fn unconfigured_remote_peer_does_not_block_leadership() {
    let fleet = TestFleet::new();
    fleet.init().await;
    fleet
        .faults
        .fail("remote_pool_watcher.init", MirrorError::NotConfigured);
    fleet.log.clear();

    fleet
        .replayer
        .handle_acquire_leader()
        .await
        .expect("acquire failed");

    // The remote watcher stays registered and the acquisition runs to the
    // end, so the sequence is indistinguishable from the configured case.
    assert_eq!(fleet.log.count("image_deleter.init"), 1);
    assert!(fleet.replayer.is_leader());
    assert_eq!(fleet.replayer.state(), ReplayerState::Leading);

    // Local discovery works and the remote count reports as zero until the
    // remote side configures mirroring.
    fleet.factory.local_pool_watcher().set_image_count(2);
    fleet
        .factory
        .local_pool_watcher()
        .deliver(
            &fleet.local_mirror_uuid,
            image_ids(&[("g1", "a"), ("g2", "b")]),
            image_ids(&[]),
        )
        .await;
    assert_eq!(fleet.factory.image_map().updates().len(), 1);
    assert_eq!(
        fleet.sink.latest("image_local_count"),
        Some(AttributeValue::U64(2))
    );
    assert_eq!(
        fleet.sink.latest("image_remote_count"),
        Some(AttributeValue::U64(0))
    );
}

#[tokio::test]
async fn acquire_failure_at_the_map_leaves_no_leader_state() {
    let fleet = TestFleet::new();
    fleet.init().await;
    let injected = MirrorError::Assign {
        msg: "map load failed".to_string(),
    };
    fleet.faults.fail("image_map.init", injected.clone());
    fleet.log.clear();

    let err = fleet.replayer.handle_acquire_leader().await.unwrap_err();

    assert_eq!(err, injected);
    // The failed map was never stored: nothing to unwind, no assignment
    // release.
    assert_eq!(
        fleet.log.entries(),
        vec!["instance_watcher.handle_acquire_leader", "image_map.init"]
    );
    assert_eq!(fleet.replayer.state(), ReplayerState::Running);
    assert!(!fleet.replayer.is_leader());
}

#[tokio::test]
async fn acquire_failure_at_the_local_watcher_unwinds_the_map() {
    let fleet = TestFleet::new();
    fleet.init().await;
    let injected = MirrorError::Watch {
        msg: "local image listing failed".to_string(),
    };
    fleet
        .faults
        .fail("local_pool_watcher.init", injected.clone());
    fleet.log.clear();

    let err = fleet.replayer.handle_acquire_leader().await.unwrap_err();

    assert_eq!(err, injected);
    assert_eq!(
        fleet.log.entries(),
        vec![
            "instance_watcher.handle_acquire_leader",
            "image_map.init",
            "local_pool_watcher.init",
            "image_map.shut_down",
            "instance_replayer.release_all",
        ]
    );
    assert_eq!(fleet.log.count("local_pool_watcher.shut_down"), 0);
    assert_eq!(fleet.replayer.state(), ReplayerState::Running);
}

#[tokio::test]
async fn acquire_failure_at_the_remote_watcher_unwinds_local_then_map() {
    let fleet = TestFleet::new();
    fleet.init().await;
    let injected = MirrorError::Watch {
        msg: "remote image listing failed".to_string(),
    };
    fleet
        .faults
        .fail("remote_pool_watcher.init", injected.clone());
    fleet.log.clear();

    let err = fleet.replayer.handle_acquire_leader().await.unwrap_err();

    assert_eq!(err, injected);
    assert_eq!(
        fleet.log.entries(),
        vec![
            "instance_watcher.handle_acquire_leader",
            "image_map.init",
            "local_pool_watcher.init",
            "remote_pool_watcher.init",
            "local_pool_watcher.shut_down",
            "image_map.shut_down",
            "instance_replayer.release_all",
        ]
    );
    assert_eq!(fleet.log.count("remote_pool_watcher.shut_down"), 0);
    assert_eq!(fleet.replayer.state(), ReplayerState::Running);
    assert!(!fleet.replayer.is_leader());
}

#[tokio::test]
async fn acquire_failure_at_the_deleter_unwinds_everything() {
    let fleet = TestFleet::new();
    fleet.init().await;
    let injected = MirrorError::Delete {
        msg: "deleter queue unavailable".to_string(),
    };
    fleet.faults.fail("image_deleter.init", injected.clone());
    fleet.log.clear();

    let err = fleet.replayer.handle_acquire_leader().await.unwrap_err();

    assert_eq!(err, injected);
    for entry in [
        "local_pool_watcher.shut_down",
        "remote_pool_watcher.shut_down",
        "image_map.shut_down",
        "instance_replayer.release_all",
    ] {
        assert_eq!(fleet.log.count(entry), 1);
    }
    assert_eq!(fleet.log.count("image_deleter.shut_down"), 0);
    assert!(!fleet.replayer.is_leader());
    assert_eq!(fleet.replayer.state(), ReplayerState::Running);
}

#[tokio::test]
async fn acquire_failure_wins_over_unwind_failures() {
    let fleet = TestFleet::new();
    fleet.init().await;
    let step_err = MirrorError::Watch {
        msg: "remote image listing failed".to_string(),
    };
    fleet
        .faults
        .fail("remote_pool_watcher.init", step_err.clone());
    fleet.faults.fail(
        "image_map.shut_down",
        MirrorError::Assign {
            msg: "map persistence failed".to_string(),
        },
    );

    let err = fleet.replayer.handle_acquire_leader().await.unwrap_err();

    assert_eq!(err, step_err);
    assert!(fleet.log.contains("instance_replayer.release_all"));
}

#[tokio::test]
async fn release_tears_down_in_reverse_acquisition_order() {
    let fleet = TestFleet::new();
    fleet.lead().await;
    fleet.log.clear();

    fleet
        .replayer
        .handle_release_leader()
        .await
        .expect("release failed");

    assert_eq!(
        fleet.log.entries(),
        vec![
            "instance_watcher.handle_release_leader",
            "image_deleter.shut_down",
            "local_pool_watcher.shut_down",
            "remote_pool_watcher.shut_down",
            "image_map.shut_down",
            "instance_replayer.release_all",
        ]
    );
    assert_eq!(fleet.replayer.state(), ReplayerState::Running);
    assert!(!fleet.replayer.is_leader());
}

#[tokio::test]
async fn release_while_merely_running_only_notifies() {
    let fleet = TestFleet::new();
    fleet.init().await;
    fleet.log.clear();

    fleet
        .replayer
        .handle_release_leader()
        .await
        .expect("release failed");

    assert_eq!(
        fleet.log.entries(),
        vec!["instance_watcher.handle_release_leader"]
    );
    assert_eq!(fleet.replayer.state(), ReplayerState::Running);
}

#[tokio::test]
async fn reacquire_builds_a_fresh_leader_fleet() {
    let fleet = TestFleet::new();
    fleet.lead().await;
    fleet
        .replayer
        .handle_release_leader()
        .await
        .expect("release failed");
    fleet.log.clear();

    fleet
        .replayer
        .handle_acquire_leader()
        .await
        .expect("reacquire failed");

    assert_eq!(fleet.factory.image_maps_created(), 2);
    assert_eq!(fleet.log.count("image_map.init"), 1);
    assert_eq!(fleet.log.count("local_pool_watcher.init"), 1);
    assert!(fleet.replayer.is_leader());
}

const ACQUIRE_STEPS: [&str; 4] = [
    "image_map.init",
    "local_pool_watcher.init",
    "remote_pool_watcher.init",
    "image_deleter.init",
];

fn nth_error(idx: usize) -> MirrorError {
    match idx {
        0 => MirrorError::Watch {
            msg: "listing failed".to_string(),
        },
        1 => MirrorError::Assign {
            msg: "assignment failed".to_string(),
        },
        _ => MirrorError::Fenced { pool_id: 1 },
    }
}

proptest! {
    #[test]
    fn prop_failed_acquisition_always_returns_to_running(
        step_idx in 0usize..4,
        err_idx in 0usize..3,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fleet = TestFleet::new();
            fleet.init().await;
            let injected = nth_error(err_idx);
            fleet.faults.fail(ACQUIRE_STEPS[step_idx], injected.clone());

            let err = fleet.replayer.handle_acquire_leader().await.unwrap_err();
            assert_eq!(err, injected);
            assert_eq!(fleet.replayer.state(), ReplayerState::Running);
            assert!(!fleet.replayer.is_leader());

            // Every step up to and including the failing one ran exactly
            // once; nothing past it ran.
            for (idx, step) in ACQUIRE_STEPS.iter().enumerate() {
                let expected = usize::from(idx <= step_idx);
                assert_eq!(fleet.log.count(step), expected, "{step}");
            }

            // The unwind left the slots clean, so the role can be acquired
            // again.
            fleet.log.clear();
            fleet
                .replayer
                .handle_acquire_leader()
                .await
                .expect("reacquire after failure");
            assert_eq!(fleet.replayer.state(), ReplayerState::Leading);
            assert!(fleet.replayer.is_leader());
        });
    }
}
