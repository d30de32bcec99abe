//! Basalt Mirror Test Infrastructure
//!
//! Mock subsystem fleet, fault injection, and the lifecycle, leadership,
//! discovery, and control suites for the namespace replication coordinator.

pub mod harness;

pub use harness::{
    image_ids, init_tracing, FaultPlan, MockFactory, MockSink, OpLog, TestFleet, LOCAL_POOL_ID,
    REMOTE_POOL_ID, TEST_INSTANCE_ID,
};

#[cfg(test)]
mod leader_tests;
#[cfg(test)]
mod update_tests;
