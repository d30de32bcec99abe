#![warn(missing_docs)]

//! Basalt mirroring subsystem: per-namespace replication coordination for cross-cluster image mirroring

pub mod types;
pub mod error;
pub mod throttle;
pub mod health;
pub mod subsystems;
pub mod replayer;
