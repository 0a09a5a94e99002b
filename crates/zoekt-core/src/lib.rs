//! zoekt-core — shared configuration for the Zoekt control plane.
//!
//! The control plane reconciles storage reservations, replica counts and
//! index lifecycles for a fleet of Zoekt search nodes. This crate holds the
//! tunables every component reads: watermark thresholds, batch limits and
//! the per-handler rescheduling policy.

pub mod config;

pub use config::{
    BatchLimits, ConfigError, DeploymentConfig, ReplicaPolicy, ReschedulePolicy, TaskPolicy,
    WatermarkThresholds, WorkerConfig, ZoektConfig,
};
