//! Strata Sim - Demo Driver for the Strata Mesh
//!
//! Builds a small cluster of slabs, drives the eventual-consistency
//! scenario through it and records what travelled over the mesh.
//!
//! # Architecture
//!
//! - **Config**: cluster size and mesh settings from `STRATA_*` variables
//! - **Cluster**: the mesh, its slabs and how to let messages settle
//! - **Recorder**: consumes the mesh event stream and measures transit
//! - **Scenario**: the scripted writes and reads, producing a report

pub mod cluster;
pub mod config;
pub mod error;
pub mod recorder;
pub mod scenario;

pub use cluster::Cluster;
pub use config::SimConfig;
pub use error::{Result, SimError};
pub use recorder::{EventRecorder, TransitSummary};
pub use scenario::{run, Observation, ScenarioReport};
