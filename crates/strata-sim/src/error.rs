//! Error types for the simulation driver.

use std::time::Duration;

use thiserror::Error;

/// Result type for simulation runs.
pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// The store refused an operation
    #[error("Store error: {0}")]
    Store(#[from] strata_store::Error),

    /// Simulation settings rejected
    #[error("Invalid simulation config: {0}")]
    Config(String),

    /// Messages were still in flight when the settle timeout passed
    #[error("Mesh did not settle within {0:?}")]
    Unsettled(Duration),

    /// A record the scenario depends on is missing from a slab
    #[error("Record {record} is not present on slab {slab}")]
    MissingRecord {
        record: strata_store::RecordId,
        slab: strata_store::SlabId,
    },

    /// Report serialization failed
    #[error("Report encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
