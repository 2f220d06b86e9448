//! Simulation configuration.

use std::time::Duration;

use strata_store::config::env_var;
use strata_store::MeshConfig;

use crate::error::{Result, SimError};

/// Slabs in the default cluster.
pub const DEFAULT_SLAB_COUNT: usize = 3;
/// How long a connected mesh gets to go idle between scenario steps.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Flush rounds a disconnected mesh gets before it counts as unsettled.
pub const MAX_FLUSH_ROUNDS: usize = 64;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub slab_count: usize,
    pub mesh: MeshConfig,
    pub settle_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            slab_count: DEFAULT_SLAB_COUNT,
            mesh: MeshConfig::disconnected(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }
}

impl SimConfig {
    /// Defaults overridden by `STRATA_SLAB_COUNT`, `STRATA_SETTLE_TIMEOUT_MS`
    /// and the mesh variables read by [`MeshConfig::from_env`].
    ///
    /// Unlike the library default, the mesh here is connected unless
    /// `STRATA_DISCONNECTED` says otherwise.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            mesh: MeshConfig::from_env()?,
            ..Self::default()
        };
        if let Some(count) = env_var("STRATA_SLAB_COUNT")? {
            config.slab_count = count;
        }
        if let Some(ms) = env_var::<u64>("STRATA_SETTLE_TIMEOUT_MS")? {
            config.settle_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_slab_count(mut self, count: usize) -> Self {
        self.slab_count = count;
        self
    }

    #[must_use]
    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    #[must_use]
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // The scenario writes on the first slab and rewrites on the last.
        if self.slab_count < 2 {
            return Err(SimError::Config(format!(
                "need at least 2 slabs, got {}",
                self.slab_count
            )));
        }
        if self.settle_timeout.is_zero() {
            return Err(SimError::Config("settle timeout must be positive".into()));
        }
        self.mesh.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.mesh.disconnected);
    }

    #[test]
    fn rejects_a_lone_slab() {
        let config = SimConfig::default().with_slab_count(1);
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = SimConfig::default().with_settle_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }
}
