//! Slab and mesh configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::id::SlabId;
use crate::mesh::LatencyModel;

/// Soft memo count a slab evicts down towards.
pub const DEFAULT_QUOTA: usize = 5;
/// Memo count at which a slab evicts before storing more.
pub const DEFAULT_LIMIT: usize = 10;
/// Copies of each memo wanted across the mesh, the holder included.
pub const DEFAULT_REPLICA_TARGET: usize = 3;
/// Default one-way delivery delay.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(100);
/// Events buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// How a fresh read behaves when causal prerequisites are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Report "not available" straight away
    #[default]
    Immediate,
    /// Wait for the missing memos, up to `timeout`
    Blocking { timeout: Duration },
}

/// Configuration for one slab.
#[derive(Debug, Clone)]
pub struct SlabConfig {
    pub id: SlabId,
    pub quota: usize,
    pub limit: usize,
    pub replica_target: usize,
    /// Read policy for contexts created on this slab
    pub read_policy: ReadPolicy,
}

impl SlabConfig {
    pub fn new(id: SlabId) -> Self {
        Self {
            id,
            quota: DEFAULT_QUOTA,
            limit: DEFAULT_LIMIT,
            replica_target: DEFAULT_REPLICA_TARGET,
            read_policy: ReadPolicy::Immediate,
        }
    }

    /// Defaults overridden by `STRATA_SLAB_QUOTA`, `STRATA_SLAB_LIMIT` and
    /// `STRATA_REPLICA_TARGET`.
    pub fn from_env(id: SlabId) -> Result<Self> {
        let mut config = Self::new(id);
        if let Some(quota) = env_var("STRATA_SLAB_QUOTA")? {
            config.quota = quota;
        }
        if let Some(limit) = env_var("STRATA_SLAB_LIMIT")? {
            config.limit = limit;
        }
        if let Some(target) = env_var("STRATA_REPLICA_TARGET")? {
            config.replica_target = target;
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_replica_target(mut self, target: usize) -> Self {
        self.replica_target = target;
        self
    }

    #[must_use]
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::InvalidConfig("slab limit must be at least 1".into()));
        }
        if self.quota > self.limit {
            return Err(Error::InvalidConfig(format!(
                "slab quota {} exceeds limit {}",
                self.quota, self.limit
            )));
        }
        if self.replica_target == 0 {
            return Err(Error::InvalidConfig("replica target must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub latency: LatencyModel,
    /// Queue every message until explicitly flushed
    pub disconnected: bool,
    pub event_capacity: usize,
    /// Seed for latency jitter; entropy when unset
    pub seed: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            latency: LatencyModel::Fixed(DEFAULT_LATENCY),
            disconnected: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            seed: None,
        }
    }
}

impl MeshConfig {
    /// Queue-and-flush mesh, as used by deterministic tests.
    pub fn disconnected() -> Self {
        Self {
            disconnected: true,
            ..Self::default()
        }
    }

    /// Defaults overridden by `STRATA_LATENCY_MS`, `STRATA_LATENCY_JITTER_MS`
    /// and `STRATA_DISCONNECTED`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let floor = env_var::<u64>("STRATA_LATENCY_MS")?.map(Duration::from_millis);
        let jitter = env_var::<u64>("STRATA_LATENCY_JITTER_MS")?.map(Duration::from_millis);
        config.latency = match (floor, jitter) {
            (floor, Some(jitter)) if !jitter.is_zero() => LatencyModel::Jittered {
                floor: floor.unwrap_or(DEFAULT_LATENCY),
                jitter,
            },
            (Some(floor), _) => LatencyModel::Fixed(floor),
            (None, _) => config.latency,
        };
        if let Ok(raw) = std::env::var("STRATA_DISCONNECTED") {
            config.disconnected = parse_flag("STRATA_DISCONNECTED", &raw)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_latency(mut self, latency: LatencyModel) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_disconnected(mut self, disconnected: bool) -> Self {
        self.disconnected = disconnected;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse an optional environment variable.
pub fn env_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}={raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{key}={raw:?}"))),
    }
}
