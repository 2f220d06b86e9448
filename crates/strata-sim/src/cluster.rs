//! A mesh and the slabs registered with it.

use strata_store::{Mesh, Slab, SlabConfig, SlabId};
use tracing::{debug, info};

use crate::config::{SimConfig, MAX_FLUSH_ROUNDS};
use crate::error::{Result, SimError};

pub struct Cluster {
    mesh: Mesh,
    slabs: Vec<Slab>,
    config: SimConfig,
}

impl Cluster {
    /// Build the mesh and `slab_count` slabs named `A`, `B`, ... (mesh
    /// allocated ids past `Z`).
    pub fn build(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let mesh = Mesh::new(config.mesh.clone())?;

        let mut slabs = Vec::with_capacity(config.slab_count);
        for n in 0..config.slab_count {
            let id = match u8::try_from(n).ok().filter(|&n| n < 26) {
                Some(n) => SlabId::new(char::from(b'A' + n).to_string())?,
                None => mesh.allocate_slab_id(),
            };
            slabs.push(Slab::new(&mesh, SlabConfig::from_env(id)?)?);
        }
        info!(slabs = slabs.len(), disconnected = mesh.is_disconnected(), "Cluster built");

        Ok(Self { mesh, slabs, config })
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    pub fn first(&self) -> &Slab {
        &self.slabs[0]
    }

    pub fn last(&self) -> &Slab {
        &self.slabs[self.slabs.len() - 1]
    }

    /// Deliver one round of messages: a single flush when disconnected,
    /// everything in flight otherwise.
    pub async fn step(&self) -> Result<()> {
        if self.mesh.is_disconnected() {
            let delivered = self.mesh.deliver_all_queued_messages();
            debug!(delivered, "Flushed one round");
            return Ok(());
        }
        self.wait_idle().await
    }

    /// Deliver until nothing is queued or in flight.
    pub async fn settle(&self) -> Result<()> {
        if !self.mesh.is_disconnected() {
            return self.wait_idle().await;
        }
        for round in 1..=MAX_FLUSH_ROUNDS {
            if self.mesh.deliver_all_queued_messages() == 0 {
                debug!(rounds = round, "Mesh settled");
                return Ok(());
            }
        }
        Err(SimError::Unsettled(self.config.settle_timeout))
    }

    async fn wait_idle(&self) -> Result<()> {
        if self.mesh.wait_idle(self.config.settle_timeout).await {
            Ok(())
        } else {
            Err(SimError::Unsettled(self.config.settle_timeout))
        }
    }
}
