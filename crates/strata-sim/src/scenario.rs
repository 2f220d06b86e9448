//! The eventual-consistency walkthrough.
//!
//! 1. The first slab creates a record with `animal_sound = "moo"`.
//! 2. One delivery round, then the mesh settles.
//! 3. The last slab holding a copy overwrites the sound with `"woof"`.
//! 4. The mesh settles again.
//!
//! After every step each slab reports what it resolves, so the report shows
//! the write spreading and the overwrite catching up.

use serde::Serialize;
use strata_store::{payload, Record, RecordId, Slab, SlabId};
use tracing::info;

use crate::cluster::Cluster;
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::recorder::{EventRecorder, TransitSummary};

const FIELD: &str = "animal_sound";

/// What one slab resolved after one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub step: &'static str,
    pub slab: SlabId,
    /// `None` while the slab holds nothing of the record
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub record: RecordId,
    pub slabs: usize,
    pub disconnected: bool,
    pub observations: Vec<Observation>,
    pub transit: TransitSummary,
}

impl ScenarioReport {
    /// What `slab` resolved after `step`.
    pub fn value_at(&self, step: &str, slab: &SlabId) -> Option<&str> {
        self.observations
            .iter()
            .find(|o| o.step == step && o.slab == *slab)
            .and_then(|o| o.value.as_deref())
    }

    /// Whether every slab that holds the record resolved `value` after
    /// `step`.
    pub fn converged(&self, step: &str, value: &str) -> bool {
        let mut held = self
            .observations
            .iter()
            .filter(|o| o.step == step)
            .filter_map(|o| o.value.as_deref())
            .peekable();
        held.peek().is_some() && held.all(|v| v == value)
    }
}

/// Run the walkthrough on a fresh cluster.
pub async fn run(config: SimConfig) -> Result<ScenarioReport> {
    let cluster = Cluster::build(config)?;
    let mut recorder = EventRecorder::new(cluster.mesh());
    let mut observations = Vec::new();

    let origin = cluster.first();
    let record = Record::create(&origin.create_context(), payload([(FIELD, "moo")]))?;
    info!(record = %record.id(), slab = %origin.id(), "Record created");
    observe(&cluster, record.id(), "created", &mut observations);

    cluster.step().await?;
    observe(&cluster, record.id(), "first_round", &mut observations);

    cluster.settle().await?;
    observe(&cluster, record.id(), "settled", &mut observations);

    // The last slab that holds a copy; with more slabs than replicas some
    // never see the record at all.
    let (writer, copy) = cluster
        .slabs()
        .iter()
        .rev()
        .find_map(|slab| slab.get_record(record.id()).map(|copy| (slab, copy)))
        .ok_or_else(|| SimError::MissingRecord {
            record: record.id().clone(),
            slab: cluster.last().id().clone(),
        })?;
    let memo = copy.set(payload([(FIELD, "woof")]))?;
    info!(record = %record.id(), slab = %writer.id(), %memo, "Record overwritten");
    observe(&cluster, record.id(), "overwritten", &mut observations);

    cluster.settle().await?;
    observe(&cluster, record.id(), "final", &mut observations);

    recorder.collect();
    let transit = recorder.summary();
    info!(
        emitted = transit.emitted,
        delivered = transit.delivered,
        dropped = transit.dropped,
        "Scenario finished"
    );

    Ok(ScenarioReport {
        record: record.id().clone(),
        slabs: cluster.slabs().len(),
        disconnected: cluster.mesh().is_disconnected(),
        observations,
        transit,
    })
}

fn observe(cluster: &Cluster, record: &RecordId, step: &'static str, into: &mut Vec<Observation>) {
    for slab in cluster.slabs() {
        let value = resolve(slab, record);
        info!(step, slab = %slab.id(), ?value, "Observed");
        into.push(Observation {
            step,
            slab: slab.id().clone(),
            value,
        });
    }
}

fn resolve(slab: &Slab, record: &RecordId) -> Option<String> {
    let value = slab.get_record(record)?.get(FIELD)?;
    value.as_str().map(str::to_owned)
}
