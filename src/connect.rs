//! Wiring: turn a [`Config`] into connected pipelines.

use anyhow::Context;
use ch_sync_postgresql::PgTableSource;
use ch_sync_postgresql_wal2json_source::PgReplicationSource;
use checkpoint::{CheckpointStore, FilesystemStore, StateStore};
use clickhouse_sink::{ClickHouseCheckpointStore, ClickHouseWarehouse, Warehouse};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

use crate::cdc::CdcPipeline;
use crate::config::{Config, PipelineConfig, PipelineKind, StateLocation};
use crate::incremental::IncrementalPipeline;
use crate::log_batch::LogBatchPipeline;
use crate::reconcile::{SqlReconciliation, SKIP_ENV};
use crate::{Orchestrator, SyncPipeline};

/// One ClickHouse client per configured destination, shared by every
/// pipeline writing to it.
pub struct Destinations {
    warehouses: BTreeMap<String, Arc<ClickHouseWarehouse>>,
}

impl Destinations {
    pub fn new(config: &Config) -> Self {
        let warehouses = config
            .destinations
            .iter()
            .map(|(name, c)| (name.clone(), Arc::new(ClickHouseWarehouse::new(c))))
            .collect();
        Self { warehouses }
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Arc<ClickHouseWarehouse>> {
        self.warehouses
            .get(name)
            .cloned()
            .with_context(|| format!("Unknown destination '{name}'"))
    }
}

fn state_store(
    config: &Config,
    pipeline: &PipelineConfig,
    destinations: &Destinations,
) -> anyhow::Result<StateStore> {
    let store: Arc<dyn CheckpointStore> = match config.state {
        StateLocation::Filesystem => Arc::new(FilesystemStore::new(&config.state_dir)),
        StateLocation::Destination => Arc::new(ClickHouseCheckpointStore::new(
            destinations.get(&pipeline.destination)?,
        )),
    };
    Ok(StateStore::new(store))
}

fn build_pipeline(
    config: &Config,
    pipeline: &PipelineConfig,
    destinations: &Destinations,
) -> anyhow::Result<Box<dyn SyncPipeline>> {
    let connection_string = &config.source(&pipeline.source)?.connection_string;
    let warehouse: Arc<dyn Warehouse> = destinations.get(&pipeline.destination)?;

    Ok(match &pipeline.kind {
        PipelineKind::Incremental(c) => Box::new(IncrementalPipeline::new(
            &pipeline.name,
            &pipeline.dataset,
            c.clone(),
            Arc::new(PgTableSource::new(connection_string, &c.schema)),
            warehouse,
        )),
        PipelineKind::Cdc(c) => Box::new(CdcPipeline::new(
            &pipeline.name,
            &pipeline.dataset,
            connection_string,
            c.clone(),
            Arc::new(PgReplicationSource::new(connection_string)),
            warehouse,
            state_store(config, pipeline, destinations)?,
        )?),
        PipelineKind::LogBatch(c) => Box::new(LogBatchPipeline::new(
            &pipeline.name,
            &pipeline.dataset,
            c.clone(),
            Arc::new(PgTableSource::new(connection_string, &c.schema)),
            warehouse,
        )),
    })
}

/// Build the orchestrator for every configured pipeline.
pub fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let destinations = Destinations::new(config);
    let mut orchestrator = Orchestrator::new();

    for pipeline in &config.pipelines {
        orchestrator.add_pipeline(build_pipeline(config, pipeline, &destinations)?);
        if !pipeline.post_merge_sql.is_empty() {
            orchestrator.add_hook(Box::new(SqlReconciliation::new(
                &pipeline.name,
                destinations.get(&pipeline.destination)?,
                pipeline.post_merge_sql.clone(),
            )));
        }
    }
    orchestrator.skip_reconciliation(std::env::var_os(SKIP_ENV).is_some());
    Ok(orchestrator)
}

/// Check every source and destination the selected pipelines use.
///
/// Sources feeding a CDC pipeline must also be ready for logical decoding.
pub async fn preflight(config: &Config, selected: &[String]) -> anyhow::Result<()> {
    info!("Running environment validation");
    let pipelines: Vec<&PipelineConfig> = if selected.is_empty() {
        config.pipelines.iter().collect()
    } else {
        selected
            .iter()
            .map(|name| config.pipeline(name))
            .collect::<sync_core::Result<_>>()?
    };

    let mut sources: BTreeMap<&str, bool> = BTreeMap::new();
    let mut destinations: BTreeSet<&str> = BTreeSet::new();
    for pipeline in &pipelines {
        let logical = matches!(pipeline.kind, PipelineKind::Cdc(_));
        *sources.entry(pipeline.source.as_str()).or_default() |= logical;
        destinations.insert(pipeline.destination.as_str());
    }

    for (name, logical) in sources {
        let source = config.source(name)?;
        let client = ch_sync_postgresql::connect(&source.connection_string)
            .await
            .with_context(|| format!("Source '{name}' is not reachable"))?;
        ch_sync_postgresql::preflight::check_source(&client, logical)
            .await
            .with_context(|| format!("Source '{name}' failed preflight"))?;
    }

    let connections = Destinations::new(config);
    for name in destinations {
        connections
            .get(name)?
            .preflight()
            .await
            .with_context(|| format!("Destination '{name}' failed preflight"))?;
    }

    info!("Environment validation complete");
    Ok(())
}
