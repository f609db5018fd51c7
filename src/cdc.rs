//! Change-data-capture pipelines.
//!
//! Each stream owns one replication slot. The first run of a stream creates
//! the slot, merges the snapshot pinned at its consistent point and records
//! that in the run history; every run, first or not, then streams committed
//! changes from the slot and acknowledges them after they are merged.
//!
//! Snapshot rows are versioned with the consistent-point LSN and streamed
//! rows with their commit LSN, so a change that reaches the destination
//! before the snapshot row it supersedes still wins the merge. Once a
//! snapshot is merged, destination rows it did not rewrite are retired:
//! their source rows were deleted while no slot was capturing changes.
//!
//! Streams of a pipeline run side by side, each on its own slot.

use anyhow::Context;
use async_trait::async_trait;
use checkpoint::{save_checkpoint, State, StateID, StateStore, SyncPhase};
use ch_sync_postgresql_wal2json_source::{
    PostgreSQLLogicalCheckpoint, ReplicationOptions, ReplicationSource, StreamEvent,
    StreamOptions, StreamReader,
};
use clickhouse_sink::Warehouse;
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use sync_core::{ChangeEvent, Lsn, Operation, Record, WriteBatch, WriteRow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ads::{self, AD_KEY_COLUMN};
use crate::config::{CdcConfig, StreamConfig, Transform};
use crate::destination_table;
use crate::orchestrator::{combine_errors, RunStats, SyncPipeline};

/// Shape decoded change events into destination batches, one per table.
pub fn shape_events(stream: &StreamConfig, dataset: &str, events: &[ChangeEvent]) -> Vec<WriteBatch> {
    let mut batches: BTreeMap<String, WriteBatch> = BTreeMap::new();

    for event in events.iter().filter(|e| selected(stream, &e.row)) {
        let version = event.lsn.as_u64();
        match stream.transform {
            Transform::Raw => {
                let name = stream.target.as_deref().unwrap_or(&event.table);
                let table = destination_table(dataset, name);
                let batch = batches.entry(table.clone()).or_insert_with(|| {
                    let key = if event.key_columns.is_empty() {
                        vec!["id".to_string()]
                    } else {
                        event.key_columns.clone()
                    };
                    WriteBatch::new(table, key)
                });
                if event.operation == Operation::Delete {
                    batch.push(WriteRow::tombstone(event.row.clone(), version));
                } else {
                    batch.push(WriteRow::upsert(event.row.clone(), version));
                }
            }
            Transform::InlineAds | Transform::InlineAdsLegacy => {
                if event.operation == Operation::Delete {
                    debug!("Ignoring DELETE on append-only log table {}", event.table);
                    continue;
                }
                let records = if stream.transform == Transform::InlineAds {
                    ads::transform(&event.row)
                } else {
                    ads::transform_legacy(&event.row)
                };
                let name = stream.target.as_deref().unwrap_or(&event.table);
                let table = destination_table(dataset, name);
                let batch = batches
                    .entry(table.clone())
                    .or_insert_with(|| WriteBatch::new(table, vec![AD_KEY_COLUMN.to_string()]));
                for record in records {
                    batch.push(WriteRow::upsert(record.into_record(), version));
                }
            }
        }
    }

    batches.into_values().filter(|b| !b.is_empty()).collect()
}

fn selected(stream: &StreamConfig, row: &Record) -> bool {
    if stream.names.is_empty() {
        return true;
    }
    match row.get("name").and_then(Value::as_str) {
        Some(name) => stream.names.iter().any(|n| n == name),
        None => false,
    }
}

pub struct CdcPipeline {
    name: String,
    dataset: String,
    connection_string: String,
    config: CdcConfig,
    source: Arc<dyn ReplicationSource>,
    warehouse: Arc<dyn Warehouse>,
    state: StateStore,
    stream_options: StreamOptions,
}

impl CdcPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        dataset: impl Into<String>,
        connection_string: impl Into<String>,
        config: CdcConfig,
        source: Arc<dyn ReplicationSource>,
        warehouse: Arc<dyn Warehouse>,
        state: StateStore,
    ) -> anyhow::Result<Self> {
        let mut stream_options = StreamOptions::default();
        if let Some(interval) = config.poll_interval()? {
            stream_options.poll_interval = interval;
        }
        Ok(Self {
            name: name.into(),
            dataset: dataset.into(),
            connection_string: connection_string.into(),
            config,
            source,
            warehouse,
            state,
            stream_options,
        })
    }

    pub fn with_stream_options(mut self, stream_options: StreamOptions) -> Self {
        self.stream_options = stream_options;
        self
    }

    fn state_id(&self, stream: &StreamConfig) -> StateID {
        StateID::from_connection_and_slot(&self.name, &self.connection_string, &stream.slot)
    }

    fn replication_options(&self, stream: &StreamConfig) -> ReplicationOptions {
        ReplicationOptions {
            slot_name: stream.slot.clone(),
            publication_name: stream.publication.clone(),
            schema: self.config.schema.clone(),
            table_names: self.config.tables.clone(),
            persist_snapshot: true,
            reset: false,
            batch_size: self.config.batch_size,
        }
    }

    async fn merge(&self, batches: &[WriteBatch], stats: &mut RunStats) -> anyhow::Result<()> {
        for batch in batches {
            self.warehouse
                .merge(batch)
                .await
                .with_context(|| format!("Failed to merge into {}", batch.table))?;
            stats.record(&batch.table, batch.len() as u64);
        }
        Ok(())
    }

    /// Whether this run has to (re)create the slot and take a snapshot.
    async fn needs_snapshot(&self, stream: &StreamConfig, id: &StateID) -> anyhow::Result<bool> {
        let current = self.state.get_state(id).await?;
        if !State::needs_snapshot(current.as_ref()) {
            if self.source.slot_exists(&stream.slot).await? {
                return Ok(false);
            }
            warn!(
                "Replication slot {} is gone, its position is lost; taking a new snapshot",
                stream.slot
            );
            self.state.transition(id, State::Pending).await?;
            return Ok(true);
        }

        match current {
            Some(State::Initial { pre_lsn }) => {
                warn!("Snapshot of {} taken at {pre_lsn} never completed", stream.slot);
                self.state.transition(id, State::Pending).await?;
            }
            Some(State::Pending) | Some(State::Incremental) => {}
            None => {
                info!("No run history for {}, this is a first run", stream.slot);
                if self.source.slot_exists(&stream.slot).await? {
                    warn!(
                        "Replication slot {} exists without run history and will be recreated",
                        stream.slot
                    );
                }
                self.state.transition(id, State::Pending).await?;
            }
        }
        Ok(true)
    }

    async fn snapshot(
        &self,
        stream: &StreamConfig,
        id: &StateID,
        stats: &mut RunStats,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut options = self.replication_options(stream);
        options.reset = true;

        let snapshot = self.source.init_replication(&options).await?;
        let consistent_lsn = snapshot.consistent_lsn;
        info!("Created replication slot {} at {consistent_lsn}", stream.slot);
        self.state
            .transition(id, State::Initial { pre_lsn: consistent_lsn.to_string() })
            .await?;
        save_checkpoint(
            self.state.checkpoints().as_ref(),
            &id.scope(),
            SyncPhase::SnapshotStart,
            &PostgreSQLLogicalCheckpoint::new(consistent_lsn),
        )
        .await?;

        let mut rows = 0u64;
        if let Some(mut batches) = snapshot.into_batches() {
            while let Some(events) = batches.try_next().await? {
                rows += events.len() as u64;
                let shaped = shape_events(stream, &self.dataset, &events);
                self.merge(&shaped, stats).await?;
                if cancel.is_cancelled() {
                    anyhow::bail!("Snapshot of {} interrupted by shutdown", stream.slot);
                }
            }
        }
        info!("Snapshot of {} merged: {rows} rows", stream.slot);
        self.retire_stale_rows(stream, consistent_lsn).await?;

        save_checkpoint(
            self.state.checkpoints().as_ref(),
            &id.scope(),
            SyncPhase::SnapshotEnd,
            &PostgreSQLLogicalCheckpoint::new(consistent_lsn),
        )
        .await?;
        self.state.transition(id, State::Incremental).await?;
        Ok(())
    }

    /// Destination tables a stream writes, one per source table unless the
    /// stream has a single target.
    fn targets(&self, stream: &StreamConfig) -> BTreeSet<String> {
        self.config
            .tables
            .iter()
            .map(|table| destination_table(&self.dataset, stream.target.as_deref().unwrap_or(table)))
            .collect()
    }

    /// Tombstone rows the snapshot at `consistent_lsn` did not rewrite.
    /// Flattened ad logs are append-only and keep every row.
    async fn retire_stale_rows(&self, stream: &StreamConfig, consistent_lsn: Lsn) -> anyhow::Result<()> {
        if stream.transform != Transform::Raw {
            return Ok(());
        }
        for target in self.targets(stream) {
            if !self.warehouse.table_exists(&target).await? {
                continue;
            }
            self.warehouse
                .retire_older_than(&target, consistent_lsn.as_u64())
                .await
                .with_context(|| format!("Failed to retire stale rows of {target}"))?;
            debug!("Retired rows of {target} missing from the snapshot at {consistent_lsn}");
        }
        Ok(())
    }

    async fn stream(
        &self,
        stream: &StreamConfig,
        id: &StateID,
        stats: &mut RunStats,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let stop = cancel.child_token();
        let timer = self.config.max_duration()?.map(|limit| {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                stop.cancel();
            })
        });

        let mut reader = StreamReader::new(
            self.source.clone(),
            self.replication_options(stream),
            self.stream_options.clone(),
        );
        let result = self.consume(&mut reader, stream, id, stats, &stop).await;
        reader.close();
        if let Some(timer) = timer {
            timer.abort();
        }
        result
    }

    async fn consume(
        &self,
        reader: &mut StreamReader,
        stream: &StreamConfig,
        id: &StateID,
        stats: &mut RunStats,
        stop: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut streamed = 0u64;
        loop {
            match reader.next(stop).await? {
                StreamEvent::Changes(batch) => {
                    if batch.dropped > 0 {
                        warn!("Dropped {} malformed changes from {}", batch.dropped, stream.slot);
                    }
                    let shaped = shape_events(stream, &self.dataset, &batch.events);
                    self.merge(&shaped, stats).await?;
                    self.acknowledge(reader, id, batch.commit_lsn).await?;

                    streamed += batch.events.len() as u64;
                    info!(
                        "Streamed {} changes from {} up to {}",
                        batch.events.len(),
                        stream.slot,
                        batch.commit_lsn
                    );
                    if self.config.max_records.is_some_and(|max| streamed >= max) {
                        info!("Reached the record limit on {}", stream.slot);
                        break;
                    }
                }
                StreamEvent::Idle => {
                    if self.config.stop_when_caught_up {
                        info!("Replication slot {} is caught up", stream.slot);
                        break;
                    }
                }
                StreamEvent::Closed => break,
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, reader: &mut StreamReader, id: &StateID, lsn: Lsn) -> anyhow::Result<()> {
        reader.acknowledge(lsn).await?;
        save_checkpoint(
            self.state.checkpoints().as_ref(),
            &id.scope(),
            SyncPhase::Acknowledged,
            &PostgreSQLLogicalCheckpoint::new(lsn),
        )
        .await
    }

    async fn run_stream(
        &self,
        stream: &StreamConfig,
        stats: &mut RunStats,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let id = self.state_id(stream);
        if self.needs_snapshot(stream, &id).await? {
            info!("Taking initial snapshot through {}", stream.slot);
            self.snapshot(stream, &id, stats, cancel).await?;
        }
        info!("Streaming logical changes from {}", stream.slot);
        self.stream(stream, &id, stats, cancel).await
    }
}

#[async_trait]
impl SyncPipeline for CdcPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunStats> {
        // A tailing stream only returns on shutdown, so streams cannot wait
        // for each other.
        let runs = self.config.streams.iter().map(|stream| async move {
            let mut stats = RunStats::default();
            if cancel.is_cancelled() {
                return (stats, Ok(()));
            }
            let started = Instant::now();
            let result = self
                .run_stream(stream, &mut stats, cancel)
                .await
                .with_context(|| format!("Replication stream on slot {} failed", stream.slot));
            debug!("Slot {} done in {:?}", stream.slot, started.elapsed());
            (stats, result)
        });

        let mut total = RunStats::default();
        let mut errors = Vec::new();
        for (stats, result) in futures::future::join_all(runs).await {
            total.absorb(stats);
            if let Err(e) = result {
                error!("{e:#}");
                errors.push(e);
            }
        }
        combine_errors(errors, self.config.streams.len(), "streams")?;
        Ok(total)
    }

    async fn reset(&self) -> anyhow::Result<()> {
        for stream in &self.config.streams {
            self.source
                .drop_replication(&self.replication_options(stream))
                .await
                .with_context(|| format!("Failed to drop replication slot {}", stream.slot))?;
            self.state.remove(&self.state_id(stream)).await?;
            info!("Reset replication slot {}", stream.slot);
        }
        Ok(())
    }
}
