//! Sync orchestrator.
//!
//! Runs the configured pipelines one after another. A failing pipeline does
//! not stop the others, so a single run reports every problem, but it does
//! fail the run as a whole. Reconciliation hooks only run after every
//! pipeline succeeded.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use sync_core::SyncError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::reconcile::ReconciliationHook;

/// Rows merged by one pipeline run, per destination table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub rows_merged: u64,
    pub tables: BTreeMap<String, u64>,
}

impl RunStats {
    pub fn record(&mut self, table: &str, rows: u64) {
        self.rows_merged += rows;
        *self.tables.entry(table.to_string()).or_default() += rows;
    }

    /// Add the counts of another run over the same pipeline.
    pub fn absorb(&mut self, other: RunStats) {
        for (table, rows) in other.tables {
            self.record(&table, rows);
        }
    }
}

/// Fold the failures of `total` independent steps into one error. A
/// configuration error is preferred so it decides the exit code.
pub fn combine_errors(mut errors: Vec<anyhow::Error>, total: usize, what: &str) -> anyhow::Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let failed = errors.len();
    let pick = errors
        .iter()
        .position(|e| crate::is_config_error(e))
        .unwrap_or(0);
    let err = errors.swap_remove(pick);
    Err(err.context(format!("{failed} of {total} {what} failed")))
}

/// One configured pipeline.
#[async_trait]
pub trait SyncPipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the destination up to date.
    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunStats>;

    /// Forget all progress so the next run starts over. Pipelines whose
    /// progress lives in the destination have nothing to forget.
    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub name: String,
    pub result: anyhow::Result<RunStats>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<PipelineOutcome>,
    /// Set when a reconciliation hook failed.
    pub reconciliation: Option<anyhow::Error>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
            + usize::from(self.reconciliation.is_some())
    }

    pub fn rows_merged(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|s| s.rows_merged)
            .sum()
    }

    /// Collapse the report into a single result.
    pub fn into_result(self) -> anyhow::Result<()> {
        let total = self.outcomes.len();
        let errors: Vec<anyhow::Error> = self
            .outcomes
            .into_iter()
            .filter_map(|o| o.result.err())
            .chain(self.reconciliation)
            .collect();
        combine_errors(errors, total, "pipelines")
    }
}

pub struct Orchestrator {
    pipelines: Vec<Box<dyn SyncPipeline>>,
    hooks: Vec<Box<dyn ReconciliationHook>>,
    skip_reconciliation: bool,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            pipelines: Vec::new(),
            hooks: Vec::new(),
            skip_reconciliation: false,
        }
    }

    pub fn add_pipeline(&mut self, pipeline: Box<dyn SyncPipeline>) {
        self.pipelines.push(pipeline);
    }

    pub fn add_hook(&mut self, hook: Box<dyn ReconciliationHook>) {
        self.hooks.push(hook);
    }

    pub fn skip_reconciliation(&mut self, skip: bool) {
        self.skip_reconciliation = skip;
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &dyn SyncPipeline> {
        self.pipelines.iter().map(|p| p.as_ref())
    }

    fn select(&self, names: &[String]) -> anyhow::Result<Vec<&dyn SyncPipeline>> {
        if names.is_empty() {
            return Ok(self.pipelines().collect());
        }
        names
            .iter()
            .map(|name| {
                self.pipelines()
                    .find(|p| p.name() == name)
                    .ok_or_else(|| SyncError::config(format!("Unknown pipeline '{name}'")).into())
            })
            .collect()
    }

    /// Run the selected pipelines (all of them when `names` is empty).
    pub async fn run(&self, names: &[String], cancel: &CancellationToken) -> anyhow::Result<RunReport> {
        let selected = self.select(names)?;
        let mut report = RunReport::default();

        for pipeline in selected {
            if cancel.is_cancelled() {
                info!("Shutdown requested, skipping {}", pipeline.name());
                continue;
            }
            info!("{} pipeline started", pipeline.name());
            let started = Instant::now();
            let result = pipeline.run(cancel).await;
            let elapsed = started.elapsed().as_secs_f64();

            match &result {
                Ok(stats) => {
                    for (table, rows) in &stats.tables {
                        info!("{}: {rows} rows merged into {table}", pipeline.name());
                    }
                    info!("{}: Run finished in {elapsed:.2} seconds", pipeline.name());
                }
                Err(e) => error!("{} pipeline failed after {elapsed:.2} seconds: {e:#}", pipeline.name()),
            }
            report.outcomes.push(PipelineOutcome {
                name: pipeline.name().to_string(),
                result,
            });
        }

        if report.failed() == 0 && !cancel.is_cancelled() {
            report.reconciliation = self.reconcile().await.err();
        }
        Ok(report)
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        if self.skip_reconciliation {
            info!("Skipping ClickHouse cleanup ({} is set)", crate::reconcile::SKIP_ENV);
            return Ok(());
        }
        for hook in &self.hooks {
            if let Err(e) = hook.reconcile().await {
                error!("Cleanup {} failed: {e:#}", hook.name());
                return Err(e.context(format!("Cleanup {} failed", hook.name())));
            }
        }
        Ok(())
    }

    /// Run every `interval` until cancelled. A failing tick is logged and
    /// the loop carries on.
    pub async fn run_every(
        &self,
        names: &[String],
        interval: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        // Fail fast on names that can never resolve
        self.select(names)?;
        loop {
            match self.run(names, cancel).await.and_then(RunReport::into_result) {
                Ok(()) => info!("Scheduled run succeeded"),
                Err(e) => error!("Scheduled run failed: {e:#}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutting down scheduler");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    pub async fn reset(&self, name: &str) -> anyhow::Result<()> {
        let names = [name.to_string()];
        for pipeline in self.select(&names)? {
            pipeline.reset().await?;
            info!("Pipeline {} reset; the next run starts over", pipeline.name());
        }
        Ok(())
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: String,
        fail: Option<fn() -> anyhow::Error>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SyncPipeline for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _cancel: &CancellationToken) -> anyhow::Result<RunStats> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                Some(make) => Err(make()),
                None => {
                    let mut stats = RunStats::default();
                    stats.record(&format!("pg___{}", self.name), 5);
                    Ok(stats)
                }
            }
        }
    }

    struct CountingHook(Arc<AtomicUsize>);

    #[async_trait]
    impl ReconciliationHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn reconcile(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scripted(name: &str, fail: Option<fn() -> anyhow::Error>, runs: &Arc<AtomicUsize>) -> Box<dyn SyncPipeline> {
        Box::new(Scripted {
            name: name.to_string(),
            fail,
            runs: runs.clone(),
        })
    }

    fn query_failure() -> anyhow::Error {
        anyhow::anyhow!("relation \"orders\" does not exist")
    }

    fn config_failure() -> anyhow::Error {
        SyncError::config("wal_level is 'replica', must be 'logical'").into()
    }

    #[tokio::test]
    async fn test_all_pipelines_run_and_hooks_follow() {
        let runs = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_pipeline(scripted("a", None, &runs));
        orchestrator.add_pipeline(scripted("b", None, &runs));
        orchestrator.add_hook(Box::new(CountingHook(hooks.clone())));

        let report = orchestrator.run(&[], &CancellationToken::new()).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(report.rows_merged(), 10);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_one_failure_fails_the_run_but_others_still_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_pipeline(scripted("a", Some(query_failure), &runs));
        orchestrator.add_pipeline(scripted("b", None, &runs));
        orchestrator.add_hook(Box::new(CountingHook(hooks.clone())));

        let report = orchestrator.run(&[], &CancellationToken::new()).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
        assert_eq!(report.failed(), 1);
        let err = report.into_result().unwrap_err();
        assert!(format!("{err:#}").contains("1 of 2 pipelines failed"));
        assert_eq!(crate::exit_code(&err), 2);
    }

    #[tokio::test]
    async fn test_configuration_error_decides_exit_code() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_pipeline(scripted("a", Some(query_failure), &runs));
        orchestrator.add_pipeline(scripted("b", Some(config_failure), &runs));

        let err = orchestrator
            .run(&[], &CancellationToken::new())
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(crate::exit_code(&err), 1);
    }

    #[tokio::test]
    async fn test_selection_by_name() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_pipeline(scripted("a", None, &runs));
        orchestrator.add_pipeline(scripted("b", None, &runs));

        let report = orchestrator
            .run(&["b".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].name, "b");

        let err = orchestrator
            .run(&["c".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(crate::exit_code(&err), 1);
    }

    #[tokio::test]
    async fn test_skip_reconciliation() {
        let runs = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_pipeline(scripted("a", None, &runs));
        orchestrator.add_hook(Box::new(CountingHook(hooks.clone())));
        orchestrator.skip_reconciliation(true);

        orchestrator.run(&[], &CancellationToken::new()).await.unwrap();
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_combined_error_counts_failures_and_prefers_configuration() {
        assert!(combine_errors(Vec::new(), 3, "tables").is_ok());

        let err = combine_errors(vec![query_failure(), config_failure()], 3, "tables").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("2 of 3 tables failed"));
        assert!(message.contains("wal_level"));
        assert_eq!(crate::exit_code(&err), 1);
    }

    #[test]
    fn test_absorb_adds_per_table_counts() {
        let mut total = RunStats::default();
        total.record("pg___orders", 2);
        let mut other = RunStats::default();
        other.record("pg___orders", 3);
        other.record("pg___users", 1);

        total.absorb(other);
        assert_eq!(total.rows_merged, 6);
        assert_eq!(total.tables["pg___orders"], 5);
        assert_eq!(total.tables["pg___users"], 1);
    }

    #[tokio::test]
    async fn test_run_every_stops_on_cancel() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.add_pipeline(scripted("a", None, &runs));

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        orchestrator
            .run_every(&[], Duration::from_secs(3600), &cancel)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
