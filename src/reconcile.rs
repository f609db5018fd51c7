//! Post-merge reconciliation.
//!
//! Cleanup that depends on business rules (orphaned or duplicated rows across
//! destination tables) runs after every pipeline of a run has succeeded.

use async_trait::async_trait;
use clickhouse_sink::Warehouse;
use std::sync::Arc;
use tracing::info;

/// Set to skip reconciliation entirely.
pub const SKIP_ENV: &str = "SKIP_CH_CLEANUP";

#[async_trait]
pub trait ReconciliationHook: Send + Sync {
    fn name(&self) -> &str;

    async fn reconcile(&self) -> anyhow::Result<()>;
}

/// Runs a fixed list of statements against the destination, in order.
pub struct SqlReconciliation {
    name: String,
    warehouse: Arc<dyn Warehouse>,
    statements: Vec<String>,
}

impl SqlReconciliation {
    pub fn new(name: impl Into<String>, warehouse: Arc<dyn Warehouse>, statements: Vec<String>) -> Self {
        Self {
            name: name.into(),
            warehouse,
            statements,
        }
    }
}

#[async_trait]
impl ReconciliationHook for SqlReconciliation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        if self.statements.is_empty() {
            return Ok(());
        }
        info!("Running {} cleanup statements for {}", self.statements.len(), self.name);
        for sql in &self.statements {
            self.warehouse.execute(sql).await?;
        }
        info!("Cleanup for {} finished", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickhouse_sink::MemoryWarehouse;

    #[tokio::test]
    async fn test_statements_run_in_order() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let hook = SqlReconciliation::new(
            "travel",
            warehouse.clone(),
            vec![
                "DELETE FROM travel.a WHERE x = 1".to_string(),
                "DELETE FROM travel.b WHERE y = 2".to_string(),
            ],
        );
        hook.reconcile().await.unwrap();
        assert_eq!(
            warehouse.statements(),
            vec![
                "DELETE FROM travel.a WHERE x = 1".to_string(),
                "DELETE FROM travel.b WHERE y = 2".to_string(),
            ]
        );
    }
}
