//! Where a batch pull resumes.
//!
//! The watermark is never stored on its own: it is the maximum of the
//! tracking column in the already-loaded destination table, recomputed on
//! every run. Anything that prevents reading it degrades to a full load.

use clickhouse_sink::Warehouse;
use tracing::{debug, warn};

/// Current watermark of `column` in destination `table`.
///
/// `None` means "load everything": the table does not exist yet, is empty,
/// or the maximum could not be read.
pub async fn get_watermark<W>(warehouse: &W, table: &str, column: &str) -> Option<String>
where
    W: Warehouse + ?Sized,
{
    match warehouse.table_exists(table).await {
        Ok(true) => {}
        Ok(false) => {
            debug!("Destination table {table} does not exist yet, doing a full load");
            return None;
        }
        Err(e) => {
            warn!("Could not check whether {table} exists, a full load may be performed: {e}");
            return None;
        }
    }

    match warehouse.max_value(table, column).await {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Could not get last value for column {column} in table {table}. \
                 Full load may be performed. Error: {e}"
            );
            None
        }
    }
}
