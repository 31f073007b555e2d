//! Document store seam
//!
//! `DocumentStore::flush` takes many alerts' write batches at once and
//! answers with one outcome per alert once the store acknowledged.
//! Auto-complete history is read through `AcceptanceLedger` so it survives
//! restarts and is shared between consumer processes.

pub mod pragma;
pub mod sqlite;

use crate::alert::StockId;
use crate::error::StoreError;
use crate::ingest::{AlertBatch, AlertWriteOutcome};
use async_trait::async_trait;
use std::sync::Arc;

pub use sqlite::SqliteStore;

/// "Has stock S ever been accepted by channel C?"
pub trait AcceptanceLedger: Send + Sync {
    fn has_accepted(&self, stock: StockId, channel: &str) -> Result<bool, StoreError>;

    fn stocks_accepted_by(&self, channel: &str) -> Result<Vec<StockId>, StoreError>;
}

#[async_trait]
pub trait DocumentStore: AcceptanceLedger {
    /// Applies every batch in one unit of work
    ///
    /// `Err` is reserved for batch-level failures: `Transient` means nothing
    /// was committed and the same batches may be retried. Per-op schema
    /// violations are reported inside the returned outcomes.
    async fn flush(&self, batches: &[AlertBatch]) -> Result<Vec<AlertWriteOutcome>, StoreError>;

    fn backend_type(&self) -> &'static str;
}

/// A document store seen only as its acceptance history
#[derive(Clone)]
pub struct StoreLedger(pub Arc<dyn DocumentStore>);

impl AcceptanceLedger for StoreLedger {
    fn has_accepted(&self, stock: StockId, channel: &str) -> Result<bool, StoreError> {
        self.0.has_accepted(stock, channel)
    }

    fn stocks_accepted_by(&self, channel: &str) -> Result<Vec<StockId>, StoreError> {
        self.0.stocks_accepted_by(channel)
    }
}
