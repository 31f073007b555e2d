//! Accepted-alert ingestion
//!
//! ```text
//! CanonicalAlert + IngestSelection
//!     → DataPointShaper   (measurement records, synthesized limit ids)
//!     → ChainedIngestionHandler
//!         ├─ stock op
//!         ├─ measurement ops
//!         └─ derived ops per category, each through the Compiler
//!     → UpdatesBuffer → DocumentStore::flush (one transaction per flush)
//! ```

pub mod compiler;
pub mod datapoint;
pub mod doc_ingester;
pub mod handler;

use crate::alert::StockId;
use crate::error::StoreError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub use compiler::{CompileRequest, CompiledOp, Compiler};
pub use datapoint::{synthesize_limit_id, DataPointShaper, TagRules};
pub use doc_ingester::{DocIngester, MeasurementIngester, StockIngester, T2Ingester};
pub use handler::{ChainedIngestionHandler, UpdatesBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DocCategory {
    Stock,
    Measurement,
    StockT2,
    PointT2,
    StateT2,
}

impl DocCategory {
    pub const DERIVED: [DocCategory; 3] = [DocCategory::StockT2, DocCategory::PointT2, DocCategory::StateT2];

    pub fn table(&self) -> &'static str {
        match self {
            DocCategory::Stock => "stock",
            DocCategory::Measurement => "measurement",
            DocCategory::StockT2 => "t2_stock",
            DocCategory::PointT2 => "t2_point",
            DocCategory::StateT2 => "t2_state",
        }
    }

    pub fn is_derived(&self) -> bool {
        Self::DERIVED.contains(self)
    }
}

impl std::fmt::Display for DocCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// Stored form of one point or limit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    /// Positive natural id for points, synthesized negative id for limits
    pub id: i64,
    pub stock: StockId,
    pub jd: f64,
    /// Accepting channels
    pub channels: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StockDoc {
    pub id: StockId,
    pub native_id: String,
    pub channels: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub alert_id: u64,
    pub last_jd: Option<f64>,
}

/// Content of a derived document; its canonical bytes are the merge key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct T2Content {
    pub category: DocCategory,
    pub stock: StockId,
    pub unit: String,
    pub config: Value,
    /// Stock id, measurement id or state hash, depending on the category
    pub link: String,
    pub link_members: Vec<i64>,
    /// Combine unit that produced a state link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combiner: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct T2Doc {
    /// Hex digest of the content bytes; natural key in the store
    pub key: String,
    pub content: T2Content,
    pub channels: BTreeSet<String>,
    /// Union of the requesting channels' tags
    pub tags: BTreeSet<String>,
    pub groups: BTreeSet<u32>,
    pub group_conflict: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Stock(StockDoc),
    Measurement(MeasurementRecord),
    T2(T2Doc),
}

impl WriteOp {
    pub fn category(&self) -> DocCategory {
        match self {
            WriteOp::Stock(_) => DocCategory::Stock,
            WriteOp::Measurement(_) => DocCategory::Measurement,
            WriteOp::T2(doc) => doc.content.category,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Merged,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Applied(Applied),
    Failed(StoreError),
    /// Not attempted because the stock or a measurement op failed
    Skipped,
}

/// All write operations of one accepted alert, in mandatory order
#[derive(Debug, Clone, PartialEq)]
pub struct AlertBatch {
    pub alert_id: u64,
    pub stock: StockId,
    pub ops: Vec<WriteOp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertWriteOutcome {
    pub alert_id: u64,
    pub stock: StockId,
    pub ops: Vec<(DocCategory, OpOutcome)>,
}

impl AlertWriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.ops
            .iter()
            .all(|(_, outcome)| matches!(outcome, OpOutcome::Applied(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&DocCategory, &StoreError)> {
        self.ops.iter().filter_map(|(category, outcome)| match outcome {
            OpOutcome::Failed(e) => Some((category, e)),
            _ => None,
        })
    }

    pub fn count(&self, wanted: &OpOutcome) -> usize {
        self.ops.iter().filter(|(_, o)| o == wanted).count()
    }
}
