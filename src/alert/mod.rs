//! Alert model: raw supplier records and their canonical, identity-resolved form
//!
//! ```text
//! AlertSupplier → RawAlert → AlertShaper → CanonicalAlert
//!                                              ├─ points  (natural ids)
//!                                              ├─ limits  (synthesized ids later)
//!                                              ├─ raw     (shared, immutable)
//!                                              └─ annotations (mutable side-table)
//! ```

pub mod identity;
pub mod shaper;
pub mod supplier;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

pub use identity::{Base62Identity, IdentityCache, IdentityScheme, ZtfIdentity};
pub use shaper::AlertShaper;
pub use supplier::{AlertSupplier, FilteringAlertSupplier, JsonlAlertSupplier, VecAlertSupplier};

/// Stable numeric identity of an astronomical object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockId(pub u64);

impl std::fmt::Display for StockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instrument-shaped alert as produced by a supplier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAlert {
    pub alert_id: u64,
    /// Identity hint (native object id)
    pub object_id: String,
    pub candidate: Map<String, Value>,
    #[serde(default)]
    pub prv_candidates: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Point,
    Limit,
}

/// One entry of an alert's measurement history
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub kind: MeasurementKind,
    pub natural_id: Option<i64>,
    pub jd: f64,
    /// `"{fid}:{pid}"`, empty parts when absent
    pub source: String,
    pub fid: Option<i64>,
    pub body: Map<String, Value>,
}

/// Mutable per-alert side-table; tags gathered after acceptance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    pub tags: BTreeSet<String>,
}

impl Annotations {
    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalAlert {
    pub alert_id: u64,
    pub stock: StockId,
    pub native_id: String,
    pub points: Vec<Measurement>,
    pub limits: Vec<Measurement>,
    raw: Arc<RawAlert>,
    annotations: Annotations,
}

impl CanonicalAlert {
    pub fn new(
        alert_id: u64,
        stock: StockId,
        native_id: String,
        points: Vec<Measurement>,
        limits: Vec<Measurement>,
        raw: Arc<RawAlert>,
    ) -> Self {
        Self {
            alert_id,
            stock,
            native_id,
            points,
            limits,
            raw,
            annotations: Annotations::default(),
        }
    }

    pub fn raw(&self) -> &RawAlert {
        &self.raw
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    /// Latest timestamp over points and limits
    pub fn latest_jd(&self) -> Option<f64> {
        self.points
            .iter()
            .chain(self.limits.iter())
            .map(|m| m.jd)
            .fold(None, |acc, jd| match acc {
                Some(max) if max >= jd => Some(max),
                _ => Some(jd),
            })
    }
}
