use super::MeasurementRecord;
use crate::alert::{CanonicalAlert, Measurement, MeasurementKind, StockId};
use crate::filter::IngestSelection;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Tags attached to every shaped measurement
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TagRules {
    #[serde(default)]
    pub base: Vec<String>,
    #[serde(default)]
    pub point: Vec<String>,
    #[serde(default)]
    pub limit: Vec<String>,
    #[serde(default)]
    pub by_fid: BTreeMap<i64, Vec<String>>,
}

impl Default for TagRules {
    fn default() -> Self {
        Self {
            base: vec!["ZTF".to_string()],
            point: vec![],
            limit: vec!["UPPER_LIMIT".to_string()],
            by_fid: BTreeMap::from([
                (1, vec!["ZTF_G".to_string()]),
                (2, vec!["ZTF_R".to_string()]),
                (3, vec!["ZTF_I".to_string()]),
            ]),
        }
    }
}

impl TagRules {
    fn tags_for(&self, measurement: &Measurement) -> BTreeSet<String> {
        let kind_tags = match measurement.kind {
            MeasurementKind::Point => &self.point,
            MeasurementKind::Limit => &self.limit,
        };
        let fid_tags = measurement
            .fid
            .and_then(|fid| self.by_fid.get(&fid))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        self.base
            .iter()
            .chain(kind_tags.iter())
            .chain(fid_tags.iter())
            .cloned()
            .collect()
    }
}

/// Deterministic negative id for a limit lacking a natural one
///
/// First 8 bytes of SHA-256 over `"{stock}|{jd bits}|{source}"`, reduced to
/// 63 bits and negated. Never 0, never collides with a positive point id.
pub fn synthesize_limit_id(stock: StockId, jd: f64, source: &str) -> i64 {
    let digest = Sha256::digest(format!("{}|{}|{}", stock.0, jd.to_bits(), source).as_bytes());

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(prefix) & (i64::MAX as u64);

    -(value.max(1) as i64)
}

/// Turns an accepted alert's measurements into store records
#[derive(Debug, Clone, Default)]
pub struct DataPointShaper {
    rules: TagRules,
}

impl DataPointShaper {
    pub fn new(rules: TagRules) -> Self {
        Self { rules }
    }

    /// Points then limits, each jd-ascending, one record per id
    pub fn shape(&self, alert: &CanonicalAlert, selection: &IngestSelection) -> Vec<MeasurementRecord> {
        let channels = selection.channels();
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(alert.points.len() + alert.limits.len());

        for measurement in alert.points.iter().chain(alert.limits.iter()) {
            let id = match (measurement.kind, measurement.natural_id) {
                (MeasurementKind::Point, Some(id)) => id,
                _ => synthesize_limit_id(alert.stock, measurement.jd, &measurement.source),
            };

            if !seen.insert(id) {
                continue;
            }

            records.push(MeasurementRecord {
                id,
                stock: alert.stock,
                jd: measurement.jd,
                channels: channels.clone(),
                tags: self.rules.tags_for(measurement),
                body: measurement.body.clone(),
            });
        }

        records
    }
}
