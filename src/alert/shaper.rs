use super::{CanonicalAlert, IdentityCache, Measurement, MeasurementKind, RawAlert};
use crate::error::ShapeError;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Turns supplier records into canonical alerts
///
/// Identity is resolved before anything else, so a malformed measurement
/// still leaves the resolution counted.
pub struct AlertShaper {
    identities: IdentityCache,
    resolutions: u64,
}

impl AlertShaper {
    pub fn new(identities: IdentityCache) -> Self {
        Self {
            identities,
            resolutions: 0,
        }
    }

    pub fn shape(&mut self, raw: RawAlert) -> Result<CanonicalAlert, ShapeError> {
        let stock = self.identities.resolve(&raw.object_id)?;
        self.resolutions += 1;

        let mut points = Vec::new();
        let mut limits = Vec::new();

        for entry in std::iter::once(&raw.candidate).chain(raw.prv_candidates.iter()) {
            let measurement = parse_measurement(raw.alert_id, entry)?;
            match measurement.kind {
                MeasurementKind::Point => {
                    if !points
                        .iter()
                        .any(|p: &Measurement| p.natural_id == measurement.natural_id)
                    {
                        points.push(measurement);
                    }
                }
                MeasurementKind::Limit => limits.push(measurement),
            }
        }

        points.sort_by(|a, b| a.jd.total_cmp(&b.jd));
        limits.sort_by(|a, b| a.jd.total_cmp(&b.jd));

        let native_id = raw.object_id.clone();
        Ok(CanonicalAlert::new(
            raw.alert_id,
            stock,
            native_id,
            points,
            limits,
            Arc::new(raw),
        ))
    }

    /// Identity resolutions performed so far, one per shaped alert
    pub fn resolutions(&self) -> u64 {
        self.resolutions
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.identities
    }
}

impl Default for AlertShaper {
    fn default() -> Self {
        Self::new(IdentityCache::default())
    }
}

fn parse_measurement(alert_id: u64, entry: &Map<String, Value>) -> Result<Measurement, ShapeError> {
    let invalid = |reason: &str| ShapeError::InvalidMeasurement {
        alert_id,
        reason: reason.to_string(),
    };

    let jd = entry
        .get("jd")
        .and_then(Value::as_f64)
        .filter(|jd| jd.is_finite())
        .ok_or_else(|| invalid("missing numeric jd"))?;

    let natural_id = match entry.get("candid") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(id) if id > 0 => Some(id),
            _ => return Err(invalid("candid is not a positive integer")),
        },
    };

    let has_magnitude = matches!(entry.get("magpsf"), Some(v) if !v.is_null());
    let kind = match natural_id {
        Some(_) if has_magnitude => MeasurementKind::Point,
        _ => MeasurementKind::Limit,
    };

    let fid = entry.get("fid").and_then(Value::as_i64);
    let pid = entry.get("pid").and_then(Value::as_i64);
    let source = format!(
        "{}:{}",
        fid.map(|v| v.to_string()).unwrap_or_default(),
        pid.map(|v| v.to_string()).unwrap_or_default()
    );

    Ok(Measurement {
        kind,
        // only points keep their natural id downstream
        natural_id: if kind == MeasurementKind::Point { natural_id } else { None },
        jd,
        source,
        fid,
        body: entry.clone(),
    })
}
