//! Per-category upserts
//!
//! Every upsert is insert-if-absent followed by a set-union merge of
//! channels/tags/alerts and `max()` of monotone fields. Nothing is ever
//! deleted or overwritten, so replaying an operation is harmless.

use super::compiler::merge_groups;
use super::{Applied, DocCategory, WriteOp};
use crate::error::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;

pub trait DocIngester: Send + Sync {
    fn category(&self) -> DocCategory;

    fn upsert(&self, conn: &Connection, op: &WriteOp) -> Result<Applied, StoreError>;
}

fn encode_set<T: Serialize>(set: &BTreeSet<T>) -> Result<String, StoreError> {
    Ok(serde_json::to_string(set)?)
}

fn decode_set<T: DeserializeOwned + Ord>(json: &str) -> Result<BTreeSet<T>, StoreError> {
    Ok(serde_json::from_str(json)?)
}

fn union<T: Ord + Clone>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> BTreeSet<T> {
    a.union(b).cloned().collect()
}

fn max_jd(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn wrong_op(ingester: DocCategory, op: &WriteOp) -> StoreError {
    StoreError::Schema(format!("{} ingester received {} operation", ingester, op.category()))
}

pub struct StockIngester;

impl DocIngester for StockIngester {
    fn category(&self) -> DocCategory {
        DocCategory::Stock
    }

    fn upsert(&self, conn: &Connection, op: &WriteOp) -> Result<Applied, StoreError> {
        let WriteOp::Stock(doc) = op else {
            return Err(wrong_op(self.category(), op));
        };
        let id = doc.id.0 as i64;
        let alerts = BTreeSet::from([doc.alert_id]);

        for channel in &doc.channels {
            conn.execute(
                "INSERT OR IGNORE INTO stock_channel (stock, channel) VALUES (?1, ?2)",
                params![id, channel],
            )?;
        }

        let existing = conn
            .query_row(
                "SELECT native_id, channels, tags, alerts, last_jd FROM stock WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((native_id, channels, tags, stored_alerts, last_jd)) = existing else {
            conn.execute(
                "INSERT INTO stock (id, native_id, channels, tags, alerts, last_jd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    doc.native_id,
                    encode_set(&doc.channels)?,
                    encode_set(&doc.tags)?,
                    encode_set(&alerts)?,
                    doc.last_jd,
                ],
            )?;
            return Ok(Applied::Inserted);
        };

        if native_id != doc.native_id {
            return Err(StoreError::Schema(format!(
                "stock {} already bound to native id {}, not {}",
                id, native_id, doc.native_id
            )));
        }

        let old_channels: BTreeSet<String> = decode_set(&channels)?;
        let old_tags: BTreeSet<String> = decode_set(&tags)?;
        let old_alerts: BTreeSet<u64> = decode_set(&stored_alerts)?;

        let new_channels = union(&old_channels, &doc.channels);
        let new_tags = union(&old_tags, &doc.tags);
        let new_alerts = union(&old_alerts, &alerts);
        let new_jd = max_jd(last_jd, doc.last_jd);

        if new_channels == old_channels && new_tags == old_tags && new_alerts == old_alerts && new_jd == last_jd {
            return Ok(Applied::Unchanged);
        }

        conn.execute(
            "UPDATE stock SET channels = ?2, tags = ?3, alerts = ?4, last_jd = ?5 WHERE id = ?1",
            params![
                id,
                encode_set(&new_channels)?,
                encode_set(&new_tags)?,
                encode_set(&new_alerts)?,
                new_jd,
            ],
        )?;
        Ok(Applied::Merged)
    }
}

pub struct MeasurementIngester;

impl DocIngester for MeasurementIngester {
    fn category(&self) -> DocCategory {
        DocCategory::Measurement
    }

    fn upsert(&self, conn: &Connection, op: &WriteOp) -> Result<Applied, StoreError> {
        let WriteOp::Measurement(record) = op else {
            return Err(wrong_op(self.category(), op));
        };
        let stock = record.stock.0 as i64;

        let existing = conn
            .query_row(
                "SELECT stock, channels, tags FROM measurement WHERE id = ?1",
                params![record.id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((stored_stock, channels, tags)) = existing else {
            conn.execute(
                "INSERT INTO measurement (id, stock, channels, tags, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    stock,
                    encode_set(&record.channels)?,
                    encode_set(&record.tags)?,
                    serde_json::to_string(&record.body)?,
                ],
            )?;
            return Ok(Applied::Inserted);
        };

        if stored_stock != stock {
            return Err(StoreError::Schema(format!(
                "measurement {} belongs to stock {}, not {}",
                record.id, stored_stock, stock
            )));
        }

        let old_channels: BTreeSet<String> = decode_set(&channels)?;
        let old_tags: BTreeSet<String> = decode_set(&tags)?;
        let new_channels = union(&old_channels, &record.channels);
        let new_tags = union(&old_tags, &record.tags);

        if new_channels == old_channels && new_tags == old_tags {
            return Ok(Applied::Unchanged);
        }

        conn.execute(
            "UPDATE measurement SET channels = ?2, tags = ?3 WHERE id = ?1",
            params![record.id, encode_set(&new_channels)?, encode_set(&new_tags)?],
        )?;
        Ok(Applied::Merged)
    }
}

/// Derived documents; one instance per derived category
pub struct T2Ingester {
    category: DocCategory,
}

impl T2Ingester {
    pub fn new(category: DocCategory) -> Result<Self, StoreError> {
        if !category.is_derived() {
            return Err(StoreError::Fatal(format!("{} is not a derived category", category)));
        }
        Ok(Self { category })
    }
}

impl DocIngester for T2Ingester {
    fn category(&self) -> DocCategory {
        self.category
    }

    fn upsert(&self, conn: &Connection, op: &WriteOp) -> Result<Applied, StoreError> {
        let doc = match op {
            WriteOp::T2(doc) if doc.content.category == self.category => doc,
            _ => return Err(wrong_op(self.category, op)),
        };
        let table = self.category.table();

        let existing = conn
            .query_row(
                &format!("SELECT channels, tags, groups, group_conflict FROM {} WHERE key = ?1", table),
                params![doc.key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((channels, tags, groups, conflict)) = existing else {
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, stock, unit, config, link, link_members, combiner, channels, tags, groups, group_conflict)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    table
                ),
                params![
                    doc.key,
                    doc.content.stock.0 as i64,
                    doc.content.unit,
                    serde_json::to_string(&doc.content.config)?,
                    doc.content.link,
                    serde_json::to_string(&doc.content.link_members)?,
                    doc.content.combiner,
                    encode_set(&doc.channels)?,
                    encode_set(&doc.tags)?,
                    encode_set(&doc.groups)?,
                    doc.group_conflict,
                ],
            )?;
            return Ok(Applied::Inserted);
        };

        let old_channels: BTreeSet<String> = decode_set(&channels)?;
        let old_tags: BTreeSet<String> = decode_set(&tags)?;
        let old_groups: BTreeSet<u32> = decode_set(&groups)?;

        let new_channels = union(&old_channels, &doc.channels);
        let new_tags = union(&old_tags, &doc.tags);
        let (new_groups, merge_conflict) = merge_groups(&old_groups, &doc.groups);
        let new_conflict = conflict || doc.group_conflict || merge_conflict;

        if new_channels == old_channels
            && new_tags == old_tags
            && new_groups == old_groups
            && new_conflict == conflict
        {
            return Ok(Applied::Unchanged);
        }

        if merge_conflict && !conflict {
            log::warn!(
                "⚠️  Group conflict on stored {} {}: {:?} vs {:?}, keeping union",
                table,
                doc.key,
                old_groups,
                doc.groups
            );
        }

        conn.execute(
            &format!(
                "UPDATE {} SET channels = ?2, tags = ?3, groups = ?4, group_conflict = ?5 WHERE key = ?1",
                table
            ),
            params![
                doc.key,
                encode_set(&new_channels)?,
                encode_set(&new_tags)?,
                encode_set(&new_groups)?,
                new_conflict,
            ],
        )?;
        Ok(Applied::Merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::StockId;
    use crate::ingest::{MeasurementRecord, StockDoc, T2Content, T2Doc};
    use crate::store::sqlite::create_schema;
    use serde_json::json;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn stock_op(channels: &[&str], alert_id: u64, jd: f64) -> WriteOp {
        WriteOp::Stock(StockDoc {
            id: StockId(7),
            native_id: "X123".to_string(),
            channels: set(channels),
            tags: set(&["HU"]),
            alert_id,
            last_jd: Some(jd),
        })
    }

    #[test]
    fn test_stock_insert_merge_unchanged() {
        let conn = create_test_db();

        assert_eq!(StockIngester.upsert(&conn, &stock_op(&["A"], 1, 10.0)).unwrap(), Applied::Inserted);
        assert_eq!(StockIngester.upsert(&conn, &stock_op(&["A"], 1, 10.0)).unwrap(), Applied::Unchanged);
        assert_eq!(StockIngester.upsert(&conn, &stock_op(&["B"], 2, 9.0)).unwrap(), Applied::Merged);

        let (channels, alerts, last_jd): (String, String, f64) = conn
            .query_row("SELECT channels, alerts, last_jd FROM stock WHERE id = 7", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(channels, r#"["A","B"]"#);
        assert_eq!(alerts, "[1,2]");
        assert_eq!(last_jd, 10.0);

        let ledger: i64 = conn
            .query_row("SELECT COUNT(*) FROM stock_channel WHERE stock = 7", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ledger, 2);
    }

    #[test]
    fn test_stock_native_id_mismatch_is_schema_error() {
        let conn = create_test_db();
        StockIngester.upsert(&conn, &stock_op(&["A"], 1, 10.0)).unwrap();

        let mut op = stock_op(&["A"], 2, 11.0);
        if let WriteOp::Stock(doc) = &mut op {
            doc.native_id = "OTHER".to_string();
        }
        assert!(matches!(StockIngester.upsert(&conn, &op), Err(StoreError::Schema(_))));
    }

    #[test]
    fn test_measurement_keeps_first_body() {
        let conn = create_test_db();
        let record = MeasurementRecord {
            id: -99,
            stock: StockId(7),
            jd: 1.5,
            channels: set(&["A"]),
            tags: set(&["UPPER_LIMIT"]),
            body: json!({ "jd": 1.5 }).as_object().cloned().unwrap(),
        };

        assert_eq!(
            MeasurementIngester.upsert(&conn, &WriteOp::Measurement(record.clone())).unwrap(),
            Applied::Inserted
        );

        let mut other = record.clone();
        other.channels = set(&["B"]);
        other.body = json!({ "jd": 2.5 }).as_object().cloned().unwrap();
        assert_eq!(
            MeasurementIngester.upsert(&conn, &WriteOp::Measurement(other)).unwrap(),
            Applied::Merged
        );

        let body: String = conn
            .query_row("SELECT body FROM measurement WHERE id = -99", [], |row| row.get(0))
            .unwrap();
        assert_eq!(body, r#"{"jd":1.5}"#);

        let mut foreign = record;
        foreign.stock = StockId(8);
        assert!(matches!(
            MeasurementIngester.upsert(&conn, &WriteOp::Measurement(foreign)),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn test_t2_group_merge_flags_conflict() {
        let conn = create_test_db();
        let ingester = T2Ingester::new(DocCategory::StateT2).unwrap();
        let doc = |channel: &str, groups: &[u32]| t2_doc(channel, groups, &[]);

        assert_eq!(ingester.upsert(&conn, &doc("A", &[1])).unwrap(), Applied::Inserted);
        assert_eq!(ingester.upsert(&conn, &doc("B", &[2])).unwrap(), Applied::Merged);
        assert_eq!(ingester.upsert(&conn, &doc("B", &[2])).unwrap(), Applied::Unchanged);

        let (groups, conflict): (String, bool) = conn
            .query_row("SELECT groups, group_conflict FROM t2_state WHERE key = 'abc'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(groups, "[1,2]");
        assert!(conflict);
    }

    #[test]
    fn test_t2_tags_are_unioned() {
        let conn = create_test_db();
        let ingester = T2Ingester::new(DocCategory::StateT2).unwrap();

        assert_eq!(
            ingester.upsert(&conn, &t2_doc("A", &[], &["HU_SN"])).unwrap(),
            Applied::Inserted
        );
        assert_eq!(
            ingester.upsert(&conn, &t2_doc("A", &[], &["HU_SN", "RAPID"])).unwrap(),
            Applied::Merged
        );
        assert_eq!(
            ingester.upsert(&conn, &t2_doc("A", &[], &["RAPID"])).unwrap(),
            Applied::Unchanged
        );

        let tags: String = conn
            .query_row("SELECT tags FROM t2_state WHERE key = 'abc'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tags, r#"["HU_SN","RAPID"]"#);
    }

    fn t2_doc(channel: &str, groups: &[u32], tags: &[&str]) -> WriteOp {
        WriteOp::T2(T2Doc {
            key: "abc".to_string(),
            content: T2Content {
                category: DocCategory::StateT2,
                stock: StockId(7),
                unit: "T2Fit".to_string(),
                config: json!({}),
                link: "deadbeef".to_string(),
                link_members: vec![1, -2],
                combiner: Some("LightCurve".to_string()),
            },
            channels: set(&[channel]),
            tags: set(tags),
            groups: groups.iter().copied().collect(),
            group_conflict: false,
        })
    }

    #[test]
    fn test_wrong_category_rejected() {
        let conn = create_test_db();
        assert!(T2Ingester::new(DocCategory::Stock).is_err());
        assert!(matches!(
            MeasurementIngester.upsert(&conn, &stock_op(&["A"], 1, 1.0)),
            Err(StoreError::Schema(_))
        ));
    }
}
