use super::pragma::apply_optimized_pragmas;
use super::{AcceptanceLedger, DocumentStore};
use crate::alert::StockId;
use crate::error::StoreError;
use crate::ingest::{
    AlertBatch, AlertWriteOutcome, DocCategory, DocIngester, MeasurementIngester, OpOutcome,
    StockIngester, T2Ingester,
};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stock (
    id          INTEGER PRIMARY KEY,
    native_id   TEXT NOT NULL,
    channels    TEXT NOT NULL,
    tags        TEXT NOT NULL,
    alerts      TEXT NOT NULL,
    last_jd     REAL
);

CREATE TABLE IF NOT EXISTS stock_channel (
    stock       INTEGER NOT NULL,
    channel     TEXT NOT NULL,
    PRIMARY KEY (stock, channel)
);

CREATE INDEX IF NOT EXISTS idx_stock_channel_channel ON stock_channel(channel);

CREATE TABLE IF NOT EXISTS measurement (
    id          INTEGER PRIMARY KEY,
    stock       INTEGER NOT NULL,
    channels    TEXT NOT NULL,
    tags        TEXT NOT NULL,
    body        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_measurement_stock ON measurement(stock);
"#;

fn t2_schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            key             TEXT PRIMARY KEY,
            stock           INTEGER NOT NULL,
            unit            TEXT NOT NULL,
            config          TEXT NOT NULL,
            link            TEXT NOT NULL,
            link_members    TEXT NOT NULL,
            combiner        TEXT,
            channels        TEXT NOT NULL,
            tags            TEXT NOT NULL DEFAULT '[]',
            groups          TEXT NOT NULL,
            group_conflict  INTEGER NOT NULL DEFAULT 0,
            status          INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_stock ON {table}(stock);"
    )
}

/// Creates every table idempotently
pub fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    for category in DocCategory::DERIVED {
        conn.execute_batch(&t2_schema(category.table()))?;
    }
    Ok(())
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    ingesters: BTreeMap<DocCategory, Box<dyn DocIngester>>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Fatal(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;
        create_schema(&conn)?;

        log::info!(
            "✅ SQLite store initialized with WAL mode at {}",
            db_path.as_ref().display()
        );

        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let mut ingesters: BTreeMap<DocCategory, Box<dyn DocIngester>> = BTreeMap::new();
        ingesters.insert(DocCategory::Stock, Box::new(StockIngester));
        ingesters.insert(DocCategory::Measurement, Box::new(MeasurementIngester));
        for category in DocCategory::DERIVED {
            ingesters.insert(category, Box::new(T2Ingester::new(category)?));
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ingesters,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Fatal("store connection mutex poisoned".to_string()))
    }

    /// One alert inside its own savepoint, each op inside a nested one
    fn apply_batch(&self, tx: &mut Transaction<'_>, batch: &AlertBatch) -> Result<AlertWriteOutcome, StoreError> {
        let mut alert_sp = tx.savepoint()?;
        let mut prerequisite_failed = false;
        let mut ops = Vec::with_capacity(batch.ops.len());

        for op in &batch.ops {
            let category = op.category();

            if category.is_derived() && prerequisite_failed {
                ops.push((category, OpOutcome::Skipped));
                continue;
            }

            let ingester = self
                .ingesters
                .get(&category)
                .ok_or_else(|| StoreError::Fatal(format!("no ingester for {}", category)))?;

            let op_sp = alert_sp.savepoint()?;
            match ingester.upsert(&op_sp, op) {
                Ok(applied) => {
                    op_sp.commit()?;
                    ops.push((category, OpOutcome::Applied(applied)));
                }
                Err(StoreError::Schema(reason)) => {
                    // dropping the savepoint rolls the op back
                    drop(op_sp);
                    if !category.is_derived() {
                        prerequisite_failed = true;
                    }
                    ops.push((category, OpOutcome::Failed(StoreError::Schema(reason))));
                }
                Err(e) => return Err(e),
            }
        }

        alert_sp.commit()?;

        Ok(AlertWriteOutcome {
            alert_id: batch.alert_id,
            stock: batch.stock,
            ops,
        })
    }

    pub fn count(&self, category: DocCategory) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", category.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Every row of every table as JSON, ordered by primary key
    pub fn dump(&self) -> Result<BTreeMap<String, Vec<Value>>, StoreError> {
        let conn = self.lock()?;
        let mut tables = vec![("stock", "id"), ("stock_channel", "stock, channel"), ("measurement", "id")];
        tables.extend(DocCategory::DERIVED.iter().map(|c| (c.table(), "key")));

        let mut dump = BTreeMap::new();
        for (table, order) in tables {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY {}", table, order))?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

            let rows = stmt.query_map([], |row| {
                let mut object = serde_json::Map::new();
                for (i, name) in names.iter().enumerate() {
                    let value = match row.get_ref(i)? {
                        ValueRef::Null => Value::Null,
                        ValueRef::Integer(v) => Value::from(v),
                        ValueRef::Real(v) => Value::from(v),
                        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
                        ValueRef::Blob(b) => Value::from(hex::encode(b)),
                    };
                    object.insert(name.clone(), value);
                }
                Ok(Value::Object(object))
            })?;

            dump.insert(table.to_string(), rows.collect::<Result<Vec<_>, _>>()?);
        }

        Ok(dump)
    }
}

impl AcceptanceLedger for SqliteStore {
    fn has_accepted(&self, stock: StockId, channel: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stock_channel WHERE stock = ?1 AND channel = ?2",
            params![stock.0 as i64, channel],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn stocks_accepted_by(&self, channel: &str) -> Result<Vec<StockId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT stock FROM stock_channel WHERE channel = ?1")?;
        let stocks = stmt
            .query_map(params![channel], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|id| StockId(id as u64)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stocks)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn flush(&self, batches: &[AlertBatch]) -> Result<Vec<AlertWriteOutcome>, StoreError> {
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.lock()?;
        let mut tx = conn.transaction()?;

        let mut outcomes = Vec::with_capacity(batches.len());
        for batch in batches {
            outcomes.push(self.apply_batch(&mut tx, batch)?);
        }

        tx.commit()?;

        log::debug!("✅ Flushed {} alert batch(es) to SQLite", batches.len());
        Ok(outcomes)
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Applied, MeasurementRecord, StockDoc, WriteOp};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn stock_op(stock: u64, native: &str, channel: &str) -> WriteOp {
        WriteOp::Stock(StockDoc {
            id: StockId(stock),
            native_id: native.to_string(),
            channels: BTreeSet::from([channel.to_string()]),
            tags: BTreeSet::new(),
            alert_id: 1,
            last_jd: Some(2459000.5),
        })
    }

    fn measurement_op(id: i64, stock: u64) -> WriteOp {
        WriteOp::Measurement(MeasurementRecord {
            id,
            stock: StockId(stock),
            jd: 2459000.5,
            channels: BTreeSet::from(["A".to_string()]),
            tags: BTreeSet::new(),
            body: serde_json::Map::new(),
        })
    }

    #[tokio::test]
    async fn test_open_creates_schema_with_wal() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("store.db");
        let store = SqliteStore::open(&db_path).unwrap();

        assert_eq!(store.count(DocCategory::Stock).unwrap(), 0);
        assert_eq!(store.backend_type(), "SQLite");

        let conn = Connection::open(&db_path).unwrap();
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_flush_and_ledger() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();

        let batch = AlertBatch {
            alert_id: 1,
            stock: StockId(7),
            ops: vec![stock_op(7, "X123", "A"), measurement_op(100, 7)],
        };
        let outcomes = store.flush(&[batch]).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_complete());
        assert_eq!(outcomes[0].count(&OpOutcome::Applied(Applied::Inserted)), 2);

        assert!(store.has_accepted(StockId(7), "A").unwrap());
        assert!(!store.has_accepted(StockId(7), "B").unwrap());
        assert_eq!(store.stocks_accepted_by("A").unwrap(), vec![StockId(7)]);
    }

    #[tokio::test]
    async fn test_schema_failure_is_scoped_to_alert() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();

        // measurement 100 claimed by stock 7 first
        store
            .flush(&[AlertBatch {
                alert_id: 1,
                stock: StockId(7),
                ops: vec![stock_op(7, "X123", "A"), measurement_op(100, 7)],
            }])
            .await
            .unwrap();

        let derived = WriteOp::T2(crate::ingest::T2Doc {
            key: "k".to_string(),
            content: crate::ingest::T2Content {
                category: DocCategory::StockT2,
                stock: StockId(8),
                unit: "T2Summary".to_string(),
                config: Value::Null,
                link: "8".to_string(),
                link_members: vec![],
                combiner: None,
            },
            channels: BTreeSet::from(["A".to_string()]),
            tags: BTreeSet::new(),
            groups: BTreeSet::new(),
            group_conflict: false,
        });

        let outcomes = store
            .flush(&[
                AlertBatch {
                    alert_id: 2,
                    stock: StockId(8),
                    ops: vec![stock_op(8, "Y456", "A"), measurement_op(100, 8), derived],
                },
                AlertBatch {
                    alert_id: 3,
                    stock: StockId(9),
                    ops: vec![stock_op(9, "Z789", "A")],
                },
            ])
            .await
            .unwrap();

        let bad = &outcomes[0];
        assert_eq!(bad.ops[0].1, OpOutcome::Applied(Applied::Inserted));
        assert!(matches!(bad.ops[1].1, OpOutcome::Failed(StoreError::Schema(_))));
        assert_eq!(bad.ops[2].1, OpOutcome::Skipped);
        assert_eq!(bad.failures().count(), 1);

        assert!(outcomes[1].is_complete());
        assert_eq!(store.count(DocCategory::StockT2).unwrap(), 0);
        assert_eq!(store.count(DocCategory::Stock).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dump_is_ordered() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();
        store
            .flush(&[AlertBatch {
                alert_id: 1,
                stock: StockId(7),
                ops: vec![stock_op(7, "X123", "A"), measurement_op(-5, 7), measurement_op(3, 7)],
            }])
            .await
            .unwrap();

        let dump = store.dump().unwrap();
        let ids: Vec<i64> = dump["measurement"]
            .iter()
            .filter_map(|row| row["id"].as_i64())
            .collect();
        assert_eq!(ids, vec![-5, 3]);
        assert_eq!(dump["stock"][0]["native_id"], "X123");
    }
}
