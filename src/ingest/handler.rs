use super::compiler::{CompileRequest, Compiler};
use super::datapoint::DataPointShaper;
use super::{
    AlertBatch, AlertWriteOutcome, Applied, DocCategory, MeasurementRecord, OpOutcome, StockDoc,
    T2Content, T2Doc, WriteOp,
};
use crate::alert::{CanonicalAlert, StockId};
use crate::directive::{DirectiveSet, MeasurementSelect};
use crate::error::StoreError;
use crate::filter::IngestSelection;
use crate::metrics::{bump, RunCounters};
use crate::retry::ExponentialBackoff;
use crate::store::DocumentStore;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Accepted alerts waiting for the next store flush
#[derive(Debug, Default)]
pub struct UpdatesBuffer {
    batches: Vec<AlertBatch>,
    capacity: usize,
}

impl UpdatesBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            batches: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, batch: AlertBatch) {
        self.batches.push(batch);
    }

    pub fn is_full(&self) -> bool {
        self.batches.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn take(&mut self) -> Vec<AlertBatch> {
        std::mem::take(&mut self.batches)
    }
}

/// `hex(sha256("{stock}|{id,id,...}"))` over ascending member ids
pub fn state_link(stock: StockId, members: &[i64]) -> String {
    let ids: Vec<String> = members.iter().map(i64::to_string).collect();
    hex::encode(Sha256::digest(format!("{}|{}", stock.0, ids.join(",")).as_bytes()))
}

/// Ascending member ids of the alert's state
///
/// With `retro` the states ending at each earlier detection follow, newest
/// first, so a channel accepting a stock late still gets its history.
pub fn state_members(records: &[MeasurementRecord], select: MeasurementSelect, retro: bool) -> Vec<Vec<i64>> {
    let mut ordered: Vec<&MeasurementRecord> = records
        .iter()
        .filter(|r| select == MeasurementSelect::All || r.id > 0)
        .collect();
    if ordered.is_empty() {
        return Vec::new();
    }
    ordered.sort_by(|a, b| a.jd.total_cmp(&b.jd));

    let sorted_ids = |end: usize| {
        let mut ids: Vec<i64> = ordered[..end].iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids
    };

    let mut states = vec![sorted_ids(ordered.len())];
    if retro {
        let detections: Vec<usize> = ordered
            .iter()
            .enumerate()
            .filter(|(_, r)| r.id > 0)
            .map(|(i, _)| i)
            .collect();
        for &end in detections.iter().rev().skip(1) {
            states.push(sorted_ids(end + 1));
        }
    }
    states
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_ms: 100,
            max_ms: 5_000,
        }
    }
}

/// Orders each accepted alert's writes and batches them across alerts
pub struct ChainedIngestionHandler {
    directives: Arc<DirectiveSet>,
    shaper: DataPointShaper,
    store: Arc<dyn DocumentStore>,
    buffer: UpdatesBuffer,
    retry: RetryPolicy,
    counters: Arc<RunCounters>,
}

impl ChainedIngestionHandler {
    pub fn new(
        directives: Arc<DirectiveSet>,
        shaper: DataPointShaper,
        store: Arc<dyn DocumentStore>,
        buffer_size: usize,
        retry: RetryPolicy,
        counters: Arc<RunCounters>,
    ) -> Self {
        Self {
            directives,
            shaper,
            store,
            buffer: UpdatesBuffer::new(buffer_size),
            retry,
            counters,
        }
    }

    /// Stock op, then measurement ops, then derived ops per category
    pub fn build_batch(&self, alert: &CanonicalAlert, selection: &IngestSelection) -> AlertBatch {
        let records = self.shaper.shape(alert, selection);
        let mut ops = Vec::with_capacity(1 + records.len());

        ops.push(WriteOp::Stock(StockDoc {
            id: alert.stock,
            native_id: alert.native_id.clone(),
            channels: selection.channels(),
            tags: alert.annotations().tags.clone(),
            alert_id: alert.alert_id,
            last_jd: alert.latest_jd(),
        }));

        for category in DocCategory::DERIVED {
            let requests = self.derived_requests(category, alert, selection, &records);
            if requests.is_empty() {
                continue;
            }

            for compiled in Compiler::compile(requests) {
                if compiled.group_conflict {
                    bump(&self.counters.group_conflicts);
                }
                ops.push(WriteOp::T2(T2Doc {
                    key: compiled.key,
                    content: compiled.content,
                    channels: compiled.channels,
                    tags: compiled.tags,
                    groups: compiled.groups,
                    group_conflict: compiled.group_conflict,
                }));
            }
        }

        // measurements go right after the stock op
        let derived = ops.split_off(1);
        ops.extend(records.into_iter().map(WriteOp::Measurement));
        ops.extend(derived);

        AlertBatch {
            alert_id: alert.alert_id,
            stock: alert.stock,
            ops,
        }
    }

    fn derived_requests(
        &self,
        category: DocCategory,
        alert: &CanonicalAlert,
        selection: &IngestSelection,
        records: &[MeasurementRecord],
    ) -> Vec<CompileRequest<T2Content>> {
        let mut requests = Vec::new();
        let newest_point = alert.points.last().and_then(|p| p.natural_id);

        for (channel, channel_selection) in selection.iter() {
            let tags: BTreeSet<String> = self
                .directives
                .channel(channel)
                .map(|c| c.tags.iter().cloned().collect())
                .unwrap_or_default();

            let mut request = |content: T2Content, groups: &BTreeSet<u32>| {
                requests.push(CompileRequest {
                    channel: channel.to_string(),
                    tags: tags.clone(),
                    groups: groups.clone(),
                    content,
                });
            };

            for node in self.directives.nodes_for(channel) {
                match category {
                    DocCategory::StockT2 => {
                        for t2 in node.stock_t2.iter().filter(|t| channel_selection.admits(&t.group)) {
                            request(
                                T2Content {
                                    category,
                                    stock: alert.stock,
                                    unit: t2.unit.clone(),
                                    config: t2.config.clone(),
                                    link: alert.stock.to_string(),
                                    link_members: vec![],
                                    combiner: None,
                                },
                                &t2.group,
                            );
                        }
                    }
                    DocCategory::PointT2 => {
                        let Some(point) = newest_point else { continue };
                        for t2 in node.point_t2.iter().filter(|t| channel_selection.admits(&t.group)) {
                            request(
                                T2Content {
                                    category,
                                    stock: alert.stock,
                                    unit: t2.unit.clone(),
                                    config: t2.config.clone(),
                                    link: point.to_string(),
                                    link_members: vec![point],
                                    combiner: None,
                                },
                                &t2.group,
                            );
                        }
                    }
                    DocCategory::StateT2 => {
                        for combine in &node.combine {
                            for members in state_members(records, combine.select, selection.is_retro(channel)) {
                                let link = state_link(alert.stock, &members);

                                for t2 in combine.state_t2.iter().filter(|t| channel_selection.admits(&t.group)) {
                                    request(
                                        T2Content {
                                            category,
                                            stock: alert.stock,
                                            unit: t2.unit.clone(),
                                            config: t2.config.clone(),
                                            link: link.clone(),
                                            link_members: members.clone(),
                                            combiner: Some(combine.unit.clone()),
                                        },
                                        &t2.group,
                                    );
                                }
                            }
                        }
                    }
                    DocCategory::Stock | DocCategory::Measurement => {}
                }
            }
        }

        requests
    }

    /// Buffers the alert; flushes when the buffer is full
    pub async fn ingest(
        &mut self,
        alert: &CanonicalAlert,
        selection: &IngestSelection,
    ) -> Result<Vec<AlertWriteOutcome>, StoreError> {
        let batch = self.build_batch(alert, selection);
        log::debug!(
            "Buffered alert {} ({} ops, {} pending)",
            alert.alert_id,
            batch.ops.len(),
            self.buffer.len() + 1
        );
        self.buffer.push(batch);

        if self.buffer.is_full() {
            self.flush().await
        } else {
            Ok(Vec::new())
        }
    }

    /// Writes every buffered alert; transient failures are retried with backoff
    pub async fn flush(&mut self) -> Result<Vec<AlertWriteOutcome>, StoreError> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let batches = self.buffer.take();
        let mut backoff = ExponentialBackoff::new(self.retry.base_ms, self.retry.max_ms, self.retry.max_retries);

        loop {
            match self.store.flush(&batches).await {
                Ok(outcomes) => {
                    self.record(&outcomes);
                    return Ok(outcomes);
                }
                Err(e) if e.is_transient() => {
                    bump(&self.counters.store_transient_retries);
                    log::warn!("⚠️  Store flush of {} alert(s) failed: {}", batches.len(), e);
                    if backoff.sleep().await.is_err() {
                        return Err(StoreError::Fatal(format!(
                            "store still failing after {} retries: {}",
                            backoff.attempts(),
                            e
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record(&self, outcomes: &[AlertWriteOutcome]) {
        for outcome in outcomes {
            for (_, op) in &outcome.ops {
                match op {
                    OpOutcome::Applied(Applied::Inserted) => bump(&self.counters.ops_inserted),
                    OpOutcome::Applied(Applied::Merged) => bump(&self.counters.ops_merged),
                    OpOutcome::Applied(Applied::Unchanged) => bump(&self.counters.ops_unchanged),
                    OpOutcome::Skipped => bump(&self.counters.ops_skipped),
                    OpOutcome::Failed(_) => {}
                }
            }

            let mut failed = false;
            for (category, error) in outcome.failures() {
                failed = true;
                log::warn!(
                    "⚠️  Alert {} (stock {}): {} write failed: {}",
                    outcome.alert_id,
                    outcome.stock,
                    category,
                    error
                );
            }
            if failed {
                bump(&self.counters.store_schema_errors);
            } else {
                bump(&self.counters.alerts_ingested);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
