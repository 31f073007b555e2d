//! Run counters and the end-of-run report
//!
//! Counters are plain atomics so filter blocks on scoped threads can bump
//! them without locking. `RunReport` is the serializable snapshot handed to
//! a `MetricsReporter` once the run ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Per-channel filter counters
#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub autocompleted: AtomicU64,
    pub errors: AtomicU64,
}

impl ChannelCounters {
    pub fn snapshot(&self, channel: &str) -> ChannelStats {
        ChannelStats {
            channel: channel.to_string(),
            accepted: read(&self.accepted),
            rejected: read(&self.rejected),
            autocompleted: read(&self.autocompleted),
            errors: read(&self.errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: String,
    pub accepted: u64,
    pub rejected: u64,
    pub autocompleted: u64,
    pub errors: u64,
}

/// Per-run totals
#[derive(Debug, Default)]
pub struct RunCounters {
    pub alerts_processed: AtomicU64,
    pub identities_resolved: AtomicU64,
    pub alerts_ingested: AtomicU64,
    pub alerts_rejected: AtomicU64,
    pub shape_errors: AtomicU64,
    /// Unreadable input reported by the supplier
    pub supplier_errors: AtomicU64,
    pub filter_errors: AtomicU64,
    pub store_schema_errors: AtomicU64,
    pub store_transient_retries: AtomicU64,
    pub register_errors: AtomicU64,
    pub group_conflicts: AtomicU64,
    pub ops_inserted: AtomicU64,
    pub ops_merged: AtomicU64,
    pub ops_unchanged: AtomicU64,
    pub ops_skipped: AtomicU64,
}

impl RunCounters {
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Errors that count against `error_max`
    pub fn alert_errors(&self) -> u64 {
        read(&self.shape_errors) + read(&self.supplier_errors) + read(&self.store_schema_errors)
    }

    pub fn error_counts(&self) -> BTreeMap<String, u64> {
        let mut errors = BTreeMap::new();
        errors.insert("shape".to_string(), read(&self.shape_errors));
        errors.insert("supplier".to_string(), read(&self.supplier_errors));
        errors.insert("filter".to_string(), read(&self.filter_errors));
        errors.insert("store_schema".to_string(), read(&self.store_schema_errors));
        errors.insert(
            "store_transient_retry".to_string(),
            read(&self.store_transient_retries),
        );
        errors.insert("register".to_string(), read(&self.register_errors));
        errors
    }

    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            inserted: read(&self.ops_inserted),
            merged: read(&self.ops_merged),
            unchanged: read(&self.ops_unchanged),
            skipped: read(&self.ops_skipped),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpCounts {
    pub inserted: u64,
    pub merged: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

/// Why a run ended before its supplier was exhausted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    Interrupted,
    IterMax,
    TooManyErrors,
    StoreFatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: u32,
    pub supplier: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub alerts_processed: u64,
    pub identities_resolved: u64,
    pub alerts_ingested: u64,
    pub alerts_rejected: u64,
    pub group_conflicts: u64,
    pub ops: OpCounts,
    pub errors: BTreeMap<String, u64>,
    pub channels: Vec<ChannelStats>,
    pub cancelled: Option<CancelReason>,
}

impl RunReport {
    pub fn from_counters(
        run_id: u32,
        supplier: &str,
        started_at: DateTime<Utc>,
        counters: &RunCounters,
        channels: Vec<ChannelStats>,
        cancelled: Option<CancelReason>,
    ) -> Self {
        Self {
            run_id,
            supplier: supplier.to_string(),
            started_at,
            finished_at: Utc::now(),
            alerts_processed: read(&counters.alerts_processed),
            identities_resolved: read(&counters.identities_resolved),
            alerts_ingested: read(&counters.alerts_ingested),
            alerts_rejected: read(&counters.alerts_rejected),
            group_conflicts: read(&counters.group_conflicts),
            ops: counters.op_counts(),
            errors: counters.error_counts(),
            channels,
            cancelled,
        }
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelStats> {
        self.channels.iter().find(|c| c.channel == name)
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.get(kind).copied().unwrap_or(0)
    }
}

/// External reporting collaborator
pub trait MetricsReporter: Send + Sync {
    fn report(&self, report: &RunReport);
}

/// Writes the report to the log
#[derive(Debug, Default)]
pub struct LogReporter;

impl MetricsReporter for LogReporter {
    fn report(&self, report: &RunReport) {
        let elapsed = report.finished_at - report.started_at;

        log::info!(
            "📊 Run {} ({}) finished in {}ms",
            report.run_id,
            report.supplier,
            elapsed.num_milliseconds()
        );
        log::info!(
            "   ├─ Alerts: {} processed, {} ingested, {} rejected",
            report.alerts_processed,
            report.alerts_ingested,
            report.alerts_rejected
        );
        log::info!(
            "   ├─ Ops: {} inserted, {} merged, {} unchanged, {} skipped",
            report.ops.inserted,
            report.ops.merged,
            report.ops.unchanged,
            report.ops.skipped
        );
        for channel in &report.channels {
            log::info!(
                "   ├─ {}: {} accepted ({} autocomplete), {} rejected, {} errors",
                channel.channel,
                channel.accepted,
                channel.autocompleted,
                channel.rejected,
                channel.errors
            );
        }
        let errors: Vec<String> = report
            .errors
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(kind, n)| format!("{}={}", kind, n))
            .collect();
        log::info!(
            "   └─ Errors: {}",
            if errors.is_empty() { "none".to_string() } else { errors.join(", ") }
        );

        if let Some(reason) = &report.cancelled {
            log::warn!("⚠️  Run cancelled: {:?}", reason);
        }
    }
}
