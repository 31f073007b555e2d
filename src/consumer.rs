//! The alert run loop
//!
//! ```text
//! supplier ─→ AlertShaper ─→ FilterBlocksHandler ─┬─ accepted ─→ ChainedIngestionHandler ─→ store
//!                                                 └─ rejected ─→ AlertRegister
//! ```
//!
//! Alerts are handled strictly one at a time. Stop requests, `iter_max` and
//! `error_max` are only looked at between two alerts.

use crate::alert::{AlertShaper, AlertSupplier, CanonicalAlert, RawAlert};
use crate::config::PipelineConfig;
use crate::directive::DirectiveSet;
use crate::error::{DirectiveError, PipelineError, StoreError};
use crate::filter::{FilterBlocksHandler, FilterVerdict, PredicateRegistry};
use crate::ingest::handler::RetryPolicy;
use crate::ingest::{ChainedIngestionHandler, DataPointShaper};
use crate::metrics::{bump, CancelReason, LogReporter, MetricsReporter, RunCounters, RunReport};
use crate::register::{AlertRegister, BinaryAlertRegister, RejectionRecord, ResilientRegister};
use crate::retry::ExponentialBackoff;
use crate::store::{DocumentStore, SqliteStore, StoreLedger};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop request, honoured at the next alert boundary
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run id derived from the wall clock (unix seconds)
pub fn next_run_id() -> u32 {
    unix_now()
}

fn unix_now() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX)
}

fn register_backoff(config: &PipelineConfig) -> ExponentialBackoff {
    ExponentialBackoff::new(
        config.register_retry_base_ms,
        config.register_retry_max_ms,
        config.register_retries,
    )
}

/// A channel's own rejection register
struct ChannelRegister {
    channel: String,
    update_rej: bool,
    register: ResilientRegister,
}

pub struct AlertConsumer {
    run_id: u32,
    shaper: AlertShaper,
    filters: FilterBlocksHandler,
    ingestion: ChainedIngestionHandler,
    store: Arc<dyn DocumentStore>,
    register: ResilientRegister,
    channel_registers: Vec<ChannelRegister>,
    reporter: Box<dyn MetricsReporter>,
    counters: Arc<RunCounters>,
    stop: StopHandle,
    error_max: Option<u64>,
    iter_max: Option<u64>,
}

impl AlertConsumer {
    /// Channels with a `reject.register` get their own binary register
    /// under `config.register_dir`.
    pub fn new(
        config: &PipelineConfig,
        directives: Arc<DirectiveSet>,
        registry: &PredicateRegistry,
        store: Arc<dyn DocumentStore>,
        register: Box<dyn AlertRegister>,
        run_id: u32,
    ) -> Result<Self, PipelineError> {
        let counters = Arc::new(RunCounters::default());
        let filters = FilterBlocksHandler::from_directives(&directives, registry, config.parallel_filters)?
            .with_ledger(Arc::new(StoreLedger(store.clone())));

        let mut channel_registers = Vec::new();
        for channel in directives.channels() {
            let Some(settings) = channel.register() else { continue };
            let prefix = settings.prefix_for(&channel.channel);
            if prefix == config.register_prefix {
                return Err(DirectiveError::RegisterClash {
                    channel: channel.channel.clone(),
                    prefix,
                }
                .into());
            }

            let inner = BinaryAlertRegister::open(
                &config.register_dir,
                &prefix,
                settings.layout.unwrap_or(config.register_layout),
                config.register_active,
                config.register_max_blocks,
                run_id,
            )?;
            channel_registers.push(ChannelRegister {
                channel: channel.channel.clone(),
                update_rej: channel.update_rej,
                register: ResilientRegister::new(Box::new(inner), register_backoff(config), counters.clone()),
            });
        }

        let ingestion = ChainedIngestionHandler::new(
            directives,
            DataPointShaper::default(),
            store.clone(),
            config.updates_buffer_size,
            RetryPolicy {
                max_retries: config.store_max_retries,
                base_ms: config.store_retry_base_ms,
                max_ms: config.store_retry_max_ms,
            },
            counters.clone(),
        );

        Ok(Self {
            run_id,
            shaper: AlertShaper::default(),
            filters,
            ingestion,
            store,
            register: ResilientRegister::new(register, register_backoff(config), counters.clone()),
            channel_registers,
            reporter: Box::new(LogReporter),
            counters,
            stop: StopHandle::default(),
            error_max: config.error_max,
            iter_max: config.iter_max,
        })
    }

    /// SQLite store, directive file and binary register as configured
    pub fn from_config(config: &PipelineConfig, registry: &PredicateRegistry) -> Result<Self, PipelineError> {
        let run_id = next_run_id();
        let directives = Arc::new(DirectiveSet::load(&config.directives_path, registry)?);
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open(&config.db_path)?);
        let register = BinaryAlertRegister::open(
            &config.register_dir,
            &config.register_prefix,
            config.register_layout,
            config.register_active,
            config.register_max_blocks,
            run_id,
        )?;

        Self::new(config, directives, registry, store, Box::new(register), run_id)
    }

    pub fn with_reporter(mut self, reporter: Box<dyn MetricsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    /// Consumes the supplier until it is exhausted or the run is cancelled
    ///
    /// A run-fatal store failure is returned as `Err` after the partial
    /// report was handed to the reporter.
    pub async fn run<S: AlertSupplier>(&mut self, mut supplier: S) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        self.seed_from_store()?;

        log::info!("🚀 Run {} started on {}", self.run_id, supplier.name());
        log::info!("   ├─ Store: {}", self.store.backend_type());
        log::info!(
            "   ├─ Register: {} (+{} channel register(s))",
            self.register.backend_type(),
            self.channel_registers.len()
        );
        log::info!("   └─ Channels: {}", self.filters.channels().join(", "));

        let mut cancelled = None;
        let mut fatal: Option<StoreError> = None;
        let mut processed = 0u64;
        let mut read_errors = 0u64;

        loop {
            if let Some(reason) = self.cancel_reason(processed) {
                log::warn!("⚠️  Stopping run {} before next alert: {:?}", self.run_id, reason);
                cancelled = Some(reason);
                break;
            }

            let next = supplier.next();
            let reported = supplier.read_errors();
            if reported > read_errors {
                self.counters.add(&self.counters.supplier_errors, reported - read_errors);
                read_errors = reported;
            }
            let Some(raw) = next else { break };

            processed += 1;
            bump(&self.counters.alerts_processed);

            if let Err(e) = self.process(raw).await {
                log::error!("❌ Run {} aborted: {}", self.run_id, e);
                cancelled = Some(CancelReason::StoreFatal);
                fatal = Some(e);
                break;
            }
        }

        if fatal.is_none() {
            if let Err(e) = self.ingestion.flush().await {
                log::error!("❌ Final flush of run {} failed: {}", self.run_id, e);
                cancelled = Some(CancelReason::StoreFatal);
                fatal = Some(e);
            }
        }

        self.close_registers();

        let (hits, misses) = self.shaper.identities().stats();
        log::info!("📊 Identity cache: {} hit(s), {} miss(es)", hits, misses);

        let report = RunReport::from_counters(
            self.run_id,
            supplier.name(),
            started_at,
            &self.counters,
            self.filters.channel_stats(),
            cancelled,
        );
        self.reporter.report(&report);

        match fatal {
            Some(e) => Err(PipelineError::Store(e)),
            None => Ok(report),
        }
    }

    fn seed_from_store(&mut self) -> Result<(), StoreError> {
        let channels: Vec<String> = self.filters.channels().iter().map(|c| c.to_string()).collect();

        for channel in channels {
            let stocks = self.store.stocks_accepted_by(&channel)?;
            if !stocks.is_empty() {
                log::info!("📂 Channel {}: {} previously accepted stock(s)", channel, stocks.len());
            }
            self.filters.seed(&channel, stocks);
        }
        Ok(())
    }

    fn close_registers(&mut self) {
        if !self.register.close() {
            log::warn!("⚠️  Rejection register of run {} did not close cleanly", self.run_id);
        }
        for target in &mut self.channel_registers {
            if !target.register.close() {
                log::warn!("⚠️  Rejection register of channel {} did not close cleanly", target.channel);
            }
        }
    }

    fn cancel_reason(&self, processed: u64) -> Option<CancelReason> {
        if self.stop.is_stopped() {
            return Some(CancelReason::Interrupted);
        }
        if self.iter_max.is_some_and(|max| processed >= max) {
            return Some(CancelReason::IterMax);
        }
        if self.error_max.is_some_and(|max| self.counters.alert_errors() >= max) {
            return Some(CancelReason::TooManyErrors);
        }
        None
    }

    /// Only run-fatal store failures come back as `Err`
    async fn process(&mut self, raw: RawAlert) -> Result<(), StoreError> {
        let alert_id = raw.alert_id;
        let resolved_before = self.shaper.resolutions();
        let shaped = self.shaper.shape(raw);
        self.counters.add(
            &self.counters.identities_resolved,
            self.shaper.resolutions() - resolved_before,
        );

        let mut alert = match shaped {
            Ok(alert) => alert,
            Err(e) => {
                bump(&self.counters.shape_errors);
                log::warn!("⚠️  Skipping alert {}: {}", alert_id, e);
                return Ok(());
            }
        };

        let verdicts = self.filters.evaluate(&alert);
        for error in verdicts.iter().filter_map(|v| v.error.as_ref()) {
            bump(&self.counters.filter_errors);
            log::warn!("⚠️  {} (alert {})", error, alert_id);
        }
        self.register_channel_rejections(&alert, &verdicts);

        match FilterBlocksHandler::aggregate(&verdicts) {
            Some(selection) => {
                log::debug!(
                    "Alert {} (stock {}) accepted by {:?}",
                    alert_id,
                    alert.stock,
                    selection.channels()
                );
                self.filters.annotate(&mut alert, &selection);
                self.ingestion.ingest(&alert, &selection).await?;
            }
            None => self.reject(&alert, &verdicts),
        }

        Ok(())
    }

    /// Every rejection a channel's predicate made, overruled ones included
    /// when the channel asks for them
    fn register_channel_rejections(&mut self, alert: &CanonicalAlert, verdicts: &[FilterVerdict]) {
        if self.channel_registers.is_empty() {
            return;
        }
        let timestamp = unix_now();

        for verdict in verdicts {
            let Some(target) = self.channel_registers.iter_mut().find(|r| r.channel == verdict.channel) else {
                continue;
            };
            let overruled = verdict.overruled.is_some();
            if verdict.is_accept() && !(overruled && target.update_rej) {
                continue;
            }

            target.register.append(&RejectionRecord {
                alert_id: alert.alert_id,
                stock: alert.stock,
                native_id: alert.native_id.clone(),
                timestamp,
                reason: verdict.predicate_rejection_code(),
                previously_accepted: overruled || self.filters.accepted_by(&verdict.channel, alert.stock),
            });
        }
    }

    fn reject(&mut self, alert: &CanonicalAlert, verdicts: &[FilterVerdict]) {
        bump(&self.counters.alerts_rejected);

        let record = RejectionRecord {
            alert_id: alert.alert_id,
            stock: alert.stock,
            native_id: alert.native_id.clone(),
            timestamp: unix_now(),
            reason: verdicts.iter().find_map(|v| v.rejection_code()),
            previously_accepted: self.filters.previously_accepted(alert.stock),
        };
        log::debug!("Alert {} (stock {}) rejected by every channel", alert.alert_id, alert.stock);

        self.register.append(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::test_support::raw_alert;
    use crate::alert::VecAlertSupplier;
    use crate::register::{read_blocks, RegisterLayout};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    const DIRECTIVES: &str = r#"{
        "channels": [
            { "channel": "OPEN", "filter": { "unit": "Switch" }, "directive": "summary" }
        ],
        "directives": { "summary": { "stock_t2": [{ "unit": "T2Summary" }] } }
    }"#;

    fn consumer(
        dir: &std::path::Path,
        config: PipelineConfig,
        switch: Arc<AtomicBool>,
    ) -> (AlertConsumer, Arc<SqliteStore>) {
        let mut registry = PredicateRegistry::with_builtins();
        registry.register_toggle("Switch", switch);

        let directives = Arc::new(DirectiveSet::from_json(DIRECTIVES, &registry).unwrap());
        let store = Arc::new(SqliteStore::open(dir.join("store.db")).unwrap());
        let register =
            BinaryAlertRegister::open(dir.join("register"), "rejected", RegisterLayout::General, true, 100, 1)
                .unwrap();

        let consumer =
            AlertConsumer::new(&config, directives, &registry, store.clone(), Box::new(register), 1).unwrap();
        (consumer, store)
    }

    fn alerts(n: u64) -> VecAlertSupplier {
        VecAlertSupplier::new("test", (1..=n).map(|i| raw_alert(i, "X123", vec![])).collect())
    }

    #[tokio::test]
    async fn test_iter_max_stops_run() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig { iter_max: Some(2), ..PipelineConfig::default() };
        let (mut consumer, _store) = consumer(dir.path(), config, Arc::new(AtomicBool::new(true)));

        let report = consumer.run(alerts(5)).await.unwrap();
        assert_eq!(report.alerts_processed, 2);
        assert_eq!(report.cancelled, Some(CancelReason::IterMax));
    }

    #[tokio::test]
    async fn test_stop_before_first_alert() {
        let dir = tempdir().unwrap();
        let (mut consumer, store) =
            consumer(dir.path(), PipelineConfig::default(), Arc::new(AtomicBool::new(true)));

        consumer.stop_handle().stop();
        let report = consumer.run(alerts(3)).await.unwrap();

        assert_eq!(report.alerts_processed, 0);
        assert_eq!(report.cancelled, Some(CancelReason::Interrupted));
        assert_eq!(store.count(crate::ingest::DocCategory::Stock).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_max_cancels_run() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig { error_max: Some(2), ..PipelineConfig::default() };
        let (mut consumer, _store) = consumer(dir.path(), config, Arc::new(AtomicBool::new(true)));

        let broken: Vec<_> = (1..=5).map(|i| raw_alert(i, "bad id!", vec![])).collect();
        let report = consumer.run(VecAlertSupplier::new("broken", broken)).await.unwrap();

        assert_eq!(report.alerts_processed, 2);
        assert_eq!(report.error_count("shape"), 2);
        assert_eq!(report.identities_resolved, 0);
        assert_eq!(report.cancelled, Some(CancelReason::TooManyErrors));
    }

    #[tokio::test]
    async fn test_previously_accepted_flag_in_register() {
        let dir = tempdir().unwrap();
        let switch = Arc::new(AtomicBool::new(true));
        let config = PipelineConfig { updates_buffer_size: 1, ..PipelineConfig::default() };

        {
            let (mut consumer, _store) = consumer(dir.path(), config.clone(), switch.clone());
            consumer.run(alerts(1)).await.unwrap();
        }

        // the channel now rejects everything; Overrule keeps the known stock
        switch.store(false, Ordering::SeqCst);
        let (mut consumer, _store) = consumer(dir.path(), config, switch);
        let report = consumer
            .run(VecAlertSupplier::new(
                "second",
                vec![raw_alert(2, "X123", vec![]), raw_alert(3, "Y9", vec![])],
            ))
            .await
            .unwrap();

        assert_eq!(report.alerts_rejected, 1);
        assert_eq!(report.channel("OPEN").map(|c| c.autocompleted), Some(1));

        let records = read_blocks(
            dir.path().join("register/rejected.bin"),
            RegisterLayout::General,
            true,
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alert_id, 3);
        assert!(!records[0].previously_accepted);
    }

    const CHANNEL_REGISTERS: &str = r#"{
        "channels": [
            { "channel": "OPEN", "filter": { "unit": "Switch" },
              "reject": { "register": { "prefix": "rej_$channel" } } },
            { "channel": "QUIET", "filter": { "unit": "Switch" }, "update_rej": false,
              "reject": { "register": {} } },
            { "channel": "SHUT", "filter": { "unit": "RejectAll", "config": { "code": 7 } },
              "reject": { "register": { "layout": "minimal" } } }
        ]
    }"#;

    #[tokio::test]
    async fn test_channel_registers_and_update_rej() {
        let dir = tempdir().unwrap();
        let switch = Arc::new(AtomicBool::new(true));
        let mut registry = PredicateRegistry::with_builtins();
        registry.register_toggle("Switch", switch.clone());

        let config = PipelineConfig {
            register_dir: dir.path().join("register").to_string_lossy().into_owned(),
            updates_buffer_size: 1,
            ..PipelineConfig::default()
        };
        let directives = Arc::new(DirectiveSet::from_json(CHANNEL_REGISTERS, &registry).unwrap());
        let store = Arc::new(SqliteStore::open(dir.path().join("store.db")).unwrap());
        let register =
            BinaryAlertRegister::open(&config.register_dir, "rejected", RegisterLayout::General, true, 100, 1)
                .unwrap();
        let mut consumer =
            AlertConsumer::new(&config, directives, &registry, store, Box::new(register), 1).unwrap();

        struct Flip {
            alerts: std::vec::IntoIter<RawAlert>,
            switch: Arc<AtomicBool>,
        }

        impl Iterator for Flip {
            type Item = RawAlert;

            fn next(&mut self) -> Option<RawAlert> {
                let alert = self.alerts.next()?;
                self.switch.store(alert.alert_id == 1, Ordering::SeqCst);
                Some(alert)
            }
        }

        impl AlertSupplier for Flip {
            fn name(&self) -> &str {
                "flip"
            }
        }

        let alerts = vec![raw_alert(1, "X123", vec![]), raw_alert(2, "X123", vec![]), raw_alert(3, "Y9", vec![])];
        let report = consumer
            .run(Flip { alerts: alerts.into_iter(), switch })
            .await
            .unwrap();
        assert_eq!(report.alerts_rejected, 1);
        assert_eq!(report.channel("OPEN").map(|c| c.autocompleted), Some(1));

        let read = |name: &str, layout: RegisterLayout| -> Vec<RejectionRecord> {
            read_blocks(dir.path().join("register").join(name), layout, true).unwrap()
        };
        let ids = |records: &[RejectionRecord]| records.iter().map(|r| r.alert_id).collect::<Vec<_>>();

        // overruled rejection kept, flagged as a known stock
        let open = read("rej_OPEN.bin", RegisterLayout::General);
        assert_eq!(ids(&open), vec![2, 3]);
        assert!(open[0].previously_accepted);
        assert!(!open[1].previously_accepted);

        assert_eq!(ids(&read("rejected_QUIET.bin", RegisterLayout::General)), vec![3]);

        let shut = read("rejected_SHUT.bin", RegisterLayout::Minimal);
        assert_eq!(ids(&shut), vec![1, 2, 3]);
        assert!(shut.iter().all(|r| r.reason == Some(7)));

        assert_eq!(ids(&read("rejected.bin", RegisterLayout::General)), vec![3]);
    }

    #[test]
    fn test_channel_register_cannot_share_run_register() {
        let dir = tempdir().unwrap();
        let registry = PredicateRegistry::with_builtins();
        let json = r#"{ "channels": [{ "channel": "A", "reject": { "register": { "prefix": "rejected" } } }] }"#;
        let config = PipelineConfig {
            register_dir: dir.path().to_string_lossy().into_owned(),
            ..PipelineConfig::default()
        };
        let directives = Arc::new(DirectiveSet::from_json(json, &registry).unwrap());
        let store = Arc::new(SqliteStore::open(dir.path().join("store.db")).unwrap());
        let register =
            BinaryAlertRegister::open(dir.path(), "rejected", RegisterLayout::General, true, 100, 1).unwrap();

        assert!(matches!(
            AlertConsumer::new(&config, directives, &registry, store, Box::new(register), 1),
            Err(PipelineError::Directive(DirectiveError::RegisterClash { .. }))
        ));
    }

    /// Reports one unreadable input before every alert
    struct LossySupplier {
        inner: VecAlertSupplier,
        errors: u64,
    }

    impl Iterator for LossySupplier {
        type Item = RawAlert;

        fn next(&mut self) -> Option<RawAlert> {
            self.errors += 1;
            self.inner.next()
        }
    }

    impl AlertSupplier for LossySupplier {
        fn name(&self) -> &str {
            "lossy"
        }

        fn read_errors(&self) -> u64 {
            self.errors
        }
    }

    #[tokio::test]
    async fn test_read_errors_count_toward_error_max() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig { error_max: Some(3), ..PipelineConfig::default() };
        let (mut consumer, _store) = consumer(dir.path(), config, Arc::new(AtomicBool::new(true)));

        let report = consumer
            .run(LossySupplier { inner: alerts(10), errors: 0 })
            .await
            .unwrap();

        assert_eq!(report.alerts_processed, 3);
        assert_eq!(report.error_count("supplier"), 3);
        assert_eq!(report.cancelled, Some(CancelReason::TooManyErrors));
    }
}
