use super::predicate::{FilterOutcome, Predicate};
use super::{AutoComplete, FilterVerdict};
use crate::alert::{CanonicalAlert, StockId};
use crate::error::FilterError;
use crate::metrics::{bump, ChannelCounters};
use crate::store::AcceptanceLedger;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Idle,
    Evaluating,
    Decided,
}

/// One channel's filter with its auto-complete memory
///
/// The accepted-stock set is owned by the block and only touched through
/// `&mut self`, so at most one thread ever writes it. A miss in that set is
/// answered by the store's acceptance ledger when one is attached, so
/// acceptances committed by other consumers are seen too.
pub struct FilterBlock {
    channel: String,
    predicate: Box<dyn Predicate>,
    auto_complete: AutoComplete,
    retro_complete: bool,
    accepted_stocks: HashSet<StockId>,
    ledger: Option<Arc<dyn AcceptanceLedger>>,
    tags: Vec<String>,
    counters: Arc<ChannelCounters>,
    state: BlockState,
}

impl FilterBlock {
    pub fn new(channel: impl Into<String>, predicate: Box<dyn Predicate>, auto_complete: AutoComplete) -> Self {
        Self {
            channel: channel.into(),
            predicate,
            auto_complete,
            retro_complete: false,
            accepted_stocks: HashSet::new(),
            ledger: None,
            tags: Vec::new(),
            counters: Arc::new(ChannelCounters::default()),
            state: BlockState::Idle,
        }
    }

    /// Tags added to an alert's annotations when this channel accepts it
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Flags first acceptances of stocks with earlier detections
    pub fn with_retro_complete(mut self, retro_complete: bool) -> Self {
        self.retro_complete = retro_complete;
        self
    }

    pub fn set_ledger(&mut self, ledger: Arc<dyn AcceptanceLedger>) {
        self.ledger = Some(ledger);
    }

    /// Loads stocks accepted in earlier runs
    pub fn seed(&mut self, stocks: impl IntoIterator<Item = StockId>) {
        self.accepted_stocks.extend(stocks);
    }

    /// Whether this channel accepted `stock` before, here or in any consumer
    ///
    /// Positive ledger answers are cached. A failing lookup counts as unknown.
    fn knows(&mut self, stock: StockId) -> bool {
        if self.accepted_stocks.contains(&stock) {
            return true;
        }
        let Some(ledger) = &self.ledger else {
            return false;
        };

        match ledger.has_accepted(stock, &self.channel) {
            Ok(true) => {
                self.accepted_stocks.insert(stock);
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::warn!(
                    "⚠️  Channel {}: acceptance lookup for stock {} failed: {}",
                    self.channel,
                    stock,
                    e
                );
                false
            }
        }
    }

    pub fn evaluate(&mut self, alert: &CanonicalAlert) -> FilterVerdict {
        self.state = BlockState::Evaluating;
        let mut verdict = FilterVerdict::new(self.channel.clone(), FilterOutcome::reject());

        let outcome = if self.auto_complete == AutoComplete::Bypass && self.knows(alert.stock) {
            verdict.auto_completed = true;
            FilterOutcome::AcceptAll
        } else {
            let outcome = match self.predicate.evaluate(alert) {
                Ok(outcome) => outcome,
                Err(reason) => {
                    bump(&self.counters.errors);
                    verdict.error = Some(FilterError::new(&self.channel, reason));
                    FilterOutcome::reject()
                }
            };

            if !outcome.is_accept() && self.auto_complete == AutoComplete::Overrule && self.knows(alert.stock) {
                verdict.auto_completed = true;
                verdict.overruled = Some(outcome);
                FilterOutcome::AcceptAll
            } else {
                outcome
            }
        };

        if outcome.is_accept() {
            bump(&self.counters.accepted);
            if verdict.auto_completed {
                bump(&self.counters.autocompleted);
                log::debug!(
                    "Channel {} auto-completed stock {} (alert {})",
                    self.channel,
                    alert.stock,
                    alert.alert_id
                );
            } else if self.retro_complete && alert.points.len() > 1 && !self.knows(alert.stock) {
                verdict.retro_complete = true;
            }
            self.accepted_stocks.insert(alert.stock);
        } else {
            bump(&self.counters.rejected);
        }

        self.state = BlockState::Decided;

        verdict.outcome = outcome;
        verdict
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_accepted(&self, stock: StockId) -> bool {
        self.accepted_stocks.contains(&stock)
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn counters(&self) -> &Arc<ChannelCounters> {
        &self.counters
    }
}
