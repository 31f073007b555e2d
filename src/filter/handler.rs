use super::block::FilterBlock;
use super::predicate::{FilterOutcome, NoFilter, Predicate, PredicateRegistry};
use super::{FilterVerdict, IngestSelection, Selection};
use crate::alert::{CanonicalAlert, StockId};
use crate::directive::DirectiveSet;
use crate::error::{DirectiveError, FilterError};
use crate::metrics::{bump, ChannelStats};
use crate::store::AcceptanceLedger;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Runs every channel's block against an alert
pub struct FilterBlocksHandler {
    blocks: Vec<FilterBlock>,
    parallel: bool,
}

impl FilterBlocksHandler {
    pub fn new(blocks: Vec<FilterBlock>, parallel: bool) -> Result<Self, DirectiveError> {
        if blocks.is_empty() {
            return Err(DirectiveError::NoChannels);
        }

        let mut seen = HashSet::new();
        for block in &blocks {
            if !seen.insert(block.channel().to_string()) {
                return Err(DirectiveError::DuplicateChannel(block.channel().to_string()));
            }
        }

        Ok(Self { blocks, parallel })
    }

    /// Builds one block per configured channel, predicates resolved once here
    pub fn from_directives(
        directives: &DirectiveSet,
        registry: &PredicateRegistry,
        parallel: bool,
    ) -> Result<Self, DirectiveError> {
        let mut blocks = Vec::with_capacity(directives.channels().len());

        for channel in directives.channels() {
            let predicate: Box<dyn Predicate> = match &channel.filter {
                Some(filter) => registry.build(&channel.channel, &filter.unit, &filter.config)?,
                None => Box::new(NoFilter),
            };
            blocks.push(
                FilterBlock::new(channel.channel.clone(), predicate, channel.auto_complete)
                    .with_tags(channel.tags.clone())
                    .with_retro_complete(channel.retro_complete),
            );
        }

        Self::new(blocks, parallel)
    }

    /// Backs every block's auto-complete memory with the store
    pub fn with_ledger(mut self, ledger: Arc<dyn AcceptanceLedger>) -> Self {
        for block in &mut self.blocks {
            block.set_ledger(ledger.clone());
        }
        self
    }

    pub fn channels(&self) -> Vec<&str> {
        self.blocks.iter().map(|b| b.channel()).collect()
    }

    pub fn seed(&mut self, channel: &str, stocks: impl IntoIterator<Item = StockId>) {
        if let Some(block) = self.blocks.iter_mut().find(|b| b.channel() == channel) {
            block.seed(stocks);
        }
    }

    /// One verdict per channel, in configured order
    ///
    /// A panicking predicate only costs its own channel a rejection, in
    /// either mode.
    pub fn evaluate(&mut self, alert: &CanonicalAlert) -> Vec<FilterVerdict> {
        let results: Vec<Option<FilterVerdict>> = if !self.parallel || self.blocks.len() < 2 {
            self.blocks
                .iter_mut()
                .map(|block| catch_unwind(AssertUnwindSafe(|| block.evaluate(alert))).ok())
                .collect()
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = self
                    .blocks
                    .iter_mut()
                    .map(|block| scope.spawn(move || block.evaluate(alert)))
                    .collect();
                handles.into_iter().map(|h| h.join().ok()).collect()
            })
        };

        results
            .into_iter()
            .zip(self.blocks.iter())
            .map(|(result, block)| result.unwrap_or_else(|| panicked(block, alert)))
            .collect()
    }

    /// `None` when every channel rejected
    pub fn aggregate(verdicts: &[FilterVerdict]) -> Option<IngestSelection> {
        let mut selection = IngestSelection::default();

        for verdict in verdicts {
            match verdict.outcome {
                FilterOutcome::AcceptAll => selection.insert(&verdict.channel, Selection::All),
                FilterOutcome::AcceptGroup(group) => {
                    selection.insert(&verdict.channel, Selection::Groups([group].into()))
                }
                FilterOutcome::Reject { .. } => {}
            }
            if verdict.retro_complete {
                selection.mark_retro(&verdict.channel);
            }
        }

        (!selection.is_empty()).then_some(selection)
    }

    /// Adds accepting channels' tags to the alert's annotations
    pub fn annotate(&self, alert: &mut CanonicalAlert, selection: &IngestSelection) {
        for block in &self.blocks {
            if selection.get(block.channel()).is_some() {
                for tag in block.tags() {
                    alert.annotations_mut().tag(tag.clone());
                }
            }
        }
    }

    pub fn previously_accepted(&self, stock: StockId) -> bool {
        self.blocks.iter().any(|b| b.has_accepted(stock))
    }

    pub fn accepted_by(&self, channel: &str, stock: StockId) -> bool {
        self.blocks
            .iter()
            .any(|b| b.channel() == channel && b.has_accepted(stock))
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        self.blocks
            .iter()
            .map(|b| b.counters().snapshot(b.channel()))
            .collect()
    }
}

fn panicked(block: &FilterBlock, alert: &CanonicalAlert) -> FilterVerdict {
    bump(&block.counters().errors);
    bump(&block.counters().rejected);
    log::error!(
        "❌ Filter panicked in channel {} for alert {}",
        block.channel(),
        alert.alert_id
    );

    let mut verdict = FilterVerdict::new(block.channel(), FilterOutcome::reject());
    verdict.error = Some(FilterError::new(block.channel(), "filter panicked"));
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::test_support::raw_alert;
    use crate::alert::AlertShaper;
    use crate::filter::predicate::RejectAll;
    use crate::filter::AutoComplete;

    struct Group(u32);

    impl Predicate for Group {
        fn evaluate(&self, _alert: &CanonicalAlert) -> Result<FilterOutcome, String> {
            Ok(FilterOutcome::AcceptGroup(self.0))
        }
    }

    struct Panicking;

    impl Predicate for Panicking {
        fn evaluate(&self, _alert: &CanonicalAlert) -> Result<FilterOutcome, String> {
            panic!("boom")
        }
    }

    fn x123() -> CanonicalAlert {
        AlertShaper::default().shape(raw_alert(1, "X123", vec![])).unwrap()
    }

    fn handler(parallel: bool) -> FilterBlocksHandler {
        FilterBlocksHandler::new(
            vec![
                FilterBlock::new("A", Box::new(NoFilter), AutoComplete::Overrule).with_tags(vec!["TAG_A".into()]),
                FilterBlock::new("B", Box::new(RejectAll { code: None }), AutoComplete::Overrule),
                FilterBlock::new("G", Box::new(Group(2)), AutoComplete::Overrule),
            ],
            parallel,
        )
        .unwrap()
    }

    #[test]
    fn test_verdicts_in_channel_order() {
        for parallel in [false, true] {
            let mut handler = handler(parallel);
            let verdicts = handler.evaluate(&x123());

            let channels: Vec<&str> = verdicts.iter().map(|v| v.channel.as_str()).collect();
            assert_eq!(channels, vec!["A", "B", "G"]);
            assert_eq!(verdicts[0].outcome, FilterOutcome::AcceptAll);
            assert!(!verdicts[1].is_accept());
            assert_eq!(verdicts[2].outcome, FilterOutcome::AcceptGroup(2));
        }
    }

    #[test]
    fn test_aggregate_and_annotate() {
        let mut handler = handler(false);
        let mut alert = x123();
        let verdicts = handler.evaluate(&alert);

        let selection = FilterBlocksHandler::aggregate(&verdicts).unwrap();
        assert_eq!(selection.get("A"), Some(&Selection::All));
        assert_eq!(selection.get("B"), None);
        assert_eq!(selection.get("G"), Some(&Selection::Groups([2].into())));

        handler.annotate(&mut alert, &selection);
        assert!(alert.annotations().tags.contains("TAG_A"));
        assert!(handler.previously_accepted(alert.stock));
    }

    #[test]
    fn test_all_reject_aggregates_to_none() {
        let verdicts = vec![FilterVerdict::new("B", FilterOutcome::Reject { code: Some(3) })];
        assert!(FilterBlocksHandler::aggregate(&verdicts).is_none());
    }

    #[test]
    fn test_panicking_channel_isolated() {
        for parallel in [false, true] {
            let mut handler = FilterBlocksHandler::new(
                vec![
                    FilterBlock::new("P", Box::new(Panicking), AutoComplete::Overrule),
                    FilterBlock::new("A", Box::new(NoFilter), AutoComplete::Overrule),
                ],
                parallel,
            )
            .unwrap();

            let verdicts = handler.evaluate(&x123());
            assert!(!verdicts[0].is_accept(), "parallel={}", parallel);
            assert_eq!(verdicts[0].error.as_ref().map(|e| e.channel.as_str()), Some("P"));
            assert!(verdicts[1].is_accept(), "parallel={}", parallel);

            let stats = handler.channel_stats();
            assert_eq!((stats[0].errors, stats[0].rejected), (1, 1));

            // the next alert still reaches every channel
            assert_eq!(handler.evaluate(&x123()).len(), 2);
        }
    }

    #[test]
    fn test_ledger_reaches_every_block() {
        struct Everything;

        impl AcceptanceLedger for Everything {
            fn has_accepted(&self, _stock: StockId, _channel: &str) -> Result<bool, crate::error::StoreError> {
                Ok(true)
            }

            fn stocks_accepted_by(&self, _channel: &str) -> Result<Vec<StockId>, crate::error::StoreError> {
                Ok(Vec::new())
            }
        }

        let mut handler = FilterBlocksHandler::new(
            vec![
                FilterBlock::new("B1", Box::new(RejectAll { code: None }), AutoComplete::Overrule),
                FilterBlock::new("B2", Box::new(RejectAll { code: None }), AutoComplete::Bypass),
            ],
            false,
        )
        .unwrap()
        .with_ledger(Arc::new(Everything));

        let verdicts = handler.evaluate(&x123());
        assert!(verdicts.iter().all(|v| v.is_accept() && v.auto_completed));
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            FilterBlocksHandler::new(vec![], false),
            Err(DirectiveError::NoChannels)
        ));
        let dup = vec![
            FilterBlock::new("A", Box::new(NoFilter), AutoComplete::Off),
            FilterBlock::new("A", Box::new(NoFilter), AutoComplete::Off),
        ];
        assert!(matches!(
            FilterBlocksHandler::new(dup, false),
            Err(DirectiveError::DuplicateChannel(_))
        ));
    }
}
