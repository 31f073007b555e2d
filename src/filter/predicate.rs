//! Filter predicates and the startup-time registry resolving them by unit name

use crate::alert::CanonicalAlert;
use crate::error::DirectiveError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of one predicate invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// `code` is a rejection reason in 1..=255 when the predicate gives one
    Reject { code: Option<u8> },
    AcceptAll,
    AcceptGroup(u32),
}

impl FilterOutcome {
    pub fn is_accept(&self) -> bool {
        !matches!(self, FilterOutcome::Reject { .. })
    }

    pub fn reject() -> Self {
        FilterOutcome::Reject { code: None }
    }
}

pub trait Predicate: Send + Sync {
    /// `Err` carries a failure reason; the owning block turns it into a `FilterError`
    fn evaluate(&self, alert: &CanonicalAlert) -> Result<FilterOutcome, String>;
}

pub type PredicateFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Predicate>, String> + Send + Sync>;

/// Unit name → constructor, resolved once before the run starts
pub struct PredicateRegistry {
    factories: HashMap<String, PredicateFactory>,
}

impl PredicateRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("NoFilter", |_| Ok(Box::new(NoFilter)));
        registry.register("RejectAll", |config| {
            let code = config.get("code").and_then(Value::as_u64);
            match code {
                Some(c) if c == 0 || c > 255 => Err(format!("rejection code {} outside 1..=255", c)),
                _ => Ok(Box::new(RejectAll { code: code.map(|c| c as u8) })),
            }
        });
        registry.register("BasicMultiFilter", |config| {
            Ok(Box::new(BasicMultiFilter::from_config(config)?))
        });
        registry.register("Toggle", |config| {
            let accept = config.get("accept").and_then(Value::as_bool).unwrap_or(false);
            Ok(Box::new(Toggle::new(Arc::new(AtomicBool::new(accept)))))
        });
        registry
    }

    pub fn register<F>(&mut self, unit: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Predicate>, String> + Send + Sync + 'static,
    {
        self.factories.insert(unit.to_string(), Box::new(factory));
    }

    /// Registers `unit` as a toggle bound to an externally held switch
    pub fn register_toggle(&mut self, unit: &str, switch: Arc<AtomicBool>) {
        self.register(unit, move |_| Ok(Box::new(Toggle::new(switch.clone()))));
    }

    pub fn build(
        &self,
        channel: &str,
        unit: &str,
        config: &Value,
    ) -> Result<Box<dyn Predicate>, DirectiveError> {
        let factory = self
            .factories
            .get(unit)
            .ok_or_else(|| DirectiveError::UnknownPredicate {
                channel: channel.to_string(),
                unit: unit.to_string(),
            })?;

        factory(config).map_err(|reason| DirectiveError::InvalidPredicateConfig {
            channel: channel.to_string(),
            reason,
        })
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.factories.contains_key(unit)
    }
}

impl Default for PredicateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub struct NoFilter;

impl Predicate for NoFilter {
    fn evaluate(&self, _alert: &CanonicalAlert) -> Result<FilterOutcome, String> {
        Ok(FilterOutcome::AcceptAll)
    }
}

pub struct RejectAll {
    pub code: Option<u8>,
}

impl Predicate for RejectAll {
    fn evaluate(&self, _alert: &CanonicalAlert) -> Result<FilterOutcome, String> {
        Ok(FilterOutcome::Reject { code: self.code })
    }
}

/// Accepts while the shared switch is on
pub struct Toggle {
    switch: Arc<AtomicBool>,
}

impl Toggle {
    pub fn new(switch: Arc<AtomicBool>) -> Self {
        Self { switch }
    }
}

impl Predicate for Toggle {
    fn evaluate(&self, _alert: &CanonicalAlert) -> Result<FilterOutcome, String> {
        if self.switch.load(Ordering::SeqCst) {
            Ok(FilterOutcome::AcceptAll)
        } else {
            Ok(FilterOutcome::reject())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Gt => lhs > rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Connection {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Criterion {
    pub attribute: String,
    pub operator: Comparison,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Criteria {
    Many(Vec<Criterion>),
    One(Criterion),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    #[serde(deserialize_with = "criteria_list")]
    pub criteria: Vec<Criterion>,
    pub len: u64,
    pub operator: Comparison,
    #[serde(default, rename = "logicalConnection")]
    pub connection: Connection,
}

fn criteria_list<'de, D>(deserializer: D) -> Result<Vec<Criterion>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Criteria::deserialize(deserializer)? {
        Criteria::Many(list) => list,
        Criteria::One(single) => vec![single],
    })
}

/// Counts detections matching every criterion of a condition, compares the
/// count against `len`, then folds the conditions left to right with each
/// condition's logical connection.
#[derive(Debug, Clone, Deserialize)]
pub struct BasicMultiFilter {
    pub filters: Vec<Condition>,
}

impl BasicMultiFilter {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        let filter: BasicMultiFilter =
            serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        if filter.filters.is_empty() {
            return Err("BasicMultiFilter needs at least one condition".to_string());
        }
        Ok(filter)
    }

    fn matching_points(condition: &Condition, alert: &CanonicalAlert) -> u64 {
        alert
            .points
            .iter()
            .filter(|point| {
                condition.criteria.iter().all(|c| {
                    point
                        .body
                        .get(&c.attribute)
                        .and_then(Value::as_f64)
                        .map(|v| c.operator.apply(v, c.value))
                        .unwrap_or(false)
                })
            })
            .count() as u64
    }
}

impl Predicate for BasicMultiFilter {
    fn evaluate(&self, alert: &CanonicalAlert) -> Result<FilterOutcome, String> {
        let mut result = false;

        for (i, condition) in self.filters.iter().enumerate() {
            let count = Self::matching_points(condition, alert);
            let matched = condition.operator.apply(count as f64, condition.len as f64);
            result = if i == 0 {
                matched
            } else {
                match condition.connection {
                    Connection::And => result && matched,
                    Connection::Or => result || matched,
                }
            };
        }

        Ok(if result {
            FilterOutcome::AcceptAll
        } else {
            FilterOutcome::reject()
        })
    }
}
