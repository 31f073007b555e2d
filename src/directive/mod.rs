//! Channel and directive configuration
//!
//! Loaded once per run from a JSON file:
//!
//! ```json
//! {
//!   "channels": [
//!     { "channel": "A", "filter": { "unit": "NoFilter" }, "directive": "standard",
//!       "auto_complete": "overrule", "tags": ["SN_CANDIDATE"],
//!       "update_rej": true, "retro_complete": false,
//!       "reject": { "register": { "prefix": "rejected_$channel", "layout": "minimal" } } }
//!   ],
//!   "directives": {
//!     "standard": {
//!       "stock_t2": [{ "unit": "T2Summary", "config": {}, "group": [] }],
//!       "point_t2": [{ "unit": "T2Photometry" }],
//!       "combine": [{ "unit": "LightCurve", "select": "points_only",
//!                     "state_t2": [{ "unit": "T2Fit", "group": [1] }] }],
//!       "chain": ["extras"]
//!     },
//!     "extras": { "stock_t2": [{ "unit": "T2CrossMatch" }] }
//!   }
//! }
//! ```

pub mod graph;

use crate::error::{ConfigError, DirectiveError, PipelineError};
use crate::filter::{AutoComplete, PredicateRegistry};
use crate::register::RegisterLayout;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

pub use graph::DirectiveGraph;

/// One derived computation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct T2Compute {
    pub unit: String,
    #[serde(default)]
    pub config: Value,
    /// Accept-group ids this applies to; empty means every group
    #[serde(default)]
    pub group: BTreeSet<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSelect {
    #[default]
    All,
    PointsOnly,
}

/// State computation over a combined set of measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombineNode {
    pub unit: String,
    #[serde(default)]
    pub select: MeasurementSelect,
    #[serde(default)]
    pub state_t2: Vec<T2Compute>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectiveNode {
    #[serde(default)]
    pub stock_t2: Vec<T2Compute>,
    #[serde(default)]
    pub point_t2: Vec<T2Compute>,
    #[serde(default)]
    pub combine: Vec<CombineNode>,
    /// Names of further nodes applied after this one
    #[serde(default)]
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub unit: String,
    #[serde(default)]
    pub config: Value,
}

/// Placeholder replaced by the channel name in register prefixes
pub const CHANNEL_PLACEHOLDER: &str = "$channel";

fn default_register_prefix() -> String {
    format!("rejected_{}", CHANNEL_PLACEHOLDER)
}

fn default_true() -> bool {
    true
}

/// Channel-private rejection register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRegisterConfig {
    #[serde(default = "default_register_prefix")]
    pub prefix: String,
    /// Falls back to the run-wide layout
    #[serde(default)]
    pub layout: Option<RegisterLayout>,
}

impl ChannelRegisterConfig {
    pub fn prefix_for(&self, channel: &str) -> String {
        self.prefix.replace(CHANNEL_PLACEHOLDER, channel)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectConfig {
    #[serde(default)]
    pub register: Option<ChannelRegisterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: String,
    /// No filter means every alert is accepted
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub auto_complete: AutoComplete,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Root directive node; `None` ingests stock and measurements only
    #[serde(default)]
    pub directive: Option<String>,
    /// Where this channel's own rejections go
    #[serde(default)]
    pub reject: Option<RejectConfig>,
    /// Also register rejections that auto-complete overruled
    #[serde(default = "default_true")]
    pub update_rej: bool,
    /// Ingest earlier states of a stock on its first acceptance
    #[serde(default)]
    pub retro_complete: bool,
}

impl ChannelConfig {
    pub fn register(&self) -> Option<&ChannelRegisterConfig> {
        self.reject.as_ref().and_then(|r| r.register.as_ref())
    }
}

#[derive(Debug, Deserialize)]
struct DirectiveFile {
    channels: Vec<ChannelConfig>,
    #[serde(default)]
    directives: BTreeMap<String, DirectiveNode>,
}

/// Validated, immutable channel configuration for one run
#[derive(Debug, Clone)]
pub struct DirectiveSet {
    channels: Vec<ChannelConfig>,
    graph: DirectiveGraph,
}

impl DirectiveSet {
    pub fn new(
        channels: Vec<ChannelConfig>,
        nodes: BTreeMap<String, DirectiveNode>,
        registry: &PredicateRegistry,
    ) -> Result<Self, DirectiveError> {
        if channels.is_empty() {
            return Err(DirectiveError::NoChannels);
        }

        let mut names = HashSet::new();
        for channel in &channels {
            if !names.insert(channel.channel.as_str()) {
                return Err(DirectiveError::DuplicateChannel(channel.channel.clone()));
            }
        }

        let graph = DirectiveGraph::new(nodes)?;

        let mut prefixes = HashSet::new();
        for channel in &channels {
            if let Some(register) = channel.register() {
                let prefix = register.prefix_for(&channel.channel);
                if !prefixes.insert(prefix.clone()) {
                    return Err(DirectiveError::RegisterClash {
                        channel: channel.channel.clone(),
                        prefix,
                    });
                }
            }
        }

        for channel in &channels {
            if let Some(root) = &channel.directive {
                if !graph.contains(root) {
                    return Err(DirectiveError::UnknownNode {
                        referenced_by: format!("Channel {}", channel.channel),
                        name: root.clone(),
                    });
                }
            }
            if let Some(filter) = &channel.filter {
                if !registry.contains(&filter.unit) {
                    return Err(DirectiveError::UnknownPredicate {
                        channel: channel.channel.clone(),
                        unit: filter.unit.clone(),
                    });
                }
            }
        }

        Ok(Self { channels, graph })
    }

    pub fn from_json(json: &str, registry: &PredicateRegistry) -> Result<Self, PipelineError> {
        let file: DirectiveFile = serde_json::from_str(json).map_err(ConfigError::from)?;
        Ok(Self::new(file.channels, file.directives, registry)?)
    }

    pub fn load(path: impl AsRef<Path>, registry: &PredicateRegistry) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::from)?;
        let set = Self::from_json(&json, registry)?;

        log::info!(
            "✅ Loaded {} channel(s) from {}",
            set.channels.len(),
            path.as_ref().display()
        );
        Ok(set)
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.channel == name)
    }

    /// Directive nodes applying to `channel`, depth-first through its chain
    pub fn nodes_for(&self, channel: &str) -> Vec<&DirectiveNode> {
        self.channel(channel)
            .and_then(|c| c.directive.as_deref())
            .map(|root| self.graph.resolve(root))
            .unwrap_or_default()
    }
}
