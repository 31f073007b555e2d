//! Append-only log of fully rejected alerts
//!
//! Every record is a fixed-size little-endian block whose width depends on
//! the layout:
//!
//! ```text
//! Minimal  alert_id u64 | reason u8                                  9 bytes
//! General  alert_id u64 | stock u64 | reason u8                      17 bytes
//! Full     alert_id u64 | stock u64 | timestamp u32 | reason u8      21 bytes
//! active   ... | previously_accepted u8                              +1 byte
//! ```
//!
//! A reason of 0 means the rejection carried no code.

pub mod binary;
pub mod resilient;

use crate::alert::StockId;
use crate::error::RegisterWriteError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use binary::{read_blocks, BinaryAlertRegister, RegisterHeader};
pub use resilient::ResilientRegister;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterLayout {
    Minimal,
    #[default]
    General,
    Full,
}

impl RegisterLayout {
    pub fn block_size(&self, active: bool) -> usize {
        let base = match self {
            RegisterLayout::Minimal => 9,
            RegisterLayout::General => 17,
            RegisterLayout::Full => 21,
        };
        base + usize::from(active)
    }
}

impl FromStr for RegisterLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(RegisterLayout::Minimal),
            "general" => Ok(RegisterLayout::General),
            "full" => Ok(RegisterLayout::Full),
            other => Err(format!("unknown register layout '{}'", other)),
        }
    }
}

impl std::fmt::Display for RegisterLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegisterLayout::Minimal => "minimal",
            RegisterLayout::General => "general",
            RegisterLayout::Full => "full",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub alert_id: u64,
    pub stock: StockId,
    /// Not part of any block layout; kept for log-only output
    pub native_id: String,
    /// Unix seconds
    pub timestamp: u32,
    pub reason: Option<u8>,
    pub previously_accepted: bool,
}

impl RejectionRecord {
    /// Block bytes for `layout`
    pub fn encode(&self, layout: RegisterLayout, active: bool) -> Vec<u8> {
        let mut block = Vec::with_capacity(layout.block_size(active));
        block.extend_from_slice(&self.alert_id.to_le_bytes());

        if layout != RegisterLayout::Minimal {
            block.extend_from_slice(&self.stock.0.to_le_bytes());
        }
        if layout == RegisterLayout::Full {
            block.extend_from_slice(&self.timestamp.to_le_bytes());
        }

        block.push(self.reason.unwrap_or(0));
        if active {
            block.push(u8::from(self.previously_accepted));
        }
        block
    }

    /// Inverse of `encode`; fields the layout omits come back zeroed
    pub fn decode(block: &[u8], layout: RegisterLayout, active: bool) -> Option<Self> {
        if block.len() != layout.block_size(active) {
            return None;
        }

        let u64_at = |at: usize| -> Option<u64> {
            block.get(at..at + 8)?.try_into().ok().map(u64::from_le_bytes)
        };

        let alert_id = u64_at(0)?;
        let mut at = 8;

        let mut stock = StockId(0);
        if layout != RegisterLayout::Minimal {
            stock = StockId(u64_at(at)?);
            at += 8;
        }

        let mut timestamp = 0;
        if layout == RegisterLayout::Full {
            timestamp = u32::from_le_bytes(block.get(at..at + 4)?.try_into().ok()?);
            at += 4;
        }

        let reason = match *block.get(at)? {
            0 => None,
            code => Some(code),
        };
        let previously_accepted = active && *block.get(at + 1)? != 0;

        Some(Self {
            alert_id,
            stock,
            native_id: String::new(),
            timestamp,
            reason,
            previously_accepted,
        })
    }
}

pub trait AlertRegister: Send {
    fn append(&mut self, record: &RejectionRecord) -> Result<(), RegisterWriteError>;

    fn flush(&mut self) -> Result<(), RegisterWriteError>;

    /// Flushes and seals the register; later appends fail with `Closed`
    fn close(&mut self) -> Result<(), RegisterWriteError>;

    fn backend_type(&self) -> &'static str;
}
