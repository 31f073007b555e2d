//! Native object id ⇄ numeric stock id
//!
//! Two schemes are provided. `Base62Identity` is bijective base-62
//! numeration: every non-empty string of at most 10 characters from
//! `[0-9A-Za-z]` maps to exactly one non-zero `u64`, and back.
//! `ZtfIdentity`, the default, packs survey names of the form
//! `ZTF<yy><7 lowercase letters>` into the low range and hands everything
//! else to base-62, shifted above that range so the two never collide.

use super::StockId;
use crate::error::ShapeError;
use std::collections::HashMap;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;

pub const MAX_NATIVE_ID_LEN: usize = 10;

const ZTF_PREFIX: &str = "ZTF";
const ZTF_LETTERS: usize = 7;
/// 26^7, one survey year's worth of names
const ZTF_YEAR_SPAN: u64 = 8_031_810_176;
/// Stock ids `1..=ZTF_SPACE` are packed survey names
pub const ZTF_SPACE: u64 = 100 * ZTF_YEAR_SPAN;

pub trait IdentityScheme: Send + Sync {
    fn encode(&self, native_id: &str) -> Result<StockId, ShapeError>;
    fn decode(&self, stock: StockId) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Base62Identity;

fn digit(c: u8) -> Option<u64> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u64),
        b'A'..=b'Z' => Some((c - b'A') as u64 + 10),
        b'a'..=b'z' => Some((c - b'a') as u64 + 36),
        _ => None,
    }
}

impl IdentityScheme for Base62Identity {
    fn encode(&self, native_id: &str) -> Result<StockId, ShapeError> {
        let invalid = |reason: &str| ShapeError::InvalidIdentity {
            native_id: native_id.to_string(),
            reason: reason.to_string(),
        };

        if native_id.is_empty() {
            return Err(invalid("empty"));
        }
        if native_id.len() > MAX_NATIVE_ID_LEN {
            return Err(invalid("longer than 10 characters"));
        }

        let mut value: u64 = 0;
        for c in native_id.bytes() {
            let d = digit(c).ok_or_else(|| invalid("character outside [0-9A-Za-z]"))?;
            value = value
                .checked_mul(BASE)
                .and_then(|v| v.checked_add(d + 1))
                .ok_or_else(|| invalid("overflow"))?;
        }

        Ok(StockId(value))
    }

    fn decode(&self, stock: StockId) -> Option<String> {
        let mut n = stock.0;
        if n == 0 {
            return None;
        }

        let mut out = Vec::with_capacity(MAX_NATIVE_ID_LEN);
        while n > 0 {
            let r = (n - 1) % BASE;
            out.push(ALPHABET[r as usize]);
            n = (n - 1) / BASE;
        }
        out.reverse();

        String::from_utf8(out).ok()
    }
}

/// Survey-aware scheme with a base-62 fallback
#[derive(Debug, Clone, Copy, Default)]
pub struct ZtfIdentity;

impl ZtfIdentity {
    fn pack(native_id: &str) -> Option<u64> {
        let rest = native_id.strip_prefix(ZTF_PREFIX)?;
        let bytes = rest.as_bytes();
        if bytes.len() != 2 + ZTF_LETTERS || !bytes[..2].iter().all(u8::is_ascii_digit) {
            return None;
        }

        let year = ((bytes[0] - b'0') * 10 + (bytes[1] - b'0')) as u64;
        let mut letters: u64 = 0;
        for &c in &bytes[2..] {
            if !c.is_ascii_lowercase() {
                return None;
            }
            letters = letters * 26 + (c - b'a') as u64;
        }

        Some(year * ZTF_YEAR_SPAN + letters + 1)
    }

    fn unpack(stock: u64) -> String {
        let value = stock - 1;
        let year = value / ZTF_YEAR_SPAN;
        let mut letters = value % ZTF_YEAR_SPAN;

        let mut tail = [b'a'; ZTF_LETTERS];
        for slot in tail.iter_mut().rev() {
            *slot = b'a' + (letters % 26) as u8;
            letters /= 26;
        }

        format!("{}{:02}{}", ZTF_PREFIX, year, String::from_utf8_lossy(&tail))
    }
}

impl IdentityScheme for ZtfIdentity {
    fn encode(&self, native_id: &str) -> Result<StockId, ShapeError> {
        if let Some(stock) = Self::pack(native_id) {
            return Ok(StockId(stock));
        }

        let fallback = Base62Identity.encode(native_id)?;
        fallback
            .0
            .checked_add(ZTF_SPACE)
            .map(StockId)
            .ok_or_else(|| ShapeError::InvalidIdentity {
                native_id: native_id.to_string(),
                reason: "overflow".to_string(),
            })
    }

    fn decode(&self, stock: StockId) -> Option<String> {
        match stock.0 {
            0 => None,
            n if n <= ZTF_SPACE => Some(Self::unpack(n)),
            n => Base62Identity.decode(StockId(n - ZTF_SPACE)),
        }
    }
}

/// Process-lifetime cache in front of an identity scheme
pub struct IdentityCache {
    scheme: Box<dyn IdentityScheme>,
    cache: HashMap<String, StockId>,
    hits: u64,
    misses: u64,
}

impl IdentityCache {
    pub fn new(scheme: Box<dyn IdentityScheme>) -> Self {
        Self {
            scheme,
            cache: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn resolve(&mut self, native_id: &str) -> Result<StockId, ShapeError> {
        if let Some(stock) = self.cache.get(native_id) {
            self.hits += 1;
            return Ok(*stock);
        }

        let stock = self.scheme.encode(native_id)?;
        self.cache.insert(native_id.to_string(), stock);
        self.misses += 1;
        Ok(stock)
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new(Box::new(ZtfIdentity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        let scheme = Base62Identity;
        assert_eq!(scheme.encode("0").unwrap(), StockId(1));
        assert_eq!(scheme.encode("z").unwrap(), StockId(62));
        assert_eq!(scheme.encode("00").unwrap(), StockId(63));
        assert_eq!(scheme.encode("10").unwrap(), StockId(125));
    }

    #[test]
    fn test_bijection_on_sample_ids() {
        let scheme = Base62Identity;
        for native in ["X123", "ZTF18abcdef", "a", "zzzzzzzzzz", "000", "ZTF21aaqjm"] {
            let stock = scheme.encode(native).unwrap();
            assert_eq!(scheme.decode(stock).as_deref(), Some(native));
        }
    }

    #[test]
    fn test_leading_zeros_are_distinct() {
        let scheme = Base62Identity;
        assert_ne!(scheme.encode("0A").unwrap(), scheme.encode("A").unwrap());
    }

    #[test]
    fn test_malformed_ids_rejected() {
        let scheme = Base62Identity;
        assert!(scheme.encode("").is_err());
        assert!(scheme.encode("X-123").is_err());
        assert!(scheme.encode("ZTF18abcdefg").is_err());
        assert_eq!(scheme.decode(StockId(0)), None);
    }

    #[test]
    fn test_cache_counts_hits() {
        let mut cache = IdentityCache::default();
        let first = cache.resolve("X123").unwrap();
        let second = cache.resolve("X123").unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(ZtfIdentity.decode(first).as_deref(), Some("X123"));
    }

    #[test]
    fn test_survey_names_pack_into_low_range() {
        let scheme = ZtfIdentity;
        assert_eq!(scheme.encode("ZTF00aaaaaaa").unwrap(), StockId(1));
        assert_eq!(scheme.encode("ZTF99zzzzzzz").unwrap(), StockId(ZTF_SPACE));

        for native in ["ZTF18abcdefg", "ZTF21aaqjmxy", "ZTF20zzzzzza"] {
            let stock = scheme.encode(native).unwrap();
            assert!(stock.0 <= ZTF_SPACE);
            assert_eq!(scheme.decode(stock).as_deref(), Some(native));
        }
    }

    #[test]
    fn test_other_names_fall_back_above_survey_range() {
        let scheme = ZtfIdentity;
        for native in ["X123", "ZTF18abc", "ZTF18ABCD", "zzzzzzzzzz"] {
            let stock = scheme.encode(native).unwrap();
            assert!(stock.0 > ZTF_SPACE, "{} landed in the survey range", native);
            assert_eq!(scheme.decode(stock).as_deref(), Some(native));
        }

        assert_ne!(
            scheme.encode("ZTF18abcdefg").unwrap(),
            scheme.encode("ZTF18abcdef").unwrap()
        );
        assert!(scheme.encode("ZTF18abcdefgh").is_err());
        assert!(scheme.encode("").is_err());
    }

    #[test]
    fn test_default_cache_accepts_survey_names() {
        let mut cache = IdentityCache::default();
        let stock = cache.resolve("ZTF18abcdefg").unwrap();
        assert_eq!(ZtfIdentity.decode(stock).as_deref(), Some("ZTF18abcdefg"));
    }
}
