//! Variant identity
//!
//! A variant is one quantization configuration of the source model. Keys are
//! stored in thousandths of a bit so that `2.5` and `2.50` are the same key and
//! ordering is exact.

use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Largest bit width accepted as a variant key.
const MAX_BITS: f64 = 64.0;

/// Target bits per weight, in thousandths of a bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitsPerWeight(u32);

impl BitsPerWeight {
    /// Build from thousandths of a bit (`2500` is 2.5 bpw)
    pub fn from_millibits(millibits: u32) -> Self {
        Self(millibits)
    }

    /// Raw value in thousandths of a bit
    pub fn millibits(&self) -> u32 {
        self.0
    }

    /// Value as a float, for passing to a backend
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl FromStr for BitsPerWeight {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("Invalid bits-per-weight: '{}'", s)))?;

        if !value.is_finite() || value <= 0.0 || value > MAX_BITS {
            return Err(PipelineError::Config(format!(
                "Bits-per-weight must be in (0, {}]: '{}'",
                MAX_BITS, s
            )));
        }

        let millibits = (value * 1000.0).round();
        if (millibits / 1000.0 - value).abs() > 1e-9 {
            return Err(PipelineError::Config(format!(
                "Bits-per-weight supports at most three decimals: '{}'",
                s
            )));
        }

        Ok(Self(millibits as u32))
    }
}

impl fmt::Display for BitsPerWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 1000;
        let frac = self.0 % 1000;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:03}", frac);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

/// Identity of a variant within one model.
///
/// `Base` is the unquantized source model. It sorts before every quantized
/// variant and is rendered as `bf16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariantKey {
    Base,
    Bpw(BitsPerWeight),
}

impl VariantKey {
    /// Label used for the unquantized source model
    pub const BASE_LABEL: &'static str = "bf16";

    /// Whether this is the unquantized source model
    pub fn is_base(&self) -> bool {
        matches!(self, VariantKey::Base)
    }

    /// Bits per weight, if this is a quantized variant
    pub fn bpw(&self) -> Option<BitsPerWeight> {
        match self {
            VariantKey::Base => None,
            VariantKey::Bpw(b) => Some(*b),
        }
    }
}

impl From<BitsPerWeight> for VariantKey {
    fn from(b: BitsPerWeight) -> Self {
        VariantKey::Bpw(b)
    }
}

impl FromStr for VariantKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("base") || t.eq_ignore_ascii_case(Self::BASE_LABEL) {
            return Ok(VariantKey::Base);
        }
        Ok(VariantKey::Bpw(t.parse()?))
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantKey::Base => f.write_str(Self::BASE_LABEL),
            VariantKey::Bpw(b) => write!(f, "{}", b),
        }
    }
}

impl Serialize for VariantKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VariantKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Parse a variant list given as comma- and/or space-separated tokens.
///
/// Accepts `"2 3 4"`, `"2,3,4"` and mixtures. Duplicates are dropped, first
/// occurrence wins.
pub fn parse_variant_list(s: &str) -> Result<Vec<VariantKey>> {
    let mut out: Vec<VariantKey> = Vec::new();
    for token in s.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        let key: VariantKey = token.parse()?;
        if !out.contains(&key) {
            out.push(key);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> VariantKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(key("4").to_string(), "4");
        assert_eq!(key("2.5").to_string(), "2.5");
        assert_eq!(key("2.50").to_string(), "2.5");
        assert_eq!(key("3.125").to_string(), "3.125");
        assert_eq!(key("base").to_string(), "bf16");
        assert_eq!(key("BF16"), VariantKey::Base);
    }

    #[test]
    fn test_equal_values_are_one_key() {
        assert_eq!(key("4"), key("4.0"));
        assert_eq!(key("2.5"), key("2.500"));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!("".parse::<VariantKey>().is_err());
        assert!("abc".parse::<VariantKey>().is_err());
        assert!("0".parse::<VariantKey>().is_err());
        assert!("-2".parse::<VariantKey>().is_err());
        assert!("65".parse::<VariantKey>().is_err());
        assert!("2.0001".parse::<VariantKey>().is_err());
        assert!("nan".parse::<VariantKey>().is_err());
    }

    #[test]
    fn test_ordering_base_first_then_ascending() {
        let mut keys = vec![key("6"), key("2.5"), key("base"), key("10"), key("2")];
        keys.sort();
        let labels: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(labels, vec!["bf16", "2", "2.5", "6", "10"]);
    }

    #[test]
    fn test_parse_variant_list_mixed_separators() {
        let keys = parse_variant_list("2,3 4, 5  6").unwrap();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], key("2"));
        assert_eq!(keys[4], key("6"));
    }

    #[test]
    fn test_parse_variant_list_drops_duplicates() {
        let keys = parse_variant_list("4 4.0 2 4").unwrap();
        assert_eq!(keys, vec![key("4"), key("2")]);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&key("2.5")).unwrap();
        assert_eq!(json, "\"2.5\"");
        let back: VariantKey = serde_json::from_str("\"bf16\"").unwrap();
        assert_eq!(back, VariantKey::Base);
    }
}
