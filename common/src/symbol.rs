//! Symbol normalization and identifier types.
//!
//! Providers and rule authors refer to the same instrument in several ways:
//! `PF1_USDTRY`, `USD/TRY`, `usdtry`, `USDTRY_AVG`, `CALC-EURTRY`. Everything
//! inside the engine keys on the canonical 6-letter form returned by
//! [`normalize`]; the helpers here produce the other variants on demand.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Suffixes marking a calculated symbol.
pub const DERIVED_SUFFIXES: [&str; 3] = ["AVG", "CROSS", "CALC"];

/// Temporary prefix some calculated outputs carry.
pub const CALC_PREFIX: &str = "CALC-";

const CALC_RATE_PREFIX: &str = "CALC_RATE:";

/// Canonicalize a symbol to its base form.
///
/// Slashes are removed, case is folded, a provider prefix (`PF1_USDTRY`) or a
/// derived suffix (`USDTRY_AVG`, `PF1_USDTRY_AVG`) is stripped.
pub fn normalize(symbol: &str) -> String {
    let mut s = symbol.trim().to_uppercase().replace('/', "");

    if let Some(rest) = s.strip_prefix(CALC_RATE_PREFIX) {
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_prefix(CALC_PREFIX) {
        s = rest.to_string();
    }

    if s.contains('_') {
        let parts: Vec<&str> = s.split('_').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [] => return String::new(),
            [only] => return (*only).to_string(),
            [.., prev, last] if DERIVED_SUFFIXES.contains(last) => {
                return (*prev).to_string();
            }
            [.., last] => return (*last).to_string(),
        }
    }

    s
}

/// `USDTRY` -> `USD/TRY`. Symbols that do not normalize to six letters are
/// returned unchanged.
pub fn with_slash(symbol: &str) -> String {
    let base = normalize(symbol);
    if base.len() == 6 && base.is_ascii() {
        format!("{}/{}", &base[..3], &base[3..])
    } else {
        symbol.to_string()
    }
}

/// `USD/TRY` -> `USDTRY`.
pub fn without_slash(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// Whether the symbol normalizes to exactly six ASCII letters.
pub fn is_valid_symbol(symbol: &str) -> bool {
    let base = normalize(symbol);
    base.len() == 6 && base.chars().all(|c| c.is_ascii_uppercase())
}

/// Whether two symbols share the same base.
pub fn symbols_equivalent(a: &str, b: &str) -> bool {
    let a = normalize(a);
    !a.is_empty() && a == normalize(b)
}

/// Whether the symbol names a calculated rate rather than a raw quote.
pub fn is_derived_symbol(symbol: &str) -> bool {
    let s = symbol.trim().to_uppercase();
    if s.starts_with(CALC_PREFIX) || s.starts_with(CALC_RATE_PREFIX) {
        return true;
    }
    s.rsplit_once('_')
        .map(|(_, suffix)| DERIVED_SUFFIXES.contains(&suffix))
        .unwrap_or(false)
}

/// Every spelling a formula may use for the same calculated rate:
/// bare, `_AVG`, slash-delimited, `_CROSS` and `_CALC`.
pub fn derived_variants(symbol: &str) -> Vec<String> {
    let base = normalize(symbol);
    if base.is_empty() {
        return Vec::new();
    }
    vec![
        base.clone(),
        format!("{base}_AVG"),
        with_slash(&base),
        format!("{base}_CROSS"),
        format!("{base}_CALC"),
    ]
}

/// `("PF1", "usd/try")` -> `PF1_USDTRY`.
pub fn provider_qualified(provider: &str, symbol: &str) -> String {
    format!("{}_{}", provider, normalize(symbol))
}

/// Remove a leading `CALC-` marker.
pub fn strip_calc_prefix(symbol: &str) -> &str {
    symbol.strip_prefix(CALC_PREFIX).unwrap_or(symbol)
}

/// Identifier of one pipeline run.
/// Uses UUID v7 so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
