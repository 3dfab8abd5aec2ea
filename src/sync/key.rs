use std::fmt;

use serde::Serialize;

use crate::types::{ChartInterval, IndicatorParams};

/// Deterministic cache key for one remote data request. The text form is
/// colon-separated so invalidation predicates can match on segments:
///
/// `candles:AAPL:1d:1000-2000`
/// `indicator:AAPL:1d:sma:period=20,source=close:1000-2000`
///
/// The range segment is omitted when the caller wants range-independent
/// caching (latest-window fetches). Empty params collapse to `-` so the
/// segment positions stay fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn candles(symbol: &str, interval: ChartInterval, range: Option<(i64, i64)>) -> Self {
        let mut key = format!(
            "candles:{}:{}",
            symbol.to_ascii_uppercase(),
            interval.as_str()
        );
        if let Some((from, to)) = range {
            key.push_str(&format!(":{from}-{to}"));
        }
        Self(key)
    }

    pub fn indicator(
        symbol: &str,
        interval: ChartInterval,
        type_name: &str,
        params: &IndicatorParams,
        range: Option<(i64, i64)>,
    ) -> Self {
        let mut key = format!(
            "indicator:{}:{}:{}",
            symbol.to_ascii_uppercase(),
            interval.as_str(),
            indicator_config_segment(type_name, params)
        );
        if let Some((from, to)) = range {
            key.push_str(&format!(":{from}-{to}"));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `type:params` portion of an indicator key. Params iterate in sorted
/// name order (BTreeMap), so insertion order never changes the key.
pub fn indicator_config_segment(type_name: &str, params: &IndicatorParams) -> String {
    if params.is_empty() {
        return format!("{type_name}:-");
    }
    let joined = params
        .iter()
        .map(|(name, value)| format!("{name}={}", value.canonical()))
        .collect::<Vec<_>>()
        .join(",");
    format!("{type_name}:{joined}")
}

/// True when `key` is an indicator key carrying exactly this config segment.
pub fn matches_indicator_config(key: &str, config_segment: &str) -> bool {
    if !key.starts_with("indicator:") {
        return false;
    }
    key.contains(&format!(":{config_segment}:")) || key.ends_with(&format!(":{config_segment}"))
}
