use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FeedError;

pub const DEFAULT_SYMBOL: &str = "AAPL";
pub const DEFAULT_INTERVAL: ChartInterval = ChartInterval::D1;

pub const DEFAULT_HISTORY_LIMIT: u16 = 500;
pub const MIN_HISTORY_LIMIT: u16 = 50;
pub const MAX_HISTORY_LIMIT: u16 = 5_000;

pub const DEFAULT_CACHE_TTL_MS: i64 = 15 * 60 * 1_000;
pub const MIN_CACHE_TTL_MS: i64 = 10_000;
pub const MAX_CACHE_TTL_MS: i64 = 24 * 60 * 60 * 1_000;

pub const DEFAULT_BACKFILL_COOLDOWN_MS: u64 = 1_500;
pub const MIN_BACKFILL_COOLDOWN_MS: u64 = 250;
pub const MAX_BACKFILL_COOLDOWN_MS: u64 = 60_000;

pub const DEFAULT_MEMORY_CACHE_CAP: usize = 256;
pub const MIN_MEMORY_CACHE_CAP: usize = 16;
pub const MAX_MEMORY_CACHE_CAP: usize = 4_096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChartInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl ChartInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, FeedError> {
        match value {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            other => Err(FeedError::InvalidArgument(format!(
                "unknown chart interval '{other}'"
            ))),
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 5 * 60_000,
            Self::M15 => 15 * 60_000,
            Self::H1 => 60 * 60_000,
            Self::H4 => 4 * 60 * 60_000,
            Self::D1 => 24 * 60 * 60_000,
            Self::W1 => 7 * 24 * 60 * 60_000,
        }
    }

    pub fn is_intraday(self) -> bool {
        matches!(self, Self::M1 | Self::M5 | Self::M15 | Self::H1 | Self::H4)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub symbol: String,
    pub interval: ChartInterval,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionArgs {
    pub symbol: Option<String>,
    pub interval: Option<ChartInterval>,
}

impl SelectionArgs {
    pub fn normalize(&self) -> Result<Selection, FeedError> {
        let symbol = self
            .symbol
            .as_deref()
            .unwrap_or(DEFAULT_SYMBOL)
            .trim()
            .to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(FeedError::InvalidArgument(
                "symbol must not be empty".to_string(),
            ));
        }
        if !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(FeedError::InvalidArgument(format!(
                "symbol '{symbol}' contains unsupported characters"
            )));
        }
        Ok(Selection {
            symbol,
            interval: self.interval.unwrap_or(DEFAULT_INTERVAL),
        })
    }
}

/// Indicator parameter value. Untagged so JSON payloads stay flat; integers
/// are tried before floats so `20` deserializes as `Int(20)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Canonical text form used in request keys. Separator characters in
    /// text values are folded so keys stay splittable on ':'.
    pub fn canonical(&self) -> String {
        match self {
            Self::Flag(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => format!("{value}"),
            Self::Text(value) => value.replace([':', ',', '='], "_"),
        }
    }
}

pub type IndicatorParams = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorInstance {
    pub id: String,
    pub type_name: String,
    pub params: IndicatorParams,
    pub display_name: String,
    #[serde(default)]
    pub style: serde_json::Value,
    pub is_visible: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstanceArgs {
    pub type_name: String,
    #[serde(default)]
    pub params: IndicatorParams,
    pub display_name: Option<String>,
    pub style: Option<serde_json::Value>,
    pub is_visible: Option<bool>,
}

impl NewInstanceArgs {
    pub fn into_instance(self, now_ms: i64) -> Result<IndicatorInstance, FeedError> {
        let type_name = self.type_name.trim().to_ascii_lowercase();
        if type_name.is_empty() {
            return Err(FeedError::InvalidArgument(
                "indicator type must not be empty".to_string(),
            ));
        }
        if !type_name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(FeedError::InvalidArgument(format!(
                "indicator type '{type_name}' contains unsupported characters"
            )));
        }
        let display_name = match self.display_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => type_name.clone(),
        };
        Ok(IndicatorInstance {
            id: Uuid::new_v4().to_string(),
            type_name,
            params: self.params,
            display_name,
            style: self.style.unwrap_or(serde_json::Value::Null),
            is_visible: self.is_visible.unwrap_or(true),
            created_at_ms: now_ms,
        })
    }
}

/// Computed indicator output aligned to candle timestamps. Multi-output
/// indicators carry one named column per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSeries {
    pub timestamps: Vec<i64>,
    pub fields: BTreeMap<String, Vec<f64>>,
    pub computed_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorRequest {
    pub symbol: String,
    pub interval: ChartInterval,
    pub type_name: String,
    pub params: IndicatorParams,
    pub range_from: i64,
    pub range_to: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub bearer_token: Option<String>,
}

impl AuthContext {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.bearer_token.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSettingsArgs {
    pub history_limit: Option<u16>,
    pub cache_ttl_ms: Option<i64>,
    pub backfill_cooldown_ms: Option<u64>,
    pub memory_cache_cap: Option<usize>,
    pub polling_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub history_limit: u16,
    pub cache_ttl_ms: i64,
    pub backfill_cooldown_ms: u64,
    pub memory_cache_cap: usize,
    pub polling_enabled: bool,
}

impl FeedSettingsArgs {
    pub fn normalize(&self) -> Result<FeedConfig, FeedError> {
        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(FeedError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }
        let cache_ttl_ms = self.cache_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS);
        if !(MIN_CACHE_TTL_MS..=MAX_CACHE_TTL_MS).contains(&cache_ttl_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "cacheTtlMs must be between {MIN_CACHE_TTL_MS} and {MAX_CACHE_TTL_MS}"
            )));
        }
        let backfill_cooldown_ms = self
            .backfill_cooldown_ms
            .unwrap_or(DEFAULT_BACKFILL_COOLDOWN_MS);
        if !(MIN_BACKFILL_COOLDOWN_MS..=MAX_BACKFILL_COOLDOWN_MS).contains(&backfill_cooldown_ms) {
            return Err(FeedError::InvalidArgument(format!(
                "backfillCooldownMs must be between {MIN_BACKFILL_COOLDOWN_MS} and {MAX_BACKFILL_COOLDOWN_MS}"
            )));
        }
        let memory_cache_cap = self.memory_cache_cap.unwrap_or(DEFAULT_MEMORY_CACHE_CAP);
        if !(MIN_MEMORY_CACHE_CAP..=MAX_MEMORY_CACHE_CAP).contains(&memory_cache_cap) {
            return Err(FeedError::InvalidArgument(format!(
                "memoryCacheCap must be between {MIN_MEMORY_CACHE_CAP} and {MAX_MEMORY_CACHE_CAP}"
            )));
        }
        Ok(FeedConfig {
            history_limit,
            cache_ttl_ms,
            backfill_cooldown_ms,
            memory_cache_cap,
            polling_enabled: self.polling_enabled.unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedPhase {
    Idle,
    Loading,
    Ready,
    Backfilling,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub phase: FeedPhase,
    pub symbol: String,
    pub interval: ChartInterval,
    pub generation: u64,
    pub candle_version: u64,
    pub covered_from: Option<i64>,
    pub covered_to: Option<i64>,
    pub offline: bool,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: FeedPhase::Idle,
            symbol: DEFAULT_SYMBOL.to_string(),
            interval: DEFAULT_INTERVAL,
            generation: 0,
            candle_version: 0,
            covered_from: None,
            covered_to: None,
            offline: false,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleSeriesSnapshot {
    pub symbol: String,
    pub interval: ChartInterval,
    pub candles: Vec<Candle>,
    pub covered_from: Option<i64>,
    pub covered_to: Option<i64>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FeedEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged { phase: FeedPhase },
    #[serde(rename_all = "camelCase")]
    CandlesUpdated {
        symbol: String,
        interval: ChartInterval,
        version: u64,
    },
    #[serde(rename_all = "camelCase")]
    IndicatorUpdated { instance_id: String },
    #[serde(rename_all = "camelCase")]
    InstancesChanged { count: usize },
    #[serde(rename_all = "camelCase")]
    MutationFailed {
        instance_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub uptime_ms: u128,
    pub generation: u64,
    pub candle_version: u64,
    pub memory_cache_entries: usize,
    pub durable_cache_entries: usize,
    pub pending_mutations: usize,
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_selection_defaults() {
        let selection = SelectionArgs::default()
            .normalize()
            .expect("defaults should normalize");
        assert_eq!(selection.symbol, DEFAULT_SYMBOL);
        assert_eq!(selection.interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn normalizes_symbol_case_and_whitespace() {
        let args = SelectionArgs {
            symbol: Some("  msft ".to_string()),
            interval: Some(ChartInterval::M5),
        };
        let selection = args.normalize().expect("symbol should normalize");
        assert_eq!(selection.symbol, "MSFT");
        assert_eq!(selection.interval, ChartInterval::M5);
    }

    #[test]
    fn rejects_invalid_symbols() {
        let empty = SelectionArgs {
            symbol: Some("   ".to_string()),
            interval: None,
        };
        assert!(empty.normalize().is_err());

        let punctuated = SelectionArgs {
            symbol: Some("BRK.B".to_string()),
            interval: None,
        };
        assert!(punctuated.normalize().is_err());
    }

    #[test]
    fn interval_strings_round_trip() {
        for interval in [
            ChartInterval::M1,
            ChartInterval::M5,
            ChartInterval::M15,
            ChartInterval::H1,
            ChartInterval::H4,
            ChartInterval::D1,
            ChartInterval::W1,
        ] {
            let parsed =
                ChartInterval::parse_str(interval.as_str()).expect("as_str should parse back");
            assert_eq!(parsed, interval);
        }
        assert!(ChartInterval::parse_str("2h").is_err());
    }

    #[test]
    fn interval_durations_are_monotonic() {
        assert!(ChartInterval::M1.duration_ms() < ChartInterval::M5.duration_ms());
        assert!(ChartInterval::H4.duration_ms() < ChartInterval::D1.duration_ms());
        assert!(ChartInterval::M15.is_intraday());
        assert!(!ChartInterval::D1.is_intraday());
    }

    #[test]
    fn param_values_deserialize_untagged() {
        let params: IndicatorParams =
            serde_json::from_str(r#"{"period":20,"factor":2.5,"source":"close","wilder":true}"#)
                .expect("params should deserialize");
        assert_eq!(params["period"], ParamValue::Int(20));
        assert_eq!(params["factor"], ParamValue::Float(2.5));
        assert_eq!(params["source"], ParamValue::Text("close".to_string()));
        assert_eq!(params["wilder"], ParamValue::Flag(true));
    }

    #[test]
    fn canonical_param_text_folds_separators() {
        assert_eq!(ParamValue::Int(20).canonical(), "20");
        assert_eq!(ParamValue::Float(2.5).canonical(), "2.5");
        assert_eq!(ParamValue::Flag(false).canonical(), "false");
        assert_eq!(
            ParamValue::Text("a:b,c=d".to_string()).canonical(),
            "a_b_c_d"
        );
    }

    #[test]
    fn settings_normalize_with_defaults() {
        let config = FeedSettingsArgs::default()
            .normalize()
            .expect("defaults should normalize");
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.cache_ttl_ms, DEFAULT_CACHE_TTL_MS);
        assert_eq!(config.backfill_cooldown_ms, DEFAULT_BACKFILL_COOLDOWN_MS);
        assert!(config.polling_enabled);
    }

    #[test]
    fn settings_validate_ranges() {
        let too_small = FeedSettingsArgs {
            history_limit: Some(10),
            ..Default::default()
        };
        assert!(too_small.normalize().is_err());

        let ttl_out_of_range = FeedSettingsArgs {
            cache_ttl_ms: Some(1),
            ..Default::default()
        };
        assert!(ttl_out_of_range.normalize().is_err());

        let cooldown_too_large = FeedSettingsArgs {
            backfill_cooldown_ms: Some(10 * 60_000),
            ..Default::default()
        };
        assert!(cooldown_too_large.normalize().is_err());
    }

    #[test]
    fn new_instance_args_build_instances() {
        let args = NewInstanceArgs {
            type_name: " SMA ".to_string(),
            params: IndicatorParams::from([("period".to_string(), ParamValue::Int(20))]),
            display_name: None,
            style: None,
            is_visible: None,
        };
        let instance = args.into_instance(1_000).expect("args should build");
        assert_eq!(instance.type_name, "sma");
        assert_eq!(instance.display_name, "sma");
        assert!(instance.is_visible);
        assert_eq!(instance.created_at_ms, 1_000);
        assert!(!instance.id.is_empty());
    }

    #[test]
    fn new_instance_args_reject_bad_type_names() {
        let args = NewInstanceArgs {
            type_name: "sma/fast".to_string(),
            ..Default::default()
        };
        assert!(args.into_instance(0).is_err());
    }

    #[test]
    fn instances_round_trip_through_json() {
        let instance = IndicatorInstance {
            id: "abc".to_string(),
            type_name: "ema".to_string(),
            params: IndicatorParams::from([("period".to_string(), ParamValue::Int(9))]),
            display_name: "EMA 9".to_string(),
            style: serde_json::json!({"color": "#ff9900"}),
            is_visible: true,
            created_at_ms: 42,
        };
        let encoded = serde_json::to_string(&instance).expect("instance should encode");
        assert!(encoded.contains("\"typeName\":\"ema\""));
        let decoded: IndicatorInstance =
            serde_json::from_str(&encoded).expect("instance should decode");
        assert_eq!(decoded, instance);
    }
}
