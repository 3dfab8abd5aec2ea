use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::{
    now_unix_ms, AuthContext, Candle, ChartInterval, IndicatorInstance, IndicatorRequest,
    IndicatorSeries,
};

#[async_trait]
pub trait CandleService: Send + Sync {
    /// Fetches candles for a symbol/interval. Without a range the remote
    /// returns the most recent `limit` candles.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: ChartInterval,
        range: Option<(i64, i64)>,
        limit: u16,
    ) -> Result<Vec<Candle>, FeedError>;
}

#[async_trait]
pub trait IndicatorService: Send + Sync {
    async fn fetch_indicator(&self, request: &IndicatorRequest)
        -> Result<IndicatorSeries, FeedError>;

    /// Computes several indicators in one round trip. The outer error means
    /// the whole batch failed; inner errors are per-request.
    async fn fetch_indicators_batch(
        &self,
        requests: &[IndicatorRequest],
    ) -> Result<Vec<Result<IndicatorSeries, FeedError>>, FeedError>;
}

#[async_trait]
pub trait InstanceService: Send + Sync {
    async fn list_instances(&self, auth: &AuthContext)
        -> Result<Vec<IndicatorInstance>, FeedError>;
    async fn create_instance(
        &self,
        auth: &AuthContext,
        instance: &IndicatorInstance,
    ) -> Result<(), FeedError>;
    async fn update_instance(
        &self,
        auth: &AuthContext,
        instance: &IndicatorInstance,
    ) -> Result<(), FeedError>;
    async fn delete_instance(&self, auth: &AuthContext, instance_id: &str)
        -> Result<(), FeedError>;
}

fn candles_endpoint(
    base_url: &str,
    symbol: &str,
    interval: ChartInterval,
    range: Option<(i64, i64)>,
    limit: u16,
) -> String {
    let mut endpoint = format!(
        "{base_url}/api/v1/candles?symbol={}&interval={}&limit={limit}",
        symbol.to_ascii_uppercase(),
        interval.as_str()
    );
    if let Some((from, to)) = range {
        endpoint.push_str(&format!("&from={from}&to={to}"));
    }
    endpoint
}

fn indicator_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/v1/indicators/compute")
}

fn indicator_batch_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/v1/indicators/compute-batch")
}

fn instances_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/v1/instances")
}

fn instance_endpoint(base_url: &str, instance_id: &str) -> String {
    format!("{base_url}/api/v1/instances/{instance_id}")
}

#[derive(Debug, Deserialize)]
pub struct CandleWire {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl TryFrom<CandleWire> for Candle {
    type Error = FeedError;

    fn try_from(wire: CandleWire) -> Result<Self, Self::Error> {
        let fields = [wire.o, wire.h, wire.l, wire.c, wire.v];
        if fields.iter().any(|value| !value.is_finite()) {
            return Err(FeedError::InvalidArgument(format!(
                "candle at {} contains non-finite values",
                wire.t
            )));
        }
        Ok(Candle {
            t: wire.t,
            o: wire.o,
            h: wire.h,
            l: wire.l,
            c: wire.c,
            v: wire.v.max(0.0),
        })
    }
}

/// Indicator payload as sent by the remote. Schema v2 carries columnar
/// `fields`; v1 (no `schemaVersion`) carried a flat `time`/`values` pair and
/// is migrated into a single `value` column. Gaps arrive as JSON nulls and
/// map to NaN.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorPayloadWire {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub timestamps: Option<Vec<i64>>,
    #[serde(default)]
    pub fields: Option<BTreeMap<String, Vec<Option<f64>>>>,
    #[serde(default)]
    pub computed_at_ms: Option<i64>,
    #[serde(default)]
    pub time: Option<Vec<i64>>,
    #[serde(default)]
    pub values: Option<Vec<Option<f64>>>,
}

fn densify(values: Vec<Option<f64>>) -> Vec<f64> {
    values
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect()
}

fn ensure_strictly_increasing(timestamps: &[i64]) -> Result<(), FeedError> {
    if timestamps
        .windows(2)
        .any(|window| window[0] >= window[1])
    {
        return Err(FeedError::InvalidArgument(
            "indicator timestamps must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}

impl TryFrom<IndicatorPayloadWire> for IndicatorSeries {
    type Error = FeedError;

    fn try_from(wire: IndicatorPayloadWire) -> Result<Self, Self::Error> {
        match wire.schema_version.unwrap_or(1) {
            2 => {
                let timestamps = wire.timestamps.ok_or_else(|| {
                    FeedError::InvalidArgument("schema v2 payload missing timestamps".to_string())
                })?;
                ensure_strictly_increasing(&timestamps)?;
                let wire_fields = wire.fields.ok_or_else(|| {
                    FeedError::InvalidArgument("schema v2 payload missing fields".to_string())
                })?;
                let mut fields = BTreeMap::new();
                for (name, values) in wire_fields {
                    if values.len() != timestamps.len() {
                        return Err(FeedError::InvalidArgument(format!(
                            "field '{name}' has {} values for {} timestamps",
                            values.len(),
                            timestamps.len()
                        )));
                    }
                    fields.insert(name, densify(values));
                }
                Ok(IndicatorSeries {
                    timestamps,
                    fields,
                    computed_at_ms: wire.computed_at_ms.unwrap_or_else(now_unix_ms),
                })
            }
            1 => {
                let timestamps = wire.time.ok_or_else(|| {
                    FeedError::InvalidArgument("legacy payload missing time array".to_string())
                })?;
                ensure_strictly_increasing(&timestamps)?;
                let values = wire.values.ok_or_else(|| {
                    FeedError::InvalidArgument("legacy payload missing values array".to_string())
                })?;
                if values.len() != timestamps.len() {
                    return Err(FeedError::InvalidArgument(format!(
                        "legacy payload has {} values for {} timestamps",
                        values.len(),
                        timestamps.len()
                    )));
                }
                let fields = BTreeMap::from([("value".to_string(), densify(values))]);
                Ok(IndicatorSeries {
                    timestamps,
                    fields,
                    computed_at_ms: wire.computed_at_ms.unwrap_or_else(now_unix_ms),
                })
            }
            other => Err(FeedError::InvalidArgument(format!(
                "unsupported indicator schema version {other}"
            ))),
        }
    }
}

pub fn parse_indicator_payload(payload: &mut [u8]) -> Result<IndicatorSeries, FeedError> {
    let wire: IndicatorPayloadWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Serialize)]
struct BatchRequestWire<'a> {
    requests: &'a [IndicatorRequest],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchItemWire {
    #[serde(default)]
    indicator: Option<IndicatorPayloadWire>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseWire {
    results: Vec<BatchItemWire>,
}

fn map_batch_item(item: BatchItemWire) -> Result<IndicatorSeries, FeedError> {
    if let Some(message) = item.error {
        return Err(FeedError::Server {
            status: 500,
            message,
        });
    }
    match item.indicator {
        Some(wire) => wire.try_into(),
        None => Err(FeedError::InvalidArgument(
            "batch item carries neither an indicator nor an error".to_string(),
        )),
    }
}

fn parse_batch_payload(
    payload: &mut [u8],
    expected: usize,
) -> Result<Vec<Result<IndicatorSeries, FeedError>>, FeedError> {
    let wire: BatchResponseWire = simd_json::serde::from_slice(payload)?;
    if wire.results.len() != expected {
        return Err(FeedError::InvalidArgument(format!(
            "batch response carries {} results for {expected} requests",
            wire.results.len()
        )));
    }
    Ok(wire.results.into_iter().map(map_batch_item).collect())
}

/// HTTP implementation of all three services against the chartfeed backend.
pub struct HttpFeedClient {
    http: Client,
    base_url: String,
}

impl HttpFeedClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn with_auth(request: RequestBuilder, auth: &AuthContext) -> RequestBuilder {
        match &auth.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CandleService for HttpFeedClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: ChartInterval,
        range: Option<(i64, i64)>,
        limit: u16,
    ) -> Result<Vec<Candle>, FeedError> {
        let endpoint = candles_endpoint(&self.base_url, symbol, interval, range, limit);
        let response = self.http.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<Vec<CandleWire>>().await?;

        let mut candles = Vec::with_capacity(payload.len());
        for wire in payload {
            candles.push(Candle::try_from(wire)?);
        }
        Ok(candles)
    }
}

#[async_trait]
impl IndicatorService for HttpFeedClient {
    async fn fetch_indicator(
        &self,
        request: &IndicatorRequest,
    ) -> Result<IndicatorSeries, FeedError> {
        let response = self
            .http
            .post(indicator_endpoint(&self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let mut payload = response.bytes().await?.to_vec();
        parse_indicator_payload(&mut payload)
    }

    async fn fetch_indicators_batch(
        &self,
        requests: &[IndicatorRequest],
    ) -> Result<Vec<Result<IndicatorSeries, FeedError>>, FeedError> {
        let response = self
            .http
            .post(indicator_batch_endpoint(&self.base_url))
            .json(&BatchRequestWire { requests })
            .send()
            .await?
            .error_for_status()?;
        let mut payload = response.bytes().await?.to_vec();
        parse_batch_payload(&mut payload, requests.len())
    }
}

#[async_trait]
impl InstanceService for HttpFeedClient {
    async fn list_instances(
        &self,
        auth: &AuthContext,
    ) -> Result<Vec<IndicatorInstance>, FeedError> {
        let request = self.http.get(instances_endpoint(&self.base_url));
        let response = Self::with_auth(request, auth)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Vec<IndicatorInstance>>().await?)
    }

    async fn create_instance(
        &self,
        auth: &AuthContext,
        instance: &IndicatorInstance,
    ) -> Result<(), FeedError> {
        let request = self.http.post(instances_endpoint(&self.base_url)).json(instance);
        Self::with_auth(request, auth)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn update_instance(
        &self,
        auth: &AuthContext,
        instance: &IndicatorInstance,
    ) -> Result<(), FeedError> {
        let request = self
            .http
            .put(instance_endpoint(&self.base_url, &instance.id))
            .json(instance);
        Self::with_auth(request, auth)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_instance(
        &self,
        auth: &AuthContext,
        instance_id: &str,
    ) -> Result<(), FeedError> {
        let request = self
            .http
            .delete(instance_endpoint(&self.base_url, instance_id));
        Self::with_auth(request, auth)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://feed.example.com";

    #[test]
    fn candle_endpoint_uppercases_symbol_and_appends_range() {
        let latest = candles_endpoint(BASE, "aapl", ChartInterval::H1, None, 500);
        assert_eq!(
            latest,
            "https://feed.example.com/api/v1/candles?symbol=AAPL&interval=1h&limit=500"
        );

        let ranged = candles_endpoint(BASE, "AAPL", ChartInterval::D1, Some((1_000, 2_000)), 100);
        assert_eq!(
            ranged,
            "https://feed.example.com/api/v1/candles?symbol=AAPL&interval=1d&limit=100&from=1000&to=2000"
        );
    }

    #[test]
    fn instance_endpoints_embed_the_id() {
        assert_eq!(
            instances_endpoint(BASE),
            "https://feed.example.com/api/v1/instances"
        );
        assert_eq!(
            instance_endpoint(BASE, "abc-123"),
            "https://feed.example.com/api/v1/instances/abc-123"
        );
        assert_eq!(
            indicator_batch_endpoint(BASE),
            "https://feed.example.com/api/v1/indicators/compute-batch"
        );
    }

    #[test]
    fn trailing_base_url_slash_is_trimmed() {
        let client = HttpFeedClient::new("https://feed.example.com/");
        assert_eq!(client.base_url, "https://feed.example.com");
    }

    #[test]
    fn candle_wire_rejects_non_finite_values() {
        let bad = CandleWire {
            t: 1,
            o: 1.0,
            h: f64::NAN,
            l: 1.0,
            c: 1.0,
            v: 1.0,
        };
        assert!(Candle::try_from(bad).is_err());

        let negative_volume = CandleWire {
            t: 1,
            o: 1.0,
            h: 2.0,
            l: 0.5,
            c: 1.5,
            v: -3.0,
        };
        let candle = Candle::try_from(negative_volume).expect("candle should convert");
        assert_eq!(candle.v, 0.0);
    }

    #[test]
    fn parses_schema_v2_payloads_with_null_gaps() {
        let mut payload = br#"{
            "schemaVersion": 2,
            "timestamps": [1, 2, 3],
            "fields": {"upper": [null, 2.5, 3.5], "lower": [null, 1.5, 2.5]},
            "computedAtMs": 99
        }"#
        .to_vec();

        let series = parse_indicator_payload(&mut payload).expect("payload should parse");
        assert_eq!(series.timestamps, vec![1, 2, 3]);
        assert_eq!(series.computed_at_ms, 99);
        assert!(series.fields["upper"][0].is_nan());
        assert_eq!(series.fields["upper"][1], 2.5);
        assert_eq!(series.fields.len(), 2);
    }

    #[test]
    fn migrates_legacy_payloads_into_a_value_column() {
        let mut payload = br#"{"time": [10, 20], "values": [1.0, null]}"#.to_vec();

        let series = parse_indicator_payload(&mut payload).expect("legacy payload should parse");
        assert_eq!(series.timestamps, vec![10, 20]);
        assert_eq!(series.fields.len(), 1);
        assert_eq!(series.fields["value"][0], 1.0);
        assert!(series.fields["value"][1].is_nan());
    }

    #[test]
    fn rejects_malformed_payloads() {
        let mut missing_fields = br#"{"schemaVersion": 2, "timestamps": [1]}"#.to_vec();
        assert!(parse_indicator_payload(&mut missing_fields).is_err());

        let mut length_mismatch =
            br#"{"schemaVersion": 2, "timestamps": [1, 2], "fields": {"value": [1.0]}}"#.to_vec();
        assert!(parse_indicator_payload(&mut length_mismatch).is_err());

        let mut unordered =
            br#"{"schemaVersion": 2, "timestamps": [2, 1], "fields": {"value": [1.0, 2.0]}}"#
                .to_vec();
        assert!(parse_indicator_payload(&mut unordered).is_err());

        let mut future_version =
            br#"{"schemaVersion": 9, "timestamps": [1], "fields": {"value": [1.0]}}"#.to_vec();
        assert!(parse_indicator_payload(&mut future_version).is_err());
    }

    #[test]
    fn batch_payloads_split_successes_and_failures() {
        let mut payload = br#"{
            "results": [
                {"indicator": {"schemaVersion": 2, "timestamps": [1], "fields": {"value": [1.0]}}},
                {"error": "unknown indicator type 'zigzag'"}
            ]
        }"#
        .to_vec();

        let results = parse_batch_payload(&mut payload, 2).expect("batch should parse");
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(FeedError::Server { status: 500, .. })
        ));
    }

    #[test]
    fn batch_size_mismatch_is_an_error() {
        let mut payload = br#"{"results": []}"#.to_vec();
        assert!(parse_batch_payload(&mut payload, 2).is_err());
    }

    #[test]
    fn empty_batch_items_are_rejected() {
        let mut payload = br#"{"results": [{}]}"#.to_vec();
        let results = parse_batch_payload(&mut payload, 1).expect("batch envelope should parse");
        assert!(matches!(
            results[0],
            Err(FeedError::InvalidArgument(_))
        ));
    }
}
