use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::state::{IndicatorSlot, PublishedState};
use crate::sync::cache::TieredCache;
use crate::sync::fetch::{fetch_with_retry, FetchOutcome, RetryPolicy};
use crate::sync::key::RequestKey;
use crate::sync::remote::IndicatorService;
use crate::sync::selection::{Generation, SelectionGuard};
use crate::types::{IndicatorInstance, IndicatorRequest, IndicatorSeries, Selection};

/// One deduplicated remote request plus the instances that share it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFetch {
    pub key: RequestKey,
    pub request: IndicatorRequest,
    pub instance_ids: Vec<String>,
}

/// Groups visible instances by request key for the covered range. Instances
/// with identical type and params collapse into one fetch.
pub fn plan_requests(
    instances: &[IndicatorInstance],
    selection: &Selection,
    range: (i64, i64),
) -> Vec<PlannedFetch> {
    let mut planned: Vec<PlannedFetch> = Vec::new();
    for instance in instances.iter().filter(|instance| instance.is_visible) {
        let key = RequestKey::indicator(
            &selection.symbol,
            selection.interval,
            &instance.type_name,
            &instance.params,
            Some(range),
        );
        match planned.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.instance_ids.push(instance.id.clone()),
            None => planned.push(PlannedFetch {
                key,
                request: IndicatorRequest {
                    symbol: selection.symbol.clone(),
                    interval: selection.interval,
                    type_name: instance.type_name.clone(),
                    params: instance.params.clone(),
                    range_from: range.0,
                    range_to: range.1,
                },
                instance_ids: vec![instance.id.clone()],
            }),
        }
    }
    planned
}

/// Plans and executes indicator fetches for the current selection: cache
/// probe first, then one batch call for several misses or a single call for
/// one. Results publish only if the selection generation is still current
/// and the instance still exists; cache writes happen regardless.
pub struct IndicatorOrchestrator {
    state: Arc<PublishedState>,
    cache: Arc<TieredCache>,
    service: Arc<dyn IndicatorService>,
    guard: Arc<SelectionGuard>,
    policy: RetryPolicy,
    cache_ttl_ms: i64,
}

impl IndicatorOrchestrator {
    pub fn new(
        state: Arc<PublishedState>,
        cache: Arc<TieredCache>,
        service: Arc<dyn IndicatorService>,
        guard: Arc<SelectionGuard>,
        policy: RetryPolicy,
        cache_ttl_ms: i64,
    ) -> Self {
        Self {
            state,
            cache,
            service,
            guard,
            policy,
            cache_ttl_ms,
        }
    }

    pub async fn run_pass(
        &self,
        selection: &Selection,
        covered: Option<(i64, i64)>,
        generation: Generation,
        cancel: &CancellationToken,
    ) {
        let Some(range) = covered else {
            debug!(
                symbol = %selection.symbol,
                "skipping indicator pass: candles cover no range yet"
            );
            return;
        };
        let instances = self.state.instances();
        let planned = plan_requests(&instances, selection, range);
        if planned.is_empty() {
            return;
        }

        let mut misses: Vec<PlannedFetch> = Vec::new();
        for fetch in planned {
            match self.cache.get::<IndicatorSeries>(&fetch.key).await {
                Some(series) => {
                    debug!(key = %fetch.key, "indicator served from cache");
                    self.publish_series(generation, &fetch.instance_ids, series);
                }
                None => misses.push(fetch),
            }
        }
        if misses.is_empty() {
            return;
        }
        for fetch in &misses {
            self.publish_pending(generation, &fetch.instance_ids);
        }

        if misses.len() == 1 {
            if let Some(fetch) = misses.pop() {
                self.execute_individual(fetch, generation, cancel).await;
            }
        } else {
            self.execute_batch(misses, generation, cancel).await;
        }
    }

    /// Re-runs the plan-and-fetch path for a single instance after a failed
    /// fetch.
    pub async fn retry_instance(
        &self,
        selection: &Selection,
        covered: Option<(i64, i64)>,
        generation: Generation,
        cancel: &CancellationToken,
        instance_id: &str,
    ) -> Result<(), FeedError> {
        let Some(range) = covered else {
            return Err(FeedError::InvalidArgument(
                "candles cover no range for the current selection yet".to_string(),
            ));
        };
        let instances = self.state.instances();
        let Some(instance) = instances
            .iter()
            .find(|instance| instance.id == instance_id)
        else {
            return Err(FeedError::InvalidArgument(format!(
                "unknown indicator instance '{instance_id}'"
            )));
        };
        let mut planned = plan_requests(std::slice::from_ref(instance), selection, range);
        let Some(fetch) = planned.pop() else {
            return Err(FeedError::InvalidArgument(format!(
                "indicator instance '{instance_id}' is hidden"
            )));
        };

        if let Some(series) = self.cache.get::<IndicatorSeries>(&fetch.key).await {
            self.publish_series(generation, &fetch.instance_ids, series);
            return Ok(());
        }
        self.publish_pending(generation, &fetch.instance_ids);
        self.execute_individual(fetch, generation, cancel).await;
        Ok(())
    }

    async fn execute_batch(
        &self,
        misses: Vec<PlannedFetch>,
        generation: Generation,
        cancel: &CancellationToken,
    ) {
        let requests: Vec<IndicatorRequest> =
            misses.iter().map(|fetch| fetch.request.clone()).collect();
        let outcome = fetch_with_retry("indicators.batch", &self.policy, cancel, || {
            self.service.fetch_indicators_batch(&requests)
        })
        .await;

        match outcome {
            FetchOutcome::Success(results) => {
                self.state.set_offline(false);
                for (fetch, result) in misses.into_iter().zip(results) {
                    match result {
                        Ok(series) => self.apply_series(fetch, generation, series).await,
                        Err(error) => self.apply_failure(&fetch, generation, &error),
                    }
                }
            }
            FetchOutcome::Failed(error) => {
                warn!(
                    error = %error,
                    "batch indicator fetch failed; falling back to individual requests"
                );
                if error.is_network() {
                    self.state.set_offline(true);
                }
                let fallbacks = misses
                    .into_iter()
                    .map(|fetch| self.execute_individual(fetch, generation, cancel));
                join_all(fallbacks).await;
            }
            FetchOutcome::Cancelled => {
                debug!("batch indicator fetch cancelled");
            }
        }
    }

    async fn execute_individual(
        &self,
        fetch: PlannedFetch,
        generation: Generation,
        cancel: &CancellationToken,
    ) {
        let outcome = fetch_with_retry(fetch.key.as_str(), &self.policy, cancel, || {
            self.service.fetch_indicator(&fetch.request)
        })
        .await;

        match outcome {
            FetchOutcome::Success(series) => {
                self.state.set_offline(false);
                self.apply_series(fetch, generation, series).await;
            }
            FetchOutcome::Failed(error) => {
                if error.is_network() {
                    self.state.set_offline(true);
                }
                self.apply_failure(&fetch, generation, &error);
            }
            FetchOutcome::Cancelled => {
                debug!(key = %fetch.key, "indicator fetch cancelled");
            }
        }
    }

    async fn apply_series(
        &self,
        fetch: PlannedFetch,
        generation: Generation,
        series: IndicatorSeries,
    ) {
        // Cache writes are keyed by request, not selection, so stale
        // generations still warm the cache for the next visit.
        self.cache.set(&fetch.key, &series, self.cache_ttl_ms).await;
        self.publish_series(generation, &fetch.instance_ids, series);
    }

    fn publish_series(
        &self,
        generation: Generation,
        instance_ids: &[String],
        series: IndicatorSeries,
    ) {
        if !self.guard.is_current(generation) {
            debug!(
                generation = generation.value(),
                "discarding indicator results for a superseded selection"
            );
            return;
        }
        let active = self.state.instances();
        for instance_id in instance_ids {
            if !active.iter().any(|instance| instance.id == *instance_id) {
                debug!(instance_id = %instance_id, "discarding result for a removed instance");
                continue;
            }
            self.state.publish_indicator(
                instance_id,
                IndicatorSlot::Ready {
                    series: series.clone(),
                },
            );
        }
    }

    fn publish_pending(&self, generation: Generation, instance_ids: &[String]) {
        if !self.guard.is_current(generation) {
            return;
        }
        for instance_id in instance_ids {
            self.state
                .publish_indicator(instance_id, IndicatorSlot::Pending);
        }
    }

    fn apply_failure(&self, fetch: &PlannedFetch, generation: Generation, error: &FeedError) {
        warn!(key = %fetch.key, error = %error, "indicator fetch failed");
        if !self.guard.is_current(generation) {
            return;
        }
        let active = self.state.instances();
        for instance_id in &fetch.instance_ids {
            if !active.iter().any(|instance| instance.id == *instance_id) {
                continue;
            }
            self.state.publish_indicator(
                instance_id,
                IndicatorSlot::Failed {
                    message: error.to_string(),
                },
            );
        }
    }
}
