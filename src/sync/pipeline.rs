use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::state::{IndicatorSlot, PublishedState};
use crate::store::LocalStore;
use crate::sync::cache::TieredCache;
use crate::sync::candles::{BackfillDecision, CandlePhase, CandleStore, MergeOutcome};
use crate::sync::fetch::{fetch_with_retry, FetchOutcome, RetryPolicy};
use crate::sync::key::{indicator_config_segment, matches_indicator_config, RequestKey};
use crate::sync::mutations::MutationCoordinator;
use crate::sync::orchestrator::IndicatorOrchestrator;
use crate::sync::remote::{CandleService, HttpFeedClient, IndicatorService, InstanceService};
use crate::sync::schedule::{start_polling, PollHandle};
use crate::sync::selection::{Generation, SelectionGuard};
use crate::types::{
    now_unix_ms, AuthContext, Candle, CandleSeriesSnapshot, DiagnosticsSnapshot, FeedConfig,
    FeedEvent, FeedPhase, FeedSettingsArgs, FeedStatusSnapshot, IndicatorInstance,
    NewInstanceArgs, Selection, SelectionArgs,
};

/// Store key for the last selected symbol/interval pair.
pub const PREFS_SELECTION_KEY: &str = "prefs:selection";

/// Poll ticks only re-request the most recent candles; merges keep history.
const REFRESH_TAIL_LIMIT: u16 = 3;

/// The remote services the engine talks to. One [`HttpFeedClient`] can back
/// all three, or tests inject mocks per seam.
#[derive(Clone)]
pub struct FeedServices {
    pub candles: Arc<dyn CandleService>,
    pub indicators: Arc<dyn IndicatorService>,
    pub instances: Arc<dyn InstanceService>,
}

impl FeedServices {
    pub fn http(base_url: impl Into<String>) -> Self {
        let client = Arc::new(HttpFeedClient::new(base_url));
        Self {
            candles: Arc::clone(&client) as Arc<dyn CandleService>,
            indicators: Arc::clone(&client) as Arc<dyn IndicatorService>,
            instances: client,
        }
    }
}

/// Everything a spawned selection task needs, cloned up front so the tasks
/// never borrow the engine.
#[derive(Clone)]
struct SelectionTaskContext {
    config: FeedConfig,
    state: Arc<PublishedState>,
    cache: Arc<TieredCache>,
    candles: Arc<Mutex<Option<CandleStore>>>,
    candle_service: Arc<dyn CandleService>,
    orchestrator: Arc<IndicatorOrchestrator>,
    guard: Arc<SelectionGuard>,
    policy: RetryPolicy,
}

/// Ties the components together for one chart: candle loading, polling,
/// backfill, indicator orchestration, and instance mutations. One engine
/// serves one chart surface; the active selection owns the candle store and
/// is replaced wholesale on switch.
pub struct FeedEngine {
    config: FeedConfig,
    state: Arc<PublishedState>,
    store: Arc<dyn LocalStore>,
    cache: Arc<TieredCache>,
    services: FeedServices,
    guard: Arc<SelectionGuard>,
    orchestrator: Arc<IndicatorOrchestrator>,
    mutations: MutationCoordinator,
    candles: Arc<Mutex<Option<CandleStore>>>,
    poll: AsyncMutex<Option<PollHandle>>,
    policy: RetryPolicy,
    root: CancellationToken,
    started_at: Instant,
}

impl FeedEngine {
    pub fn new(
        settings: FeedSettingsArgs,
        store: Arc<dyn LocalStore>,
        services: FeedServices,
    ) -> Result<Self, FeedError> {
        let config = settings.normalize()?;
        let state = Arc::new(PublishedState::new());
        let cache = Arc::new(TieredCache::new(
            Arc::clone(&store),
            config.memory_cache_cap,
        ));
        let root = CancellationToken::new();
        let guard = Arc::new(SelectionGuard::new(root.clone()));
        let policy = RetryPolicy::default();
        let orchestrator = Arc::new(IndicatorOrchestrator::new(
            Arc::clone(&state),
            Arc::clone(&cache),
            Arc::clone(&services.indicators),
            Arc::clone(&guard),
            policy.clone(),
            config.cache_ttl_ms,
        ));
        let mutations = MutationCoordinator::new(
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&services.instances),
            RetryPolicy::mutation(),
            root.clone(),
        );
        Ok(Self {
            config,
            state,
            store,
            cache,
            services,
            guard,
            orchestrator,
            mutations,
            candles: Arc::new(Mutex::new(None)),
            poll: AsyncMutex::new(None),
            policy,
            root,
            started_at: Instant::now(),
        })
    }

    /// Hydrates the indicator instance set. Call once after construction, and
    /// again after authentication changes to re-sync with the backend.
    pub async fn start(&self) {
        self.mutations.hydrate().await;
    }

    pub fn set_auth(&self, auth: AuthContext) {
        self.mutations.set_auth(auth);
    }

    pub async fn saved_selection(&self) -> Option<Selection> {
        let payload = self.store.get(PREFS_SELECTION_KEY).await.ok()??;
        serde_json::from_str(&payload).ok()
    }

    /// Switches the chart to a new symbol/interval. The previous selection's
    /// fetches are cancelled, its poll loop stopped, and a fresh candle load
    /// spawned under the new generation.
    pub async fn select(&self, args: SelectionArgs) -> Result<Selection, FeedError> {
        let selection = args.normalize()?;
        let (generation, cancel) = self.guard.advance();
        // With the old generation cancelled the in-flight tick resolves
        // promptly, so stopping the loop does not stall the switch.
        if let Some(handle) = self.poll.lock().await.take() {
            handle.stop().await;
        }

        let empty_snapshot = {
            let mut candles = self.candles.lock();
            let mut store = CandleStore::new(
                selection.symbol.clone(),
                selection.interval,
                self.config.backfill_cooldown_ms,
            );
            store.begin_load();
            let snapshot = store.snapshot();
            *candles = Some(store);
            snapshot
        };
        self.state.publish_candles(empty_snapshot);
        publish_status(&self.task_context(), FeedPhase::Loading, None);
        self.persist_selection(&selection).await;

        let ctx = self.task_context();
        let task_selection = selection.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_initial_load(ctx, task_selection, generation, task_cancel).await;
        });
        if self.config.polling_enabled {
            self.spawn_poll_loop(selection.clone(), generation).await;
        }
        Ok(selection)
    }

    /// Manual refresh. A selection whose initial load failed restarts from
    /// scratch; otherwise this behaves like one poll tick.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        let phase = {
            let candles = self.candles.lock();
            let Some(store) = candles.as_ref() else {
                return Err(FeedError::InvalidArgument(
                    "no active selection to refresh".to_string(),
                ));
            };
            store.phase()
        };
        let generation = self.guard.current();
        let cancel = self.guard.token();
        let ctx = self.task_context();

        match phase {
            CandlePhase::Empty => {
                let selection = {
                    let mut candles = self.candles.lock();
                    let Some(store) = candles.as_mut() else {
                        return Ok(());
                    };
                    store.begin_load();
                    Selection {
                        symbol: store.symbol().to_string(),
                        interval: store.interval(),
                    }
                };
                publish_status(&ctx, FeedPhase::Loading, None);
                run_initial_load(ctx, selection, generation, cancel).await;
            }
            CandlePhase::Loading => {
                debug!("refresh skipped: a load is already in flight");
            }
            CandlePhase::Ready | CandlePhase::Backfilling => {
                run_refresh_tick(ctx, generation, cancel).await;
            }
        }
        Ok(())
    }

    /// Loads older candles for `[from, to)` and merges them in front of the
    /// covered range. Gating decisions other than `Proceed` are no-ops
    /// reported to the caller.
    pub async fn backfill(&self, from: i64, to: i64) -> Result<BackfillDecision, FeedError> {
        if from >= to {
            return Err(FeedError::InvalidArgument(format!(
                "backfill range is empty: {from} >= {to}"
            )));
        }
        let generation = self.guard.current();
        let cancel = self.guard.token();
        let ctx = self.task_context();

        let selection = {
            let mut candles = self.candles.lock();
            let Some(store) = candles.as_mut() else {
                return Err(FeedError::InvalidArgument(
                    "no active selection to backfill".to_string(),
                ));
            };
            let decision = store.begin_backfill(now_unix_ms());
            if decision != BackfillDecision::Proceed {
                debug!(?decision, "backfill request gated");
                return Ok(decision);
            }
            Selection {
                symbol: store.symbol().to_string(),
                interval: store.interval(),
            }
        };
        publish_status(&ctx, FeedPhase::Backfilling, None);

        // Historical ranges are immutable, so a cached batch is as good as
        // the network's.
        let key = RequestKey::candles(&selection.symbol, selection.interval, Some((from, to)));
        let batch = match self.cache.get::<Vec<Candle>>(&key).await {
            Some(cached) => {
                debug!(key = %key, "backfill served from cache");
                cached
            }
            None => {
                let outcome = fetch_with_retry(key.as_str(), &self.policy, &cancel, || {
                    let service = Arc::clone(&self.services.candles);
                    let selection = selection.clone();
                    let limit = self.config.history_limit;
                    async move {
                        service
                            .fetch_candles(
                                &selection.symbol,
                                selection.interval,
                                Some((from, to)),
                                limit,
                            )
                            .await
                    }
                })
                .await;
                match outcome {
                    FetchOutcome::Success(batch) => {
                        self.state.set_offline(false);
                        self.cache.set(&key, &batch, self.config.cache_ttl_ms).await;
                        batch
                    }
                    FetchOutcome::Failed(error) => {
                        {
                            let mut candles = self.candles.lock();
                            if let Some(store) = candles.as_mut() {
                                store.fail_backfill();
                            }
                        }
                        if error.is_network() {
                            self.state.set_offline(true);
                        }
                        publish_status(
                            &ctx,
                            FeedPhase::Ready,
                            Some(format!("backfill failed: {error}")),
                        );
                        return Err(error);
                    }
                    FetchOutcome::Cancelled => {
                        let mut candles = self.candles.lock();
                        if let Some(store) = candles.as_mut() {
                            store.fail_backfill();
                        }
                        debug!(symbol = %selection.symbol, "backfill cancelled");
                        return Ok(BackfillDecision::Proceed);
                    }
                }
            }
        };

        let has_more = !batch.is_empty();
        let merged = {
            let mut candles = self.candles.lock();
            if !self.guard.is_current(generation) {
                return Ok(BackfillDecision::Proceed);
            }
            let Some(store) = candles.as_mut() else {
                return Ok(BackfillDecision::Proceed);
            };
            match store.complete_backfill(batch, has_more) {
                MergeOutcome::Changed { .. } => Some(store.snapshot()),
                MergeOutcome::Unchanged => None,
            }
        };
        match merged {
            Some(snapshot) => {
                self.state.publish_candles(snapshot);
                publish_status(&ctx, FeedPhase::Ready, None);
                // The extended range produces new request keys; stale ranged
                // entries age out by TTL.
                self.run_orchestration_pass().await;
            }
            None => {
                publish_status(&ctx, FeedPhase::Ready, None);
                debug!(symbol = %selection.symbol, "backfill added no new candles");
            }
        }
        Ok(BackfillDecision::Proceed)
    }

    pub async fn create_instance(
        &self,
        args: NewInstanceArgs,
    ) -> Result<IndicatorInstance, FeedError> {
        let instance = self.mutations.create(args).await?;
        self.run_orchestration_pass().await;
        Ok(instance)
    }

    pub async fn update_instance(&self, updated: IndicatorInstance) -> Result<(), FeedError> {
        let previous = self.state.instance(&updated.id);
        self.mutations.update(updated.clone()).await?;
        if let Some(previous) = previous {
            let config_changed = previous.type_name != updated.type_name
                || previous.params != updated.params;
            if config_changed {
                // Entries computed for the old configuration are logically
                // obsolete for every symbol and range.
                let segment = indicator_config_segment(&previous.type_name, &previous.params);
                let removed = self
                    .cache
                    .invalidate(|key| matches_indicator_config(key, &segment))
                    .await;
                debug!(
                    instance_id = %updated.id,
                    removed,
                    "invalidated cache entries for a reconfigured instance"
                );
            }
        }
        self.run_orchestration_pass().await;
        Ok(())
    }

    pub async fn remove_instance(&self, instance_id: &str) -> Result<(), FeedError> {
        self.mutations.remove(instance_id).await
    }

    /// Re-runs the fetch for one instance after a per-instance failure.
    pub async fn retry_instance_fetch(&self, instance_id: &str) -> Result<(), FeedError> {
        let Some((selection, covered)) = self.current_context() else {
            return Err(FeedError::InvalidArgument(
                "no active selection".to_string(),
            ));
        };
        let generation = self.guard.current();
        let cancel = self.guard.token();
        self.orchestrator
            .retry_instance(&selection, covered, generation, &cancel, instance_id)
            .await
    }

    pub fn status(&self) -> FeedStatusSnapshot {
        self.state.status()
    }

    pub fn candle_series(&self) -> Option<CandleSeriesSnapshot> {
        self.state.candles()
    }

    pub fn indicator_results(&self) -> HashMap<String, IndicatorSlot> {
        self.state.indicator_results()
    }

    pub fn instances(&self) -> Vec<IndicatorInstance> {
        self.state.instances()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.state.subscribe()
    }

    pub async fn fallback_drafts(&self) -> Vec<IndicatorInstance> {
        self.mutations.fallback_drafts().await
    }

    pub async fn prune_cache(&self) -> usize {
        self.cache.prune_expired().await
    }

    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        let candle_version = {
            self.candles
                .lock()
                .as_ref()
                .map(|store| store.version())
                .unwrap_or(0)
        };
        DiagnosticsSnapshot {
            uptime_ms: self.started_at.elapsed().as_millis(),
            generation: self.guard.current().value(),
            candle_version,
            memory_cache_entries: self.cache.memory_len(),
            durable_cache_entries: self.cache.durable_len().await,
            pending_mutations: self.mutations.pending_count(),
        }
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        if let Some(handle) = self.poll.lock().await.take() {
            handle.stop().await;
        }
    }

    async fn run_orchestration_pass(&self) {
        let Some((selection, covered)) = self.current_context() else {
            return;
        };
        let active: Vec<String> = self
            .state
            .instances()
            .iter()
            .map(|instance| instance.id.clone())
            .collect();
        self.state.retain_indicators(&active);
        let generation = self.guard.current();
        let cancel = self.guard.token();
        self.orchestrator
            .run_pass(&selection, covered, generation, &cancel)
            .await;
    }

    fn current_context(&self) -> Option<(Selection, Option<(i64, i64)>)> {
        let candles = self.candles.lock();
        let store = candles.as_ref()?;
        Some((
            Selection {
                symbol: store.symbol().to_string(),
                interval: store.interval(),
            },
            store.covered_range(),
        ))
    }

    async fn spawn_poll_loop(&self, selection: Selection, generation: Generation) {
        let ctx = self.task_context();
        let selection_token = self.guard.token();
        let tick_token = selection_token.clone();
        let handle = start_polling(selection.interval, &selection_token, move || {
            let ctx = ctx.clone();
            let cancel = tick_token.clone();
            async move {
                run_refresh_tick(ctx, generation, cancel).await;
            }
        });
        *self.poll.lock().await = Some(handle);
    }

    async fn persist_selection(&self, selection: &Selection) {
        match serde_json::to_string(selection) {
            Ok(payload) => {
                if let Err(error) = self.store.set(PREFS_SELECTION_KEY, &payload).await {
                    warn!(error = %error, "failed to persist the selection preference");
                }
            }
            Err(error) => warn!(error = %error, "failed to encode the selection preference"),
        }
    }

    fn task_context(&self) -> SelectionTaskContext {
        SelectionTaskContext {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            cache: Arc::clone(&self.cache),
            candles: Arc::clone(&self.candles),
            candle_service: Arc::clone(&self.services.candles),
            orchestrator: Arc::clone(&self.orchestrator),
            guard: Arc::clone(&self.guard),
            policy: self.policy.clone(),
        }
    }
}

fn publish_status(ctx: &SelectionTaskContext, phase: FeedPhase, reason: Option<String>) {
    let snapshot = {
        let candles = ctx.candles.lock();
        let Some(store) = candles.as_ref() else {
            return;
        };
        let covered = store.covered_range();
        FeedStatusSnapshot {
            phase,
            symbol: store.symbol().to_string(),
            interval: store.interval(),
            generation: ctx.guard.current().value(),
            candle_version: store.version(),
            covered_from: covered.map(|(from, _)| from),
            covered_to: covered.map(|(_, to)| to),
            offline: ctx.state.status().offline,
            reason,
        }
    };
    ctx.state.publish_status(snapshot);
}

fn covered_range(ctx: &SelectionTaskContext) -> Option<(i64, i64)> {
    ctx.candles.lock().as_ref().and_then(CandleStore::covered_range)
}

async fn run_initial_load(
    ctx: SelectionTaskContext,
    selection: Selection,
    generation: Generation,
    cancel: CancellationToken,
) {
    let key = RequestKey::candles(&selection.symbol, selection.interval, None);
    let outcome = fetch_with_retry(key.as_str(), &ctx.policy, &cancel, || {
        let service = Arc::clone(&ctx.candle_service);
        let selection = selection.clone();
        let limit = ctx.config.history_limit;
        async move {
            service
                .fetch_candles(&selection.symbol, selection.interval, None, limit)
                .await
        }
    })
    .await;

    match outcome {
        FetchOutcome::Success(batch) => {
            let snapshot = {
                let mut candles = ctx.candles.lock();
                if !ctx.guard.is_current(generation) {
                    debug!(
                        symbol = %selection.symbol,
                        "discarding initial load for a superseded selection"
                    );
                    return;
                }
                let Some(store) = candles.as_mut() else {
                    return;
                };
                store.complete_load(batch);
                store.snapshot()
            };
            ctx.state.set_offline(false);
            ctx.state.publish_candles(snapshot);
            publish_status(&ctx, FeedPhase::Ready, None);
            let covered = covered_range(&ctx);
            ctx.orchestrator
                .run_pass(&selection, covered, generation, &cancel)
                .await;
        }
        FetchOutcome::Failed(error) => {
            {
                let mut candles = ctx.candles.lock();
                if !ctx.guard.is_current(generation) {
                    return;
                }
                if let Some(store) = candles.as_mut() {
                    store.fail_load();
                }
            }
            if error.is_network() {
                ctx.state.set_offline(true);
            }
            publish_status(
                &ctx,
                FeedPhase::Failed,
                Some(format!("initial candle load failed: {error}")),
            );
        }
        FetchOutcome::Cancelled => {
            debug!(symbol = %selection.symbol, "initial candle load cancelled");
        }
    }
}

async fn run_refresh_tick(
    ctx: SelectionTaskContext,
    generation: Generation,
    cancel: CancellationToken,
) {
    let selection = {
        let candles = ctx.candles.lock();
        match candles.as_ref() {
            Some(store) if matches!(store.phase(), CandlePhase::Ready) => Selection {
                symbol: store.symbol().to_string(),
                interval: store.interval(),
            },
            Some(store) => {
                debug!(
                    symbol = %store.symbol(),
                    "skipping refresh while the series is not ready"
                );
                return;
            }
            None => return,
        }
    };

    let outcome = fetch_with_retry("candles.refresh", &ctx.policy, &cancel, || {
        let service = Arc::clone(&ctx.candle_service);
        let selection = selection.clone();
        async move {
            service
                .fetch_candles(
                    &selection.symbol,
                    selection.interval,
                    None,
                    REFRESH_TAIL_LIMIT,
                )
                .await
        }
    })
    .await;

    match outcome {
        FetchOutcome::Success(batch) => {
            let merged = {
                let mut candles = ctx.candles.lock();
                if !ctx.guard.is_current(generation) {
                    return;
                }
                let Some(store) = candles.as_mut() else {
                    return;
                };
                match store.apply_refresh(batch) {
                    MergeOutcome::Changed { .. } => Some(store.snapshot()),
                    MergeOutcome::Unchanged => None,
                }
            };
            ctx.state.set_offline(false);
            match merged {
                Some(snapshot) => {
                    ctx.state.publish_candles(snapshot);
                    publish_status(&ctx, FeedPhase::Ready, None);
                    let covered = covered_range(&ctx);
                    ctx.orchestrator
                        .run_pass(&selection, covered, generation, &cancel)
                        .await;
                }
                None => {
                    debug!(symbol = %selection.symbol, "refresh produced no new candles");
                }
            }
        }
        FetchOutcome::Failed(error) => {
            // The series stays ready with last-good data; the next tick or a
            // manual refresh tries again.
            warn!(symbol = %selection.symbol, error = %error, "poll refresh failed");
            if error.is_network() {
                ctx.state.set_offline(true);
            }
            publish_status(
                &ctx,
                FeedPhase::Ready,
                Some(format!("refresh failed: {error}")),
            );
        }
        FetchOutcome::Cancelled => {
            debug!(symbol = %selection.symbol, "refresh tick cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IndicatorSlot;
    use crate::store::MemoryStore;
    use crate::sync::mutations::INSTANCES_DOC_KEY;
    use crate::types::{ChartInterval, IndicatorParams, IndicatorRequest, IndicatorSeries, ParamValue};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn candle(t: i64, close: f64) -> Candle {
        Candle {
            t,
            o: close,
            h: close,
            l: close,
            c: close,
            v: 1.0,
        }
    }

    #[derive(Default)]
    struct StubFeedService {
        latest_calls: AtomicU32,
        ranged_calls: AtomicU32,
        indicator_calls: AtomicU32,
        fail_candles: AtomicBool,
        fail_with_network: AtomicBool,
        series: parking_lot::Mutex<HashMap<String, Vec<Candle>>>,
        ranged: parking_lot::Mutex<HashMap<(String, i64, i64), Vec<Candle>>>,
        gates: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
        indicator_requests: parking_lot::Mutex<Vec<IndicatorRequest>>,
    }

    impl StubFeedService {
        fn seed_latest(&self, symbol: &str, candles: Vec<Candle>) {
            self.series.lock().insert(symbol.to_string(), candles);
        }

        fn seed_range(&self, symbol: &str, from: i64, to: i64, candles: Vec<Candle>) {
            self.ranged
                .lock()
                .insert((symbol.to_string(), from, to), candles);
        }

        fn gate(&self, symbol: &str) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            self.gates
                .lock()
                .insert(symbol.to_string(), Arc::clone(&gate));
            gate
        }

        fn sample_series(request: &IndicatorRequest) -> IndicatorSeries {
            IndicatorSeries {
                timestamps: vec![request.range_from, request.range_to],
                fields: BTreeMap::from([("value".to_string(), vec![1.0, 2.0])]),
                computed_at_ms: 7,
            }
        }
    }

    #[async_trait]
    impl CandleService for StubFeedService {
        async fn fetch_candles(
            &self,
            symbol: &str,
            _interval: ChartInterval,
            range: Option<(i64, i64)>,
            _limit: u16,
        ) -> Result<Vec<Candle>, FeedError> {
            match range {
                Some(_) => self.ranged_calls.fetch_add(1, Ordering::SeqCst),
                None => self.latest_calls.fetch_add(1, Ordering::SeqCst),
            };
            let gate = self.gates.lock().get(symbol).cloned();
            if let Some(gate) = gate {
                let _ = gate.acquire().await;
            }
            if self.fail_candles.load(Ordering::SeqCst) {
                if self.fail_with_network.load(Ordering::SeqCst) {
                    return Err(FeedError::Network("connection refused".to_string()));
                }
                return Err(FeedError::Client {
                    status: 404,
                    message: "unknown symbol".to_string(),
                });
            }
            match range {
                Some((from, to)) => Ok(self
                    .ranged
                    .lock()
                    .get(&(symbol.to_string(), from, to))
                    .cloned()
                    .unwrap_or_default()),
                None => Ok(self
                    .series
                    .lock()
                    .get(symbol)
                    .cloned()
                    .unwrap_or_default()),
            }
        }
    }

    #[async_trait]
    impl IndicatorService for StubFeedService {
        async fn fetch_indicator(
            &self,
            request: &IndicatorRequest,
        ) -> Result<IndicatorSeries, FeedError> {
            self.indicator_calls.fetch_add(1, Ordering::SeqCst);
            self.indicator_requests.lock().push(request.clone());
            Ok(Self::sample_series(request))
        }

        async fn fetch_indicators_batch(
            &self,
            requests: &[IndicatorRequest],
        ) -> Result<Vec<Result<IndicatorSeries, FeedError>>, FeedError> {
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                self.indicator_calls.fetch_add(1, Ordering::SeqCst);
                self.indicator_requests.lock().push(request.clone());
                results.push(Ok(Self::sample_series(request)));
            }
            Ok(results)
        }
    }

    #[async_trait]
    impl InstanceService for StubFeedService {
        async fn list_instances(
            &self,
            _auth: &AuthContext,
        ) -> Result<Vec<IndicatorInstance>, FeedError> {
            Ok(Vec::new())
        }

        async fn create_instance(
            &self,
            _auth: &AuthContext,
            _instance: &IndicatorInstance,
        ) -> Result<(), FeedError> {
            Ok(())
        }

        async fn update_instance(
            &self,
            _auth: &AuthContext,
            _instance: &IndicatorInstance,
        ) -> Result<(), FeedError> {
            Ok(())
        }

        async fn delete_instance(
            &self,
            _auth: &AuthContext,
            _instance_id: &str,
        ) -> Result<(), FeedError> {
            Ok(())
        }
    }

    struct EngineFixture {
        engine: FeedEngine,
        service: Arc<StubFeedService>,
    }

    fn build_fixture(store: Arc<MemoryStore>, settings: FeedSettingsArgs) -> EngineFixture {
        let service = Arc::new(StubFeedService::default());
        let services = FeedServices {
            candles: Arc::clone(&service) as Arc<dyn CandleService>,
            indicators: Arc::clone(&service) as Arc<dyn IndicatorService>,
            instances: Arc::clone(&service) as Arc<dyn InstanceService>,
        };
        let engine = FeedEngine::new(settings, store as Arc<dyn LocalStore>, services)
            .expect("engine should build");
        EngineFixture { engine, service }
    }

    // A long cooldown keeps the gating assertions timing-independent.
    fn fixture() -> EngineFixture {
        build_fixture(
            Arc::new(MemoryStore::new()),
            FeedSettingsArgs {
                backfill_cooldown_ms: Some(60_000),
                polling_enabled: Some(false),
                ..Default::default()
            },
        )
    }

    fn select_args(symbol: &str, interval: ChartInterval) -> SelectionArgs {
        SelectionArgs {
            symbol: Some(symbol.to_string()),
            interval: Some(interval),
        }
    }

    fn sma_args(period: i64) -> NewInstanceArgs {
        NewInstanceArgs {
            type_name: "sma".to_string(),
            params: IndicatorParams::from([("period".to_string(), ParamValue::Int(period))]),
            display_name: None,
            style: None,
            is_visible: None,
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition was not reached in time");
    }

    #[tokio::test]
    async fn indicators_wait_for_the_first_candle_batch() {
        let fx = fixture();
        fx.service
            .seed_latest("AAPL", vec![candle(100, 1.0), candle(110, 1.0), candle(120, 1.0)]);
        let gate = fx.service.gate("AAPL");
        fx.engine
            .create_instance(sma_args(20))
            .await
            .expect("create should succeed");

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        assert_eq!(fx.engine.status().phase, FeedPhase::Loading);

        let service = Arc::clone(&fx.service);
        wait_until(move || service.latest_calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fx.service.indicator_calls.load(Ordering::SeqCst),
            0,
            "no indicator fetch may start before candles arrive"
        );

        gate.add_permits(16);
        let service = Arc::clone(&fx.service);
        wait_until(move || service.indicator_calls.load(Ordering::SeqCst) == 1).await;

        assert_eq!(fx.engine.status().phase, FeedPhase::Ready);
        let request = fx.service.indicator_requests.lock()[0].clone();
        assert_eq!(request.range_from, 100);
        assert_eq!(request.range_to, 120);
        let results = fx.engine.indicator_results();
        assert_eq!(results.len(), 1);
        assert!(results
            .values()
            .all(|slot| matches!(slot, IndicatorSlot::Ready { .. })));
    }

    #[tokio::test]
    async fn rapid_switch_keeps_only_the_latest_selection() {
        let fx = fixture();
        fx.service.seed_latest("AAPL", vec![candle(100, 1.0)]);
        fx.service.seed_latest("MSFT", vec![candle(100, 2.0)]);
        let gate = fx.service.gate("AAPL");

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let service = Arc::clone(&fx.service);
        wait_until(move || service.latest_calls.load(Ordering::SeqCst) == 1).await;

        fx.engine
            .select(select_args("MSFT", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Ready).await;

        // Let the abandoned first fetch run to completion.
        gate.add_permits(16);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let series = fx.engine.candle_series().expect("series should exist");
        assert_eq!(series.symbol, "MSFT");
        assert_eq!(series.candles[0].c, 2.0);
        let status = fx.engine.status();
        assert_eq!(status.symbol, "MSFT");
        assert_eq!(status.generation, 2);
    }

    #[tokio::test]
    async fn backfill_extends_coverage_and_reruns_indicators() {
        let fx = fixture();
        fx.service
            .seed_latest("AAPL", vec![candle(100, 1.0), candle(110, 1.0), candle(120, 1.0)]);
        fx.service.seed_range(
            "AAPL",
            50,
            100,
            vec![candle(50, 1.0), candle(60, 1.0), candle(90, 1.0)],
        );

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Ready).await;
        fx.engine
            .create_instance(sma_args(20))
            .await
            .expect("create should succeed");
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 1);

        let decision = fx
            .engine
            .backfill(50, 100)
            .await
            .expect("backfill should succeed");
        assert_eq!(decision, BackfillDecision::Proceed);
        assert_eq!(fx.service.ranged_calls.load(Ordering::SeqCst), 1);

        let series = fx.engine.candle_series().expect("series should exist");
        assert_eq!(series.covered_from, Some(50));
        assert_eq!(series.covered_to, Some(120));
        assert_eq!(series.version, 2);

        // The extended range re-keys the indicator request.
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 2);
        let request = fx
            .service
            .indicator_requests
            .lock()
            .last()
            .cloned()
            .expect("request should be recorded");
        assert_eq!(request.range_from, 50);
        assert_eq!(request.range_to, 120);

        // Within the cooldown the next trigger is gated.
        let gated = fx
            .engine
            .backfill(10, 50)
            .await
            .expect("gated backfill should not error");
        assert_eq!(gated, BackfillDecision::CoolingDown);
    }

    #[tokio::test]
    async fn repeated_backfill_range_is_served_from_cache() {
        // A short cooldown so the second trigger passes the gate.
        let fx = build_fixture(
            Arc::new(MemoryStore::new()),
            FeedSettingsArgs {
                backfill_cooldown_ms: Some(250),
                polling_enabled: Some(false),
                ..Default::default()
            },
        );
        fx.service.seed_latest("AAPL", vec![candle(100, 1.0)]);
        fx.service
            .seed_range("AAPL", 50, 100, vec![candle(50, 1.0), candle(60, 1.0)]);

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Ready).await;

        fx.engine
            .backfill(50, 100)
            .await
            .expect("backfill should succeed");
        assert_eq!(fx.service.ranged_calls.load(Ordering::SeqCst), 1);
        let version_after_first = fx
            .engine
            .candle_series()
            .expect("series should exist")
            .version;

        // Past the cooldown, the same range hits the cache instead of the
        // network and merges as a no-op.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let decision = fx
            .engine
            .backfill(50, 100)
            .await
            .expect("backfill should succeed");
        assert_eq!(decision, BackfillDecision::Proceed);
        assert_eq!(fx.service.ranged_calls.load(Ordering::SeqCst), 1);
        let series = fx.engine.candle_series().expect("series should exist");
        assert_eq!(series.version, version_after_first);
    }

    #[tokio::test]
    async fn failed_initial_load_recovers_through_manual_refresh() {
        let fx = fixture();
        fx.service.seed_latest("AAPL", vec![candle(100, 1.0)]);
        fx.service.fail_candles.store(true, Ordering::SeqCst);

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Failed).await;
        let status = fx.engine.status();
        assert!(status
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("initial candle load failed")));

        fx.service.fail_candles.store(false, Ordering::SeqCst);
        fx.engine.refresh().await.expect("refresh should succeed");

        let status = fx.engine.status();
        assert_eq!(status.phase, FeedPhase::Ready);
        assert!(status.reason.is_none());
        let series = fx.engine.candle_series().expect("series should exist");
        assert_eq!(series.candles.len(), 1);
    }

    #[tokio::test]
    async fn network_failures_toggle_the_offline_flag() {
        let fx = fixture();
        fx.service.seed_latest("AAPL", vec![candle(100, 1.0)]);
        fx.service.fail_candles.store(true, Ordering::SeqCst);
        fx.service.fail_with_network.store(true, Ordering::SeqCst);

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Failed).await;
        assert!(fx.engine.status().offline);

        fx.service.fail_candles.store(false, Ordering::SeqCst);
        fx.engine.refresh().await.expect("refresh should succeed");
        assert!(!fx.engine.status().offline, "a successful call clears offline");
    }

    #[tokio::test]
    async fn selection_preference_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let fx = build_fixture(
            Arc::clone(&store),
            FeedSettingsArgs {
                polling_enabled: Some(false),
                ..Default::default()
            },
        );
        fx.engine
            .select(select_args("msft", ChartInterval::H1))
            .await
            .expect("select should succeed");

        let saved = fx.engine.saved_selection().await.expect("saved selection");
        assert_eq!(saved.symbol, "MSFT");
        assert_eq!(saved.interval, ChartInterval::H1);

        // A fresh engine over the same store restores it.
        let restarted = build_fixture(
            store,
            FeedSettingsArgs {
                polling_enabled: Some(false),
                ..Default::default()
            },
        );
        let saved = restarted
            .engine
            .saved_selection()
            .await
            .expect("saved selection");
        assert_eq!(saved.symbol, "MSFT");
    }

    #[tokio::test]
    async fn instance_lifecycle_drives_orchestration_and_invalidation() {
        let fx = fixture();
        fx.service
            .seed_latest("AAPL", vec![candle(100, 1.0), candle(110, 1.0)]);

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Ready).await;
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 0);

        let created = fx
            .engine
            .create_instance(sma_args(20))
            .await
            .expect("create should succeed");
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 1);

        // A param change invalidates the old config's cache entries.
        let mut updated = created.clone();
        updated
            .params
            .insert("period".to_string(), ParamValue::Int(50));
        fx.engine
            .update_instance(updated.clone())
            .await
            .expect("update should succeed");
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 2);

        // Switching back would hit the old cache entry had it survived.
        let mut reverted = updated;
        reverted
            .params
            .insert("period".to_string(), ParamValue::Int(20));
        fx.engine
            .update_instance(reverted)
            .await
            .expect("update should succeed");
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 3);

        fx.engine
            .remove_instance(&created.id)
            .await
            .expect("remove should succeed");
        assert!(fx.engine.indicator_results().is_empty());
        assert!(fx.engine.instances().is_empty());

        let diagnostics = fx.engine.diagnostics().await;
        assert_eq!(diagnostics.generation, 1);
        assert_eq!(diagnostics.candle_version, 1);
        assert_eq!(diagnostics.pending_mutations, 0);
        assert!(diagnostics.memory_cache_entries >= 1);
    }

    #[tokio::test]
    async fn start_hydrates_instances_from_the_local_document() {
        let store = Arc::new(MemoryStore::new());
        let instance = sma_args(20)
            .into_instance(1)
            .expect("args should validate");
        store
            .set(
                INSTANCES_DOC_KEY,
                &serde_json::to_string(&vec![instance.clone()]).expect("encode should succeed"),
            )
            .await
            .expect("seed should succeed");

        let fx = build_fixture(
            store,
            FeedSettingsArgs {
                polling_enabled: Some(false),
                ..Default::default()
            },
        );
        fx.engine.start().await;

        let instances = fx.engine.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, instance.id);
    }

    #[tokio::test]
    async fn symbol_without_data_reports_ready_and_exhausted() {
        let fx = fixture();

        fx.engine
            .select(select_args("EMPTY", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Ready).await;

        let status = fx.engine.status();
        assert_eq!(status.covered_from, None);
        assert_eq!(status.covered_to, None);

        // Indicators stay gated with no covered range.
        fx.engine
            .create_instance(sma_args(20))
            .await
            .expect("create should succeed");
        assert_eq!(fx.service.indicator_calls.load(Ordering::SeqCst), 0);

        let decision = fx
            .engine
            .backfill(10, 20)
            .await
            .expect("backfill should not error");
        assert_eq!(decision, BackfillDecision::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_merges_new_tail_candles() {
        let fx = build_fixture(
            Arc::new(MemoryStore::new()),
            FeedSettingsArgs {
                polling_enabled: Some(true),
                ..Default::default()
            },
        );
        fx.service.seed_latest("AAPL", vec![candle(100, 1.0)]);

        fx.engine
            .select(select_args("AAPL", ChartInterval::D1))
            .await
            .expect("select should succeed");
        let engine_status = || fx.engine.status();
        wait_until(|| engine_status().phase == FeedPhase::Ready).await;
        assert_eq!(
            fx.engine.candle_series().expect("series").candles.len(),
            1
        );

        // A new candle closes on the backend, then the daily poll fires.
        fx.service
            .seed_latest("AAPL", vec![candle(100, 1.0), candle(110, 1.5)]);
        tokio::time::advance(Duration::from_secs(601)).await;
        let engine_series = || fx.engine.candle_series();
        wait_until(|| {
            engine_series()
                .map(|series| series.candles.len() == 2)
                .unwrap_or(false)
        })
        .await;

        let series = fx.engine.candle_series().expect("series should exist");
        assert_eq!(series.version, 2);
        assert_eq!(series.covered_to, Some(110));
        assert!(fx.service.latest_calls.load(Ordering::SeqCst) >= 2);

        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn operations_without_a_selection_are_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.refresh().await,
            Err(FeedError::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.engine.backfill(1, 2).await,
            Err(FeedError::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.engine.backfill(5, 5).await,
            Err(FeedError::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.engine.retry_instance_fetch("x").await,
            Err(FeedError::InvalidArgument(_))
        ));
    }
}
