//! Client-side synchronization and caching engine for charting UIs.
//!
//! `chartfeed` keeps a chart fed with two coupled data streams, price candles
//! and derived indicator series, while guaranteeing ordering (indicators only
//! compute over a known candle range), deduplicating network work through a
//! tiered cache, discarding stale results across rapid selection switches,
//! and applying user edits to indicator instances optimistically with
//! background sync and rollback.
//!
//! [`FeedEngine`] is the composition root; the pieces underneath (candle
//! store, orchestrator, mutation coordinator, cache, scheduler) are usable on
//! their own.

pub mod db;
pub mod error;
pub mod state;
pub mod store;
pub mod sync;
pub mod types;

pub use error::FeedError;
pub use state::{IndicatorSlot, PublishedState};
pub use store::{LocalStore, MemoryStore, SqliteStore};
pub use sync::cache::TieredCache;
pub use sync::candles::{BackfillDecision, CandlePhase, CandleStore, MergeOutcome};
pub use sync::fetch::{fetch_with_retry, FetchOutcome, RetryPolicy};
pub use sync::key::RequestKey;
pub use sync::mutations::MutationCoordinator;
pub use sync::orchestrator::IndicatorOrchestrator;
pub use sync::pipeline::{FeedEngine, FeedServices};
pub use sync::remote::{CandleService, HttpFeedClient, IndicatorService, InstanceService};
pub use sync::selection::{Generation, SelectionGuard};
pub use types::{
    AuthContext, Candle, CandleSeriesSnapshot, ChartInterval, DiagnosticsSnapshot, FeedConfig,
    FeedEvent, FeedPhase, FeedSettingsArgs, FeedStatusSnapshot, IndicatorInstance,
    IndicatorParams, IndicatorRequest, IndicatorSeries, NewInstanceArgs, ParamValue, Selection,
    SelectionArgs,
};
