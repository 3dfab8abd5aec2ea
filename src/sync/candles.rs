use serde::Serialize;
use tracing::debug;

use crate::types::{Candle, CandleSeriesSnapshot, ChartInterval};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandlePhase {
    Empty,
    Loading,
    Ready,
    Backfilling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Changed { added: usize, version: u64 },
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Why a backfill request did or did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillDecision {
    Proceed,
    AlreadyBackfilling,
    CoolingDown,
    Exhausted,
    NotReady,
}

/// Holds the candle series for one symbol/interval selection, with a version
/// counter that bumps only when the buffer actually changes. Merges keep the
/// already-stored candle whenever timestamps collide.
pub struct CandleStore {
    symbol: String,
    interval: ChartInterval,
    candles: Vec<Candle>,
    covered_from: Option<i64>,
    covered_to: Option<i64>,
    version: u64,
    phase: CandlePhase,
    has_more: bool,
    backfill_cooldown_ms: u64,
    last_backfill_at_ms: Option<i64>,
}

impl CandleStore {
    pub fn new(symbol: String, interval: ChartInterval, backfill_cooldown_ms: u64) -> Self {
        Self {
            symbol,
            interval,
            candles: Vec::new(),
            covered_from: None,
            covered_to: None,
            version: 0,
            phase: CandlePhase::Empty,
            has_more: true,
            backfill_cooldown_ms,
            last_backfill_at_ms: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> ChartInterval {
        self.interval
    }

    pub fn phase(&self) -> CandlePhase {
        self.phase
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn covered_range(&self) -> Option<(i64, i64)> {
        self.covered_from.zip(self.covered_to)
    }

    pub fn begin_load(&mut self) {
        self.phase = CandlePhase::Loading;
    }

    pub fn complete_load(&mut self, incoming: Vec<Candle>) -> MergeOutcome {
        let incoming = normalize_batch(incoming);
        self.phase = CandlePhase::Ready;
        if incoming.is_empty() {
            // Nothing to chart; leave coverage unset so downstream work stays gated.
            self.has_more = false;
            return MergeOutcome::Unchanged;
        }
        self.candles = incoming;
        self.refresh_coverage();
        self.version += 1;
        MergeOutcome::Changed {
            added: self.candles.len(),
            version: self.version,
        }
    }

    pub fn fail_load(&mut self) {
        self.phase = CandlePhase::Empty;
    }

    pub fn begin_backfill(&mut self, now_ms: i64) -> BackfillDecision {
        if self.phase == CandlePhase::Backfilling {
            return BackfillDecision::AlreadyBackfilling;
        }
        if self.phase != CandlePhase::Ready {
            return BackfillDecision::NotReady;
        }
        if !self.has_more {
            return BackfillDecision::Exhausted;
        }
        if let Some(last) = self.last_backfill_at_ms {
            if now_ms.saturating_sub(last) < self.backfill_cooldown_ms as i64 {
                return BackfillDecision::CoolingDown;
            }
        }
        self.phase = CandlePhase::Backfilling;
        self.last_backfill_at_ms = Some(now_ms);
        BackfillDecision::Proceed
    }

    pub fn complete_backfill(&mut self, older: Vec<Candle>, has_more: bool) -> MergeOutcome {
        if self.phase != CandlePhase::Backfilling {
            return MergeOutcome::Unchanged;
        }
        self.phase = CandlePhase::Ready;
        self.has_more = has_more;

        let before = self.candles.len();
        self.candles.extend(normalize_batch(older));
        // Stable sort keeps the already-stored candle first on timestamp
        // collisions, so dedup discards the incoming duplicate.
        self.candles.sort_by_key(|candle| candle.t);
        self.candles.dedup_by_key(|candle| candle.t);
        let added = self.candles.len() - before;

        if added == 0 {
            debug!(symbol = %self.symbol, "backfill merged no new candles");
            return MergeOutcome::Unchanged;
        }
        self.refresh_coverage();
        self.version += 1;
        MergeOutcome::Changed {
            added,
            version: self.version,
        }
    }

    pub fn fail_backfill(&mut self) {
        // Keep the last-good series; only unwind the phase.
        if self.phase == CandlePhase::Backfilling {
            self.phase = CandlePhase::Ready;
        }
    }

    /// Applies a freshly polled tail window. Existing candles are replaced in
    /// place when the remote revised them; candles beyond the covered end are
    /// appended. Anything older than the covered start belongs to backfill
    /// and is ignored.
    pub fn apply_refresh(&mut self, incoming: Vec<Candle>) -> MergeOutcome {
        if !matches!(self.phase, CandlePhase::Ready | CandlePhase::Backfilling) {
            return MergeOutcome::Unchanged;
        }
        let incoming = normalize_batch(incoming);
        if incoming.is_empty() {
            return MergeOutcome::Unchanged;
        }
        if self.candles.is_empty() {
            // A selection that initially had no data can pick one up here.
            self.candles = incoming;
            self.refresh_coverage();
            self.version += 1;
            return MergeOutcome::Changed {
                added: self.candles.len(),
                version: self.version,
            };
        }

        let covered_from = self.covered_from.unwrap_or(i64::MIN);
        let mut added = 0usize;
        let mut changed = false;
        for candle in incoming {
            if candle.t < covered_from {
                continue;
            }
            match self.candles.binary_search_by_key(&candle.t, |existing| existing.t) {
                Ok(position) => {
                    if self.candles[position] != candle {
                        self.candles[position] = candle;
                        changed = true;
                    }
                }
                Err(position) => {
                    self.candles.insert(position, candle);
                    added += 1;
                    changed = true;
                }
            }
        }

        if !changed {
            return MergeOutcome::Unchanged;
        }
        self.refresh_coverage();
        self.version += 1;
        MergeOutcome::Changed {
            added,
            version: self.version,
        }
    }

    pub fn snapshot(&self) -> CandleSeriesSnapshot {
        CandleSeriesSnapshot {
            symbol: self.symbol.clone(),
            interval: self.interval,
            candles: self.candles.clone(),
            covered_from: self.covered_from,
            covered_to: self.covered_to,
            version: self.version,
        }
    }

    fn refresh_coverage(&mut self) {
        self.covered_from = self.candles.first().map(|candle| candle.t);
        self.covered_to = self.candles.last().map(|candle| candle.t);
    }
}

// Stable sort + dedup keeps the first-seen candle when a batch repeats a
// timestamp.
fn normalize_batch(mut batch: Vec<Candle>) -> Vec<Candle> {
    batch.sort_by_key(|candle| candle.t);
    batch.dedup_by_key(|candle| candle.t);
    batch
}
