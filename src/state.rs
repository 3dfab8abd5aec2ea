use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{
    CandleSeriesSnapshot, FeedEvent, FeedPhase, FeedStatusSnapshot, IndicatorInstance,
    IndicatorSeries,
};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;
const FAILED_STATUS_THROTTLE: Duration = Duration::from_millis(500);

/// Published output slot for one indicator instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum IndicatorSlot {
    Pending,
    #[serde(rename_all = "camelCase")]
    Ready { series: IndicatorSeries },
    #[serde(rename_all = "camelCase")]
    Failed { message: String },
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_phase: Option<FeedPhase>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl StatusPublishThrottle {
    // Repeated failure statuses with the same reason are noisy while retries
    // churn; everything else publishes unconditionally.
    fn allow(&mut self, phase: FeedPhase, reason: &Option<String>) -> bool {
        let now = Instant::now();
        let repeated_failure = phase == FeedPhase::Failed
            && self.last_phase == Some(phase)
            && self.last_reason == *reason;
        if repeated_failure {
            if let Some(last_emit) = self.last_emit {
                if now.duration_since(last_emit) < FAILED_STATUS_THROTTLE {
                    return false;
                }
            }
        }
        self.last_phase = Some(phase);
        self.last_reason = reason.clone();
        self.last_emit = Some(now);
        true
    }
}

/// Last-good snapshots the rendering layer reads, plus the event channel
/// that tells subscribers which snapshot changed.
pub struct PublishedState {
    status: RwLock<FeedStatusSnapshot>,
    candles: RwLock<Option<CandleSeriesSnapshot>>,
    indicators: RwLock<HashMap<String, IndicatorSlot>>,
    instances: RwLock<Vec<IndicatorInstance>>,
    throttle: Mutex<StatusPublishThrottle>,
    events: broadcast::Sender<FeedEvent>,
}

impl Default for PublishedState {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishedState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status: RwLock::new(FeedStatusSnapshot::idle()),
            candles: RwLock::new(None),
            indicators: RwLock::new(HashMap::new()),
            instances: RwLock::new(Vec::new()),
            throttle: Mutex::new(StatusPublishThrottle::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: FeedEvent) {
        // Send fails when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> FeedStatusSnapshot {
        self.status.read().clone()
    }

    pub fn publish_status(&self, snapshot: FeedStatusSnapshot) {
        if !self.throttle.lock().allow(snapshot.phase, &snapshot.reason) {
            return;
        }
        let phase = snapshot.phase;
        *self.status.write() = snapshot;
        self.emit(FeedEvent::StatusChanged { phase });
    }

    /// Flips the offline flag in place, preserving the rest of the status.
    pub fn set_offline(&self, offline: bool) {
        let phase = {
            let mut status = self.status.write();
            if status.offline == offline {
                return;
            }
            status.offline = offline;
            status.phase
        };
        self.emit(FeedEvent::StatusChanged { phase });
    }

    pub fn candles(&self) -> Option<CandleSeriesSnapshot> {
        self.candles.read().clone()
    }

    pub fn publish_candles(&self, snapshot: CandleSeriesSnapshot) {
        let event = FeedEvent::CandlesUpdated {
            symbol: snapshot.symbol.clone(),
            interval: snapshot.interval,
            version: snapshot.version,
        };
        *self.candles.write() = Some(snapshot);
        self.emit(event);
    }

    pub fn indicator_results(&self) -> HashMap<String, IndicatorSlot> {
        self.indicators.read().clone()
    }

    pub fn indicator_slot(&self, instance_id: &str) -> Option<IndicatorSlot> {
        self.indicators.read().get(instance_id).cloned()
    }

    pub fn publish_indicator(&self, instance_id: &str, slot: IndicatorSlot) {
        self.indicators
            .write()
            .insert(instance_id.to_string(), slot);
        self.emit(FeedEvent::IndicatorUpdated {
            instance_id: instance_id.to_string(),
        });
    }

    pub fn drop_indicator(&self, instance_id: &str) {
        if self.indicators.write().remove(instance_id).is_some() {
            self.emit(FeedEvent::IndicatorUpdated {
                instance_id: instance_id.to_string(),
            });
        }
    }

    /// Drops published results whose instance no longer exists.
    pub fn retain_indicators(&self, active_ids: &[String]) {
        self.indicators
            .write()
            .retain(|id, _| active_ids.iter().any(|active| active == id));
    }

    pub fn instances(&self) -> Vec<IndicatorInstance> {
        self.instances.read().clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<IndicatorInstance> {
        self.instances
            .read()
            .iter()
            .find(|instance| instance.id == instance_id)
            .cloned()
    }

    pub fn set_instances(&self, instances: Vec<IndicatorInstance>) {
        let count = instances.len();
        *self.instances.write() = instances;
        self.emit(FeedEvent::InstancesChanged { count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChartInterval, DEFAULT_INTERVAL, DEFAULT_SYMBOL};

    fn failed_status(reason: &str) -> FeedStatusSnapshot {
        FeedStatusSnapshot {
            phase: FeedPhase::Failed,
            reason: Some(reason.to_string()),
            ..FeedStatusSnapshot::idle()
        }
    }

    #[test]
    fn publishes_status_and_emits_event() {
        let state = PublishedState::new();
        let mut events = state.subscribe();

        let mut snapshot = FeedStatusSnapshot::idle();
        snapshot.phase = FeedPhase::Loading;
        state.publish_status(snapshot);

        assert_eq!(state.status().phase, FeedPhase::Loading);
        assert_eq!(
            events.try_recv().expect("status event should be queued"),
            FeedEvent::StatusChanged {
                phase: FeedPhase::Loading
            }
        );
    }

    #[test]
    fn throttles_repeated_failure_statuses() {
        let state = PublishedState::new();
        let mut events = state.subscribe();

        state.publish_status(failed_status("connection refused"));
        state.publish_status(failed_status("connection refused"));

        assert!(events.try_recv().is_ok());
        assert!(
            events.try_recv().is_err(),
            "repeated failure within the throttle window should not re-emit"
        );

        // A different reason goes straight through.
        state.publish_status(failed_status("dns failure"));
        assert!(events.try_recv().is_ok());
    }

    #[test]
    fn offline_flag_emits_only_on_change() {
        let state = PublishedState::new();
        let mut events = state.subscribe();

        state.set_offline(true);
        state.set_offline(true);

        assert!(state.status().offline);
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn candle_snapshot_round_trips() {
        let state = PublishedState::new();
        let mut events = state.subscribe();

        state.publish_candles(CandleSeriesSnapshot {
            symbol: DEFAULT_SYMBOL.to_string(),
            interval: DEFAULT_INTERVAL,
            candles: Vec::new(),
            covered_from: Some(1_000),
            covered_to: Some(2_000),
            version: 3,
        });

        let snapshot = state.candles().expect("candles should be published");
        assert_eq!(snapshot.version, 3);
        assert_eq!(
            events.try_recv().expect("candle event should be queued"),
            FeedEvent::CandlesUpdated {
                symbol: DEFAULT_SYMBOL.to_string(),
                interval: ChartInterval::D1,
                version: 3
            }
        );
    }

    #[test]
    fn indicator_slots_update_and_drop() {
        let state = PublishedState::new();
        state.publish_indicator("inst-1", IndicatorSlot::Pending);
        assert_eq!(
            state.indicator_slot("inst-1"),
            Some(IndicatorSlot::Pending)
        );

        state.drop_indicator("inst-1");
        assert!(state.indicator_slot("inst-1").is_none());
    }

    #[test]
    fn retain_indicators_prunes_orphans() {
        let state = PublishedState::new();
        state.publish_indicator("keep", IndicatorSlot::Pending);
        state.publish_indicator("orphan", IndicatorSlot::Pending);

        state.retain_indicators(&["keep".to_string()]);

        assert!(state.indicator_slot("keep").is_some());
        assert!(state.indicator_slot("orphan").is_none());
    }
}
