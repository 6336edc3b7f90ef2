use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::fault::FaultState;

/// One safety cut and, once re-armed, how long recovery took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEvent {
    /// What triggered the cut.
    pub kind: FaultState,
    /// Boost when the cut fired.
    pub trigger_psi: Option<f32>,
    /// Limit in force when the cut fired.
    pub limit_psi: f32,
    /// Highest boost seen while cutting.
    pub peak_psi: Option<f32>,
    /// Loop time of the cut.
    pub at_ms: u64,
    /// Cut-to-clear time: how long boost took to fall below the hysteresis band.
    pub cleared_after_ms: Option<u64>,
    /// Cut-to-rearm time, once re-armed.
    pub recovered_after_ms: Option<u64>,
}

impl SafetyEvent {
    /// How far the peak went past the limit.
    #[must_use]
    pub fn overshoot_psi(&self) -> Option<f32> {
        self.peak_psi.map(|peak| peak - self.limit_psi)
    }
}

/// Most recent safety events, oldest dropped first.
#[derive(Debug, Clone)]
pub struct SafetyHistory {
    events: VecDeque<SafetyEvent>,
    capacity: usize,
    total: u64,
}

impl SafetyHistory {
    /// Creates a history keeping `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Records a new cut.
    pub fn push(&mut self, event: SafetyEvent) {
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.total = self.total.saturating_add(1);
    }

    /// Raises the peak of the open event.
    pub fn observe_peak(&mut self, psi: f32) {
        if let Some(event) = self.open_event() {
            if event.peak_psi.map_or(true, |peak| psi > peak) {
                event.peak_psi = Some(psi);
            }
        }
    }

    /// Stamps the open event with the time its condition cleared.
    pub fn mark_cleared(&mut self, now_ms: u64) {
        if let Some(event) = self.open_event() {
            event.cleared_after_ms = Some(now_ms.saturating_sub(event.at_ms));
        }
    }

    /// Closes the open event and returns it.
    pub fn complete_latest(&mut self, now_ms: u64) -> Option<SafetyEvent> {
        let event = self.open_event()?;
        event.recovered_after_ms = Some(now_ms.saturating_sub(event.at_ms));
        Some(event.clone())
    }

    fn open_event(&mut self) -> Option<&mut SafetyEvent> {
        self.events
            .back_mut()
            .filter(|event| event.recovered_after_ms.is_none())
    }

    /// Events retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Cuts recorded since power-on, including evicted ones.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Retained events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SafetyEvent> {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(at_ms: u64) -> SafetyEvent {
        SafetyEvent {
            kind: FaultState::Overboost,
            trigger_psi: Some(10.0),
            limit_psi: 10.0,
            peak_psi: Some(10.0),
            at_ms,
            cleared_after_ms: None,
            recovered_after_ms: None,
        }
    }

    #[test]
    fn bounded_and_counts_evicted() {
        let mut history = SafetyHistory::new(2);
        for at in 0..5 {
            history.push(event(at));
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.total(), 5);
        assert_eq!(history.iter().next().map(|e| e.at_ms), Some(3));
    }

    #[test]
    fn tracks_peak_and_recovery() {
        let mut history = SafetyHistory::new(4);
        history.push(event(100));
        history.observe_peak(10.6);
        history.observe_peak(10.3);
        history.mark_cleared(400);
        let done = history.complete_latest(900).unwrap();
        assert_eq!(done.peak_psi, Some(10.6));
        assert_eq!(done.cleared_after_ms, Some(300));
        assert_eq!(done.recovered_after_ms, Some(800));
        assert!((done.overshoot_psi().unwrap() - 0.6).abs() < 1e-5);
        assert!(history.complete_latest(1000).is_none());
    }
}
