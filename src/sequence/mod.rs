pub mod generator;

use serde::{Deserialize, Serialize};

pub use generator::{generate, SequenceError, SequenceParams};

/// How stimulus ids are drawn for a sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum GenerationPolicy {
    /// Independent uniform draws; ids may repeat.
    #[default]
    Independent,
    /// Every id exactly once, shuffled.
    Permutation,
}

/// One scheduled stimulus. `scheduled_delay_ms` is the wait before this
/// stimulus, measured from the previous one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StimulusEvent {
    pub stimulus_id: u32,
    pub scheduled_delay_ms: u64,
}

/// Ordered stimuli whose cumulative delay never exceeds `max_duration_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StimulusSequence {
    events: Vec<StimulusEvent>,
    max_duration_ms: u64,
}

impl StimulusSequence {
    /// Builds a sequence from explicit events, dropping the first event that
    /// would push the cumulative delay past `max_duration_ms` and everything
    /// after it.
    pub fn from_events(events: Vec<StimulusEvent>, max_duration_ms: u64) -> Self {
        let mut total: u64 = 0;
        let mut kept = Vec::with_capacity(events.len());
        for event in events {
            total = total.saturating_add(event.scheduled_delay_ms);
            if total > max_duration_ms {
                break;
            }
            kept.push(event);
        }

        Self {
            events: kept,
            max_duration_ms,
        }
    }

    pub fn events(&self) -> &[StimulusEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_ms
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.events.iter().map(|e| e.scheduled_delay_ms).sum()
    }

    /// Absolute activation offsets from the start of the run, one per event.
    pub fn activation_offsets_ms(&self) -> Vec<u64> {
        self.events
            .iter()
            .scan(0u64, |acc, event| {
                *acc += event.scheduled_delay_ms;
                Some(*acc)
            })
            .collect()
    }
}
