use serde::{Deserialize, Serialize};

/// Wire value stored in place of a latency when the stimulus was missed.
pub const MISS_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSample {
    /// Position in activation order.
    pub index: usize,
    pub stimulus_id: u32,
    /// `None` marks a miss.
    pub latency_ms: Option<u64>,
}

impl ReactionSample {
    pub fn hit(index: usize, stimulus_id: u32, latency_ms: u64) -> Self {
        Self {
            index,
            stimulus_id,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn miss(index: usize, stimulus_id: u32) -> Self {
        Self {
            index,
            stimulus_id,
            latency_ms: None,
        }
    }

    pub fn is_miss(&self) -> bool {
        self.latency_ms.is_none()
    }

    pub fn wire_value(&self) -> i64 {
        self.latency_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .unwrap_or(MISS_SENTINEL)
    }
}

/// Append-only sample log for one run.
#[derive(Debug, Clone, Default)]
pub struct ReactionRecorder {
    samples: Vec<ReactionSample>,
}

impl ReactionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: ReactionSample) {
        self.samples.push(sample);
    }

    pub fn snapshot(&self) -> Vec<ReactionSample> {
        self.samples.clone()
    }

    pub fn samples(&self) -> &[ReactionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misses_serialize_as_sentinel() {
        assert_eq!(ReactionSample::hit(0, 2, 200).wire_value(), 200);
        assert_eq!(ReactionSample::miss(1, 0).wire_value(), MISS_SENTINEL);
    }

    #[test]
    fn snapshot_preserves_append_order() {
        let mut recorder = ReactionRecorder::new();
        recorder.record(ReactionSample::miss(0, 4));
        recorder.record(ReactionSample::hit(1, 1, 321));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].index, 0);
        assert!(snapshot[0].is_miss());
        assert_eq!(snapshot[1].latency_ms, Some(321));
    }
}
