use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use super::{GenerationPolicy, StimulusEvent, StimulusSequence};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("circle_count must be greater than zero")]
    NoCircles,

    #[error("min_delay_ms ({min}) is greater than max_delay_ms ({max})")]
    InvertedDelayRange { min: u64, max: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SequenceParams {
    pub circle_count: u32,
    /// Candidate count for `Independent`; `Permutation` always proposes
    /// every circle once.
    pub sequence_length: usize,
    pub max_duration_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub policy: GenerationPolicy,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            circle_count: 6,
            sequence_length: 10,
            max_duration_ms: 60_000,
            min_delay_ms: 1_000,
            max_delay_ms: 4_000,
            policy: GenerationPolicy::Independent,
        }
    }
}

/// Draws a stimulus sequence. Pure apart from `rng`; pass a seeded RNG to
/// reproduce a sequence.
pub fn generate<R: Rng>(
    params: &SequenceParams,
    rng: &mut R,
) -> Result<StimulusSequence, SequenceError> {
    if params.circle_count == 0 {
        return Err(SequenceError::NoCircles);
    }
    if params.min_delay_ms > params.max_delay_ms {
        return Err(SequenceError::InvertedDelayRange {
            min: params.min_delay_ms,
            max: params.max_delay_ms,
        });
    }

    let ids: Vec<u32> = match params.policy {
        GenerationPolicy::Independent => (0..params.sequence_length)
            .map(|_| rng.gen_range(0..params.circle_count))
            .collect(),
        GenerationPolicy::Permutation => {
            let mut ids: Vec<u32> = (0..params.circle_count).collect();
            ids.shuffle(rng);
            ids
        }
    };

    let mut events = Vec::with_capacity(ids.len());
    let mut total: u64 = 0;
    for stimulus_id in ids {
        let scheduled_delay_ms = rng.gen_range(params.min_delay_ms..=params.max_delay_ms);
        total = total.saturating_add(scheduled_delay_ms);
        if total > params.max_duration_ms {
            break;
        }
        events.push(StimulusEvent {
            stimulus_id,
            scheduled_delay_ms,
        });
    }

    Ok(StimulusSequence {
        events,
        max_duration_ms: params.max_duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashSet;

    fn params(policy: GenerationPolicy) -> SequenceParams {
        SequenceParams {
            circle_count: 6,
            sequence_length: 10,
            max_duration_ms: 60_000,
            min_delay_ms: 1000,
            max_delay_ms: 4000,
            policy,
        }
    }

    #[test]
    fn every_prefix_stays_within_budget() {
        for seed in 0..500 {
            let mut rng = StdRng::seed_from_u64(seed);
            let p = SequenceParams {
                max_duration_ms: 12_000,
                ..params(GenerationPolicy::Independent)
            };
            let seq = generate(&p, &mut rng).unwrap();
            let mut running = 0;
            for event in seq.events() {
                running += event.scheduled_delay_ms;
                assert!(running <= p.max_duration_ms, "seed {seed} overflowed");
            }
            assert!(seq.len() <= p.sequence_length);
        }
    }

    #[test]
    fn default_protocol_never_exceeds_a_minute() {
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let seq = generate(&params(GenerationPolicy::Independent), &mut rng).unwrap();
            assert!(seq.total_delay_ms() <= 60_000);
        }
    }

    #[test]
    fn draws_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let seq = generate(&params(GenerationPolicy::Independent), &mut rng).unwrap();
        assert!(!seq.is_empty());
        for event in seq.events() {
            assert!(event.stimulus_id < 6);
            assert!((1000..=4000).contains(&event.scheduled_delay_ms));
        }
    }

    #[test]
    fn permutation_uses_each_circle_once() {
        let mut rng = StdRng::seed_from_u64(42);
        let seq = generate(&params(GenerationPolicy::Permutation), &mut rng).unwrap();
        assert_eq!(seq.len(), 6);
        let ids: HashSet<u32> = seq.events().iter().map(|e| e.stimulus_id).collect();
        assert_eq!(ids, (0..6).collect());
    }

    #[test]
    fn tight_budget_truncates_sequence() {
        let mut rng = StdRng::seed_from_u64(3);
        let p = SequenceParams {
            max_duration_ms: 5000,
            min_delay_ms: 2000,
            max_delay_ms: 2000,
            ..params(GenerationPolicy::Independent)
        };
        let seq = generate(&p, &mut rng).unwrap();
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn same_seed_same_sequence() {
        let p = params(GenerationPolicy::Independent);
        let a = generate(&p, &mut StdRng::seed_from_u64(99)).unwrap();
        let b = generate(&p, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_bad_params() {
        let mut rng = StdRng::seed_from_u64(0);
        let p = SequenceParams {
            circle_count: 0,
            ..params(GenerationPolicy::Independent)
        };
        assert_eq!(generate(&p, &mut rng), Err(SequenceError::NoCircles));

        let p = SequenceParams {
            min_delay_ms: 5000,
            ..params(GenerationPolicy::Independent)
        };
        assert_eq!(
            generate(&p, &mut rng),
            Err(SequenceError::InvertedDelayRange { min: 5000, max: 4000 })
        );
    }
}
