use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{sequence::StimulusSequence, utils::millis};

use super::recorder::{ReactionRecorder, ReactionSample};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TestPhase {
    #[default]
    Idle,
    Armed,
    Running,
    Complete,
    Aborted,
}

impl TestPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, TestPhase::Armed | TestPhase::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TestPhase::Complete | TestPhase::Aborted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStimulus {
    pub index: usize,
    pub stimulus_id: u32,
    /// Offset from the start of the run.
    #[serde(serialize_with = "serialize_millis")]
    pub activated_at: Duration,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(millis(*value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Activated(ActiveStimulus),
    Resolved(ReactionSample),
}

/// Replays a stimulus sequence against a clock owned by the caller.
///
/// All times are offsets from the start of the run. Activation `i` happens at
/// the cumulative delay of events `0..=i`, never relative to when the previous
/// stimulus resolved, so late wakeups do not accumulate. A stimulus still open
/// when the next one comes due is closed as a miss at that instant.
#[derive(Debug, Clone)]
pub struct StimulusRun {
    ids: Vec<u32>,
    due: Vec<Duration>,
    window: Duration,
    next: usize,
    active: Option<ActiveStimulus>,
    recorder: ReactionRecorder,
    cancelled: bool,
}

impl StimulusRun {
    pub fn new(sequence: &StimulusSequence, window: Duration) -> Self {
        Self {
            ids: sequence.events().iter().map(|e| e.stimulus_id).collect(),
            due: sequence
                .activation_offsets_ms()
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            window,
            next: 0,
            active: None,
            recorder: ReactionRecorder::new(),
            cancelled: false,
        }
    }

    pub fn total(&self) -> usize {
        self.ids.len()
    }

    pub fn active(&self) -> Option<ActiveStimulus> {
        self.active
    }

    pub fn recorder(&self) -> &ReactionRecorder {
        &self.recorder
    }

    /// Number of stimuli activated so far, resolved or not.
    pub fn activated(&self) -> usize {
        self.next
    }

    pub fn is_finished(&self) -> bool {
        self.cancelled || (self.active.is_none() && self.next >= self.ids.len())
    }

    /// Offset at which `advance` next has work to do.
    pub fn next_deadline(&self) -> Option<Duration> {
        if self.cancelled {
            return None;
        }
        match self.active {
            Some(active) => Some(self.closes_at(active)),
            None => self.due.get(self.next).copied(),
        }
    }

    /// End of the window, or the next activation if that comes first.
    fn closes_at(&self, active: ActiveStimulus) -> Duration {
        let expires = active.activated_at + self.window;
        match self.due.get(self.next) {
            Some(due) => expires.min(*due),
            None => expires,
        }
    }

    /// Applies every expiry and activation due at `now`.
    pub fn advance(&mut self, now: Duration) -> Vec<RunEvent> {
        let mut events = Vec::new();
        if self.cancelled {
            return events;
        }

        loop {
            if let Some(active) = self.active {
                if now < self.closes_at(active) {
                    break;
                }
                self.active = None;
                let sample = ReactionSample::miss(active.index, active.stimulus_id);
                self.recorder.record(sample.clone());
                events.push(RunEvent::Resolved(sample));
                continue;
            }

            match self.due.get(self.next) {
                Some(&due) if due <= now => {
                    let active = ActiveStimulus {
                        index: self.next,
                        stimulus_id: self.ids[self.next],
                        activated_at: due,
                    };
                    self.next += 1;
                    self.active = Some(active);
                    events.push(RunEvent::Activated(active));
                }
                _ => break,
            }
        }

        events
    }

    /// Resolves the active stimulus if `stimulus_id` names it and its window
    /// is still open. Anything else is dropped without a trace.
    pub fn acknowledge(&mut self, stimulus_id: u32, now: Duration) -> Option<ReactionSample> {
        let active = self.active?;
        if active.stimulus_id != stimulus_id || now >= self.closes_at(active) {
            return None;
        }

        self.active = None;
        let latency = millis(now.saturating_sub(active.activated_at));
        let sample = ReactionSample::hit(active.index, active.stimulus_id, latency);
        self.recorder.record(sample.clone());
        Some(sample)
    }

    /// Stops the run where it is; the active stimulus gets no sample.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.active = None;
    }
}
