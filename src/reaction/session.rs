use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    capture::{CaptureError, StreamKind},
    sequence::StimulusSequence,
};

use super::{recorder::ReactionSample, state::TestPhase};

/// What a capture stream produced for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum CaptureOutcome {
    #[default]
    NotRecorded,
    Recorded {
        uri: String,
        /// Cut off by the recording ceiling.
        timed_out: bool,
    },
    Failed {
        reason: String,
    },
}

impl CaptureOutcome {
    pub fn from_stop(result: Result<String, CaptureError>) -> Self {
        match result {
            Ok(uri) => CaptureOutcome::Recorded {
                uri,
                timed_out: false,
            },
            Err(CaptureError::TimedOut { uri: Some(uri), .. }) => CaptureOutcome::Recorded {
                uri,
                timed_out: true,
            },
            Err(err) => CaptureOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match self {
            CaptureOutcome::Recorded { uri, .. } => Some(uri),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "cause")]
pub enum AbortReason {
    UserCancelled,
    CaptureFailed { kind: StreamKind, reason: String },
}

/// Everything one test produced. Owned by the controller until committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSession {
    pub started_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub sequence: StimulusSequence,
    pub samples: Vec<ReactionSample>,
    pub audio: CaptureOutcome,
    pub video: CaptureOutcome,
    pub phase: TestPhase,
    pub abort_reason: Option<AbortReason>,
}

impl TestSession {
    pub fn new(
        started_at: DateTime<Utc>,
        user_id: Option<String>,
        sequence: StimulusSequence,
        audio: CaptureOutcome,
    ) -> Self {
        Self {
            started_at,
            user_id,
            sequence,
            samples: Vec::new(),
            audio,
            video: CaptureOutcome::NotRecorded,
            phase: TestPhase::Idle,
            abort_reason: None,
        }
    }

    /// Milliseconds since the epoch at test start; the session's timestamp in
    /// every storage path.
    pub fn timestamp_ms(&self) -> i64 {
        self.started_at.timestamp_millis()
    }

    /// Deterministic id: the same user and start time always map to the same
    /// id, so re-committing overwrites instead of duplicating.
    pub fn session_id_for(&self, user_id: &str) -> String {
        format!("{user_id}-{}", self.timestamp_ms())
    }

    pub fn session_id(&self) -> Option<String> {
        self.user_id.as_deref().map(|user| self.session_id_for(user))
    }

    /// Latencies in activation order, misses as `-1`.
    pub fn reaction_times(&self) -> Vec<i64> {
        self.samples.iter().map(ReactionSample::wire_value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(user: Option<&str>) -> TestSession {
        let started_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        TestSession::new(
            started_at,
            user.map(str::to_string),
            StimulusSequence::from_events(Vec::new(), 60_000),
            CaptureOutcome::NotRecorded,
        )
    }

    #[test]
    fn session_id_is_deterministic() {
        let a = session(Some("u1"));
        let b = session(Some("u1"));
        assert_eq!(a.session_id(), Some("u1-1700000000123".to_string()));
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(session(None).session_id(), None);
    }

    #[test]
    fn reaction_times_use_miss_sentinel() {
        let mut s = session(Some("u1"));
        s.samples = vec![ReactionSample::hit(0, 2, 200), ReactionSample::miss(1, 0)];
        assert_eq!(s.reaction_times(), vec![200, -1]);
    }

    #[test]
    fn timed_out_stop_keeps_the_recording() {
        let outcome = CaptureOutcome::from_stop(Err(CaptureError::TimedOut {
            kind: StreamKind::Audio,
            ceiling_ms: 60_000,
            uri: Some("file:///tmp/a.m4a".into()),
        }));
        assert_eq!(outcome.uri(), Some("file:///tmp/a.m4a"));

        let outcome = CaptureOutcome::from_stop(Err(CaptureError::NotActive(StreamKind::Audio)));
        assert!(matches!(outcome, CaptureOutcome::Failed { .. }));
    }
}
