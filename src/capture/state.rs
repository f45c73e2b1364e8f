use chrono::{DateTime, Utc};
use serde::Serialize;

use super::CaptureHandle;

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum CaptureState {
    #[default]
    Idle,
    Recording {
        handle: CaptureHandle,
        started_at: DateTime<Utc>,
    },
    Stopped {
        handle: CaptureHandle,
        uri: String,
        /// Stopped by the ceiling watchdog rather than by the caller.
        timed_out: bool,
    },
    Failed {
        handle: Option<CaptureHandle>,
        reason: String,
    },
}

impl CaptureState {
    pub fn is_recording(&self) -> bool {
        matches!(self, CaptureState::Recording { .. })
    }

    pub fn handle(&self) -> Option<CaptureHandle> {
        match self {
            CaptureState::Idle => None,
            CaptureState::Recording { handle, .. } | CaptureState::Stopped { handle, .. } => {
                Some(*handle)
            }
            CaptureState::Failed { handle, .. } => *handle,
        }
    }
}
