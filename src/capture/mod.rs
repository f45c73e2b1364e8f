pub mod driver;
pub mod manager;
pub mod simulated;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use driver::{
    CameraFacing, CameraOptions, CaptureDriver, DeviceRecording, DriverError, FlashMode,
    PermissionStatus, RecordingOptions,
};
pub use manager::{CaptureLimits, CaptureSessionManager, PermissionReport};
pub use simulated::SimulatedDriver;
pub use state::CaptureState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token for one recording. Stopping requires the handle returned by
/// the matching `start`, so a stale handle can never stop a newer recording.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct CaptureHandle {
    pub kind: StreamKind,
    pub id: Uuid,
}

impl CaptureHandle {
    pub(crate) fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("{0} permission was not granted")]
    PermissionDenied(StreamKind),

    #[error("a {0} recording is already active")]
    AlreadyActive(StreamKind),

    #[error("no matching {0} recording is active")]
    NotActive(StreamKind),

    #[error("{kind} device error: {reason}")]
    DeviceError { kind: StreamKind, reason: String },

    /// The manager stopped the recording itself at the ceiling. `uri` holds
    /// whatever the device produced before it was cut off.
    #[error("{kind} recording reached its {ceiling_ms}ms ceiling")]
    TimedOut {
        kind: StreamKind,
        ceiling_ms: u64,
        uri: Option<String>,
    },
}

impl CaptureError {
    pub fn kind(&self) -> StreamKind {
        match self {
            CaptureError::PermissionDenied(kind)
            | CaptureError::AlreadyActive(kind)
            | CaptureError::NotActive(kind) => *kind,
            CaptureError::DeviceError { kind, .. } | CaptureError::TimedOut { kind, .. } => *kind,
        }
    }

    /// Recording salvaged from an auto-stop, if any.
    pub fn salvaged_uri(&self) -> Option<&str> {
        match self {
            CaptureError::TimedOut { uri, .. } => uri.as_deref(),
            _ => None,
        }
    }
}
