//! Seam to the platform camera/microphone driver.
//!
//! The engine never touches the device directly; a platform shell provides a
//! [`CaptureDriver`] and the [`CaptureSessionManager`](super::CaptureSessionManager)
//! is its only caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StreamKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FlashMode {
    #[default]
    Off,
    On,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraOptions {
    pub facing: CameraFacing,
    pub flash: FlashMode,
    pub torch: bool,
    pub zoom: f32,
    pub quality: String,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            facing: CameraFacing::Front,
            flash: FlashMode::Off,
            torch: false,
            zoom: 0.0,
            quality: "1080p".into(),
        }
    }
}

/// What the driver is asked to record. `max_duration_ms` mirrors the
/// manager's ceiling so drivers with a native limit can enforce it too.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingOptions {
    pub max_duration_ms: u64,
    pub camera: Option<CameraOptions>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[async_trait]
pub trait CaptureDriver: Send + Sync {
    async fn permission(&self, kind: StreamKind) -> PermissionStatus;

    async fn request_permission(&self, kind: StreamKind) -> PermissionStatus;

    /// Acquires the device and begins recording. The returned recording owns
    /// the hardware until `stop` completes.
    async fn start_recording(
        &self,
        kind: StreamKind,
        options: &RecordingOptions,
    ) -> Result<Box<dyn DeviceRecording>, DriverError>;
}

#[async_trait]
pub trait DeviceRecording: Send {
    /// Finalizes the recording, releases the device and returns a locally
    /// addressable URI for the captured bytes.
    async fn stop(&mut self) -> Result<String, DriverError>;
}
