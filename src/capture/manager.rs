use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::utils::millis;

use super::{
    driver::{CameraOptions, CaptureDriver, DeviceRecording, DriverError, PermissionStatus},
    CaptureError, CaptureHandle, CaptureState, RecordingOptions, StreamKind,
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub audio_ceiling: Duration,
    pub video_ceiling: Duration,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            audio_ceiling: Duration::from_secs(60),
            video_ceiling: Duration::from_secs(120),
        }
    }
}

impl CaptureLimits {
    fn ceiling(&self, kind: StreamKind) -> Duration {
        match kind {
            StreamKind::Audio => self.audio_ceiling,
            StreamKind::Video => self.video_ceiling,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReport {
    pub audio: PermissionStatus,
    pub video: PermissionStatus,
}

impl PermissionReport {
    pub fn all_granted(&self) -> bool {
        self.audio.is_granted() && self.video.is_granted()
    }
}

/// Device ownership for one live recording. A lease that is dropped without
/// being released stops the device in the background.
struct HardwareLease {
    kind: StreamKind,
    recording: Option<Box<dyn DeviceRecording>>,
}

impl HardwareLease {
    async fn release(mut self) -> Result<String, DriverError> {
        match self.recording.take() {
            Some(mut recording) => recording.stop().await,
            None => Err(DriverError::new("recording already released")),
        }
    }
}

impl Drop for HardwareLease {
    fn drop(&mut self) {
        let Some(mut recording) = self.recording.take() else {
            return;
        };
        let kind = self.kind;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log_warn!("{kind} recording dropped while live; releasing device");
                runtime.spawn(async move {
                    if let Err(err) = recording.stop().await {
                        log_error!("failed to release {kind} device: {err}");
                    }
                });
            }
            Err(_) => {
                log_error!("{kind} recording dropped outside a runtime; device not released");
            }
        }
    }
}

struct ActiveRecording {
    handle: CaptureHandle,
    started: Instant,
    lease: HardwareLease,
    /// Cancels the ceiling watchdog when the recording leaves the slot.
    watchdog: DropGuard,
}

#[derive(Default)]
struct SlotInner {
    active: Option<ActiveRecording>,
    /// Outcome of a watchdog auto-stop, handed to the next `stop` for that handle.
    expired: Option<(CaptureHandle, CaptureError)>,
}

struct StreamSlot {
    kind: StreamKind,
    ceiling: Duration,
    inner: Mutex<SlotInner>,
    state_tx: watch::Sender<CaptureState>,
}

impl StreamSlot {
    fn new(kind: StreamKind, ceiling: Duration) -> Self {
        let (state_tx, _) = watch::channel(CaptureState::Idle);
        Self {
            kind,
            ceiling,
            inner: Mutex::new(SlotInner::default()),
            state_tx,
        }
    }

    fn publish(&self, state: CaptureState) {
        self.state_tx.send_replace(state);
    }

    async fn expire(&self, handle: CaptureHandle) {
        let mut inner = self.inner.lock().await;
        let active = match inner.active.take() {
            Some(active) if active.handle == handle => active,
            other => {
                inner.active = other;
                return;
            }
        };

        let kind = self.kind;
        let ceiling_ms = millis(self.ceiling);
        log_warn!("{kind} recording {} hit the {ceiling_ms}ms ceiling; stopping", handle.id);

        let ActiveRecording {
            lease, watchdog, ..
        } = active;
        // This task is the watchdog; disarm so dropping the guard is a no-op.
        let _ = watchdog.disarm();

        let uri = match lease.release().await {
            Ok(uri) => {
                self.publish(CaptureState::Stopped {
                    handle,
                    uri: uri.clone(),
                    timed_out: true,
                });
                Some(uri)
            }
            Err(err) => {
                log_error!("{kind} auto-stop failed: {err}");
                self.publish(CaptureState::Failed {
                    handle: Some(handle),
                    reason: format!("auto-stop at ceiling failed: {err}"),
                });
                None
            }
        };

        inner.expired = Some((
            handle,
            CaptureError::TimedOut {
                kind,
                ceiling_ms,
                uri,
            },
        ));
    }
}

fn spawn_watchdog(
    slot: Weak<StreamSlot>,
    handle: CaptureHandle,
    ceiling: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(ceiling) => {
                if let Some(slot) = slot.upgrade() {
                    slot.expire(handle).await;
                }
            }
        }
    });
}

/// Owns the audio and video recording lifecycles. At most one recording per
/// stream kind is live; every exit path releases the device.
#[derive(Clone)]
pub struct CaptureSessionManager {
    driver: Arc<dyn CaptureDriver>,
    audio: Arc<StreamSlot>,
    video: Arc<StreamSlot>,
}

impl CaptureSessionManager {
    pub fn new(driver: Arc<dyn CaptureDriver>, limits: CaptureLimits) -> Self {
        Self {
            driver,
            audio: Arc::new(StreamSlot::new(
                StreamKind::Audio,
                limits.ceiling(StreamKind::Audio),
            )),
            video: Arc::new(StreamSlot::new(
                StreamKind::Video,
                limits.ceiling(StreamKind::Video),
            )),
        }
    }

    fn slot(&self, kind: StreamKind) -> &Arc<StreamSlot> {
        match kind {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
        }
    }

    /// Queries both permissions, requesting the ones not yet granted.
    pub async fn ensure_permissions(&self) -> PermissionReport {
        let mut report = PermissionReport {
            audio: PermissionStatus::Undetermined,
            video: PermissionStatus::Undetermined,
        };

        for kind in [StreamKind::Audio, StreamKind::Video] {
            let mut status = self.driver.permission(kind).await;
            if !status.is_granted() {
                log_info!("requesting {kind} permission");
                status = self.driver.request_permission(kind).await;
            }
            match kind {
                StreamKind::Audio => report.audio = status,
                StreamKind::Video => report.video = status,
            }
        }

        report
    }

    pub async fn start(
        &self,
        kind: StreamKind,
        camera: Option<CameraOptions>,
    ) -> Result<CaptureHandle, CaptureError> {
        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;

        if let Some(active) = inner.active.as_ref() {
            log_warn!(
                "refusing to start {kind}: recording {} is still live",
                active.handle.id
            );
            return Err(CaptureError::AlreadyActive(kind));
        }

        if !self.driver.permission(kind).await.is_granted() {
            return Err(CaptureError::PermissionDenied(kind));
        }

        let options = RecordingOptions {
            max_duration_ms: millis(slot.ceiling),
            camera,
        };
        let recording = match self.driver.start_recording(kind, &options).await {
            Ok(recording) => recording,
            Err(err) => {
                log_error!("{kind} device failed to start: {err}");
                slot.publish(CaptureState::Failed {
                    handle: None,
                    reason: err.to_string(),
                });
                return Err(CaptureError::DeviceError {
                    kind,
                    reason: err.0,
                });
            }
        };

        let handle = CaptureHandle::new(kind);
        let token = CancellationToken::new();
        spawn_watchdog(Arc::downgrade(slot), handle, slot.ceiling, token.clone());

        inner.expired = None;
        inner.active = Some(ActiveRecording {
            handle,
            started: Instant::now(),
            lease: HardwareLease {
                kind,
                recording: Some(recording),
            },
            watchdog: token.drop_guard(),
        });
        slot.publish(CaptureState::Recording {
            handle,
            started_at: Utc::now(),
        });

        log_info!("{kind} recording {} started", handle.id);
        Ok(handle)
    }

    pub async fn stop(&self, handle: CaptureHandle) -> Result<String, CaptureError> {
        let kind = handle.kind;
        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;

        let active = match inner.active.take() {
            Some(active) if active.handle == handle => active,
            other => {
                inner.active = other;
                return match inner.expired.take() {
                    Some((expired, err)) if expired == handle => Err(err),
                    other => {
                        inner.expired = other;
                        Err(CaptureError::NotActive(kind))
                    }
                };
            }
        };

        let ActiveRecording {
            started,
            lease,
            watchdog,
            ..
        } = active;
        drop(watchdog);

        match lease.release().await {
            Ok(uri) => {
                log_info!(
                    "{kind} recording {} stopped after {}ms",
                    handle.id,
                    millis(started.elapsed())
                );
                slot.publish(CaptureState::Stopped {
                    handle,
                    uri: uri.clone(),
                    timed_out: false,
                });
                Ok(uri)
            }
            Err(err) => {
                log_error!("{kind} recording {} failed to stop: {err}", handle.id);
                slot.publish(CaptureState::Failed {
                    handle: Some(handle),
                    reason: err.to_string(),
                });
                Err(CaptureError::DeviceError {
                    kind,
                    reason: err.0,
                })
            }
        }
    }

    /// Stops whatever recording of `kind` is live, if any.
    pub async fn stop_active(&self, kind: StreamKind) -> Option<Result<String, CaptureError>> {
        let handle = self.active_handle(kind)?;
        Some(self.stop(handle).await)
    }

    /// Entry point for asynchronous driver faults (device unplugged, camera
    /// taken by another app). Releases the device and marks the stream failed.
    pub async fn report_fault(
        &self,
        handle: CaptureHandle,
        reason: impl Into<String>,
    ) -> Result<(), CaptureError> {
        let kind = handle.kind;
        let reason = reason.into();
        let slot = self.slot(kind);
        let mut inner = slot.inner.lock().await;

        let active = match inner.active.take() {
            Some(active) if active.handle == handle => active,
            other => {
                inner.active = other;
                return Err(CaptureError::NotActive(kind));
            }
        };

        let ActiveRecording {
            lease, watchdog, ..
        } = active;
        drop(watchdog);

        log_error!("{kind} recording {} faulted: {reason}", handle.id);
        if let Err(err) = lease.release().await {
            log_warn!("{kind} release after fault failed: {err}");
        }
        slot.publish(CaptureState::Failed {
            handle: Some(handle),
            reason,
        });
        Ok(())
    }

    pub fn state(&self, kind: StreamKind) -> CaptureState {
        self.slot(kind).state_tx.borrow().clone()
    }

    pub fn subscribe(&self, kind: StreamKind) -> watch::Receiver<CaptureState> {
        self.slot(kind).state_tx.subscribe()
    }

    pub fn active_handle(&self, kind: StreamKind) -> Option<CaptureHandle> {
        match &*self.slot(kind).state_tx.borrow() {
            CaptureState::Recording { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}
