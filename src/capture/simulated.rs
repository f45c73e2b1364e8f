//! File-backed stand-in for the platform capture driver, used by the headless
//! binary and by tests. Each stopped recording becomes a small file under the
//! output directory; permission answers and device faults are scriptable.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::time::Instant;

use super::{
    driver::{CaptureDriver, DeviceRecording, DriverError, PermissionStatus, RecordingOptions},
    StreamKind,
};

pub struct SimulatedDriver {
    output_dir: PathBuf,
    permissions: Mutex<HashMap<StreamKind, PermissionStatus>>,
    grant_on_request: bool,
    start_failures: Mutex<HashSet<StreamKind>>,
    stop_failures: Arc<Mutex<HashSet<StreamKind>>>,
    sequence: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl SimulatedDriver {
    /// All permissions granted, no scripted faults.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let permissions = [StreamKind::Audio, StreamKind::Video]
            .into_iter()
            .map(|kind| (kind, PermissionStatus::Granted))
            .collect();

        Self {
            output_dir: output_dir.into(),
            permissions: Mutex::new(permissions),
            grant_on_request: true,
            start_failures: Mutex::new(HashSet::new()),
            stop_failures: Arc::new(Mutex::new(HashSet::new())),
            sequence: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_permission(self, kind: StreamKind, status: PermissionStatus) -> Self {
        self.permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, status);
        self
    }

    /// Permission prompts are answered with `Denied`.
    pub fn deny_requests(mut self) -> Self {
        self.grant_on_request = false;
        self
    }

    pub fn fail_next_start(&self, kind: StreamKind) {
        self.start_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
    }

    pub fn fail_next_stop(&self, kind: StreamKind) {
        self.stop_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
    }

    /// Devices currently held by an unreleased recording.
    pub fn live_devices(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn take_fault(set: &Mutex<HashSet<StreamKind>>, kind: StreamKind) -> bool {
        set.lock().unwrap_or_else(PoisonError::into_inner).remove(&kind)
    }
}

#[async_trait]
impl CaptureDriver for SimulatedDriver {
    async fn permission(&self, kind: StreamKind) -> PermissionStatus {
        self.permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .copied()
            .unwrap_or(PermissionStatus::Undetermined)
    }

    async fn request_permission(&self, kind: StreamKind) -> PermissionStatus {
        let status = if self.grant_on_request {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        self.permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, status);
        status
    }

    async fn start_recording(
        &self,
        kind: StreamKind,
        options: &RecordingOptions,
    ) -> Result<Box<dyn DeviceRecording>, DriverError> {
        if Self::take_fault(&self.start_failures, kind) {
            return Err(DriverError::new(format!("{kind} device busy")));
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        let extension = match kind {
            StreamKind::Audio => "m4a",
            StreamKind::Video => "mp4",
        };
        let path = self.output_dir.join(format!("{kind}-{n}.{extension}"));

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedRecording {
            kind,
            path,
            started: Instant::now(),
            quality: options
                .camera
                .as_ref()
                .map(|camera| camera.quality.clone()),
            stop_failures: Arc::clone(&self.stop_failures),
            live: Some(Arc::clone(&self.live)),
        }))
    }
}

struct SimulatedRecording {
    kind: StreamKind,
    path: PathBuf,
    started: Instant,
    quality: Option<String>,
    /// Shared with the driver so a fault scripted mid-recording still applies.
    stop_failures: Arc<Mutex<HashSet<StreamKind>>>,
    /// Present until the device is released.
    live: Option<Arc<AtomicUsize>>,
}

impl SimulatedRecording {
    fn release(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DeviceRecording for SimulatedRecording {
    async fn stop(&mut self) -> Result<String, DriverError> {
        self.release();

        if SimulatedDriver::take_fault(&self.stop_failures, self.kind) {
            return Err(DriverError::new(format!("{} encoder crashed", self.kind)));
        }

        let body = format!(
            "simulated {} capture, {}ms, quality {}",
            self.kind,
            self.started.elapsed().as_millis(),
            self.quality.as_deref().unwrap_or("default"),
        );
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| DriverError::new(err.to_string()))?;
        }
        fs::write(&self.path, body).map_err(|err| DriverError::new(err.to_string()))?;

        Ok(format!("file://{}", self.path.display()))
    }
}

impl Drop for SimulatedRecording {
    fn drop(&mut self) {
        self.release();
    }
}
