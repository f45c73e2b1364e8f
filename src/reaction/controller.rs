use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex, Notify},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::AuthProvider,
    capture::{
        CameraOptions, CaptureError, CaptureHandle, CaptureSessionManager, CaptureState,
        StreamKind,
    },
    db::Database,
    sequence::{generate, SequenceError, SequenceParams, StimulusSequence},
    upload::{CommitError, CommitPipeline, CommitReceipt},
};

use super::{
    recorder::ReactionSample,
    session::{AbortReason, CaptureOutcome, TestSession},
    state::{ActiveStimulus, RunEvent, StimulusRun, TestPhase},
};

const ENABLE_LOGS: bool = true;
const EVENT_CAPACITY: usize = 64;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a test is already armed or running")]
    AlreadyRunning,
    #[error("no test is armed or running")]
    NotRunning,
    #[error("a completed session must be committed or discarded first")]
    UncommittedSession,
    #[error("{kind} capture failed: {source}")]
    Capture {
        kind: StreamKind,
        #[source]
        source: CaptureError,
    },
    #[error("test is {0:?}, not complete")]
    NotComplete(TestPhase),
    #[error("no completed session to commit")]
    NoCompletedSession,
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("session journal: {0}")]
    Journal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionTestConfig {
    pub sequence: SequenceParams,
    /// How long an activated stimulus accepts an acknowledgment.
    pub activation_window: Duration,
    pub camera: CameraOptions,
}

impl Default for ReactionTestConfig {
    fn default() -> Self {
        Self {
            sequence: SequenceParams::default(),
            activation_window: Duration::from_millis(1500),
            camera: CameraOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSnapshot {
    pub phase: TestPhase,
    pub session_id: Option<String>,
    pub resolved: usize,
    pub total: usize,
    pub active: Option<ActiveStimulus>,
    pub samples: Vec<ReactionSample>,
    pub abort_reason: Option<AbortReason>,
    pub voice_recording: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum EngineEvent {
    PhaseChanged { phase: TestPhase },
    StimulusActivated { stimulus: ActiveStimulus },
    StimulusResolved { sample: ReactionSample },
    CaptureFailed { kind: StreamKind, reason: String },
}

#[derive(Default)]
struct EngineState {
    phase: TestPhase,
    session: Option<TestSession>,
    run: Option<StimulusRun>,
    run_started: Option<Instant>,
    video: Option<CaptureHandle>,
    voice: Option<CaptureHandle>,
    /// Voice recording made before the test, attached to the next session.
    pending_audio: CaptureOutcome,
    cancel: Option<CancellationToken>,
}

impl EngineState {
    fn snapshot(&self, capture: &CaptureSessionManager) -> TestSnapshot {
        let (samples, total, active) = match (&self.run, &self.session) {
            (Some(run), _) => (run.recorder().snapshot(), run.total(), run.active()),
            (None, Some(session)) => (session.samples.clone(), session.sequence.len(), None),
            (None, None) => (Vec::new(), 0, None),
        };

        TestSnapshot {
            phase: self.phase,
            session_id: self.session.as_ref().and_then(TestSession::session_id),
            resolved: samples.len(),
            total,
            active,
            samples,
            abort_reason: self
                .session
                .as_ref()
                .and_then(|session| session.abort_reason.clone()),
            // The audio ceiling may have stopped the recording behind our back.
            voice_recording: self
                .voice
                .is_some_and(|voice| capture.active_handle(StreamKind::Audio) == Some(voice)),
        }
    }
}

/// Runs one reaction test at a time: arms the camera, replays the stimulus
/// sequence on a scheduler task, resolves acknowledgments, and hands the
/// finished session to the commit pipeline.
#[derive(Clone)]
pub struct ReactionTestController {
    state: Arc<Mutex<EngineState>>,
    capture: CaptureSessionManager,
    auth: Arc<dyn AuthProvider>,
    pipeline: CommitPipeline,
    journal: Option<Database>,
    events: broadcast::Sender<EngineEvent>,
    wake: Arc<Notify>,
    scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: ReactionTestConfig,
}

impl ReactionTestController {
    pub fn new(
        capture: CaptureSessionManager,
        auth: Arc<dyn AuthProvider>,
        pipeline: CommitPipeline,
        config: ReactionTestConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            capture,
            auth,
            pipeline,
            journal: None,
            events,
            wake: Arc::new(Notify::new()),
            scheduler: Arc::new(Mutex::new(None)),
            config,
        }
    }

    /// Completed sessions are journaled here until they are committed.
    pub fn with_journal(mut self, journal: Database) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn capture(&self) -> &CaptureSessionManager {
        &self.capture
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> TestSnapshot {
        self.state.lock().await.snapshot(&self.capture)
    }

    /// Generates a fresh sequence from the configured parameters and starts it.
    pub async fn start_test(&self) -> Result<TestSnapshot, EngineError> {
        let sequence = generate(&self.config.sequence, &mut rand::thread_rng())?;
        self.start_with_sequence(sequence).await
    }

    pub async fn start_with_sequence(
        &self,
        sequence: StimulusSequence,
    ) -> Result<TestSnapshot, EngineError> {
        let mut state = self.state.lock().await;
        let phase = state.phase;
        match phase {
            TestPhase::Armed | TestPhase::Running => return Err(EngineError::AlreadyRunning),
            TestPhase::Complete => return Err(EngineError::UncommittedSession),
            TestPhase::Aborted => {
                state.session = None;
                self.set_phase(&mut state, TestPhase::Idle);
            }
            TestPhase::Idle => {}
        }

        if let Some(voice) = state.voice.take() {
            log_info!("stopping voice recording before the test starts");
            state.pending_audio = CaptureOutcome::from_stop(self.capture.stop(voice).await);
        }

        let video_rx = self.capture.subscribe(StreamKind::Video);
        let video = self
            .capture
            .start(StreamKind::Video, Some(self.config.camera.clone()))
            .await
            .map_err(|source| {
                log_error!("video failed to start, test stays idle: {source}");
                EngineError::Capture {
                    kind: StreamKind::Video,
                    source,
                }
            })?;

        let audio = std::mem::take(&mut state.pending_audio);
        let mut session = TestSession::new(
            Utc::now(),
            self.auth.current_user_id(),
            sequence,
            audio,
        );
        session.phase = TestPhase::Armed;
        log_info!(
            "test armed with {} stimuli, video {}",
            session.sequence.len(),
            video.id
        );
        let run = StimulusRun::new(&session.sequence, self.config.activation_window);
        state.session = Some(session);
        state.video = Some(video);
        self.set_phase(&mut state, TestPhase::Armed);

        let token = CancellationToken::new();
        state.run = Some(run);
        state.run_started = Some(Instant::now());
        state.cancel = Some(token.clone());
        self.set_phase(&mut state, TestPhase::Running);

        let snapshot = state.snapshot(&self.capture);
        drop(state);

        self.spawn_scheduler(token, video_rx, video).await;
        Ok(snapshot)
    }

    /// Delivers a tap on `stimulus_id`. Returns the sample when the tap hit
    /// the active stimulus inside its window; anything else is dropped.
    pub async fn acknowledge(&self, stimulus_id: u32) -> Option<ReactionSample> {
        let mut state = self.state.lock().await;
        if state.phase != TestPhase::Running {
            return None;
        }
        let started = state.run_started?;
        let sample = state
            .run
            .as_mut()?
            .acknowledge(stimulus_id, started.elapsed());

        match &sample {
            Some(sample) => {
                log_debug!(
                    "stimulus {} hit after {:?}ms",
                    sample.stimulus_id,
                    sample.latency_ms
                );
                self.emit(EngineEvent::StimulusResolved {
                    sample: sample.clone(),
                });
                self.wake.notify_one();
            }
            None => log_debug!("ignoring tap on stimulus {stimulus_id}"),
        }
        sample
    }

    pub async fn abort_test(&self) -> Result<TestSnapshot, EngineError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.phase.is_live() {
                return Err(EngineError::NotRunning);
            }
            self.abort_locked(&mut state, AbortReason::UserCancelled)
                .await;
            state.snapshot(&self.capture)
        };
        self.cancel_scheduler().await;
        Ok(snapshot)
    }

    /// Clears an aborted session. Completed sessions go through `commit` or
    /// `discard_completed` instead.
    pub async fn reset(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let phase = state.phase;
        match phase {
            TestPhase::Idle => Ok(()),
            TestPhase::Aborted => {
                state.session = None;
                self.set_phase(&mut state, TestPhase::Idle);
                Ok(())
            }
            TestPhase::Armed | TestPhase::Running => Err(EngineError::AlreadyRunning),
            TestPhase::Complete => Err(EngineError::UncommittedSession),
        }
    }

    pub async fn start_voice_recording(&self) -> Result<CaptureHandle, EngineError> {
        let mut state = self.state.lock().await;
        if state.phase.is_live() {
            return Err(EngineError::AlreadyRunning);
        }

        let handle = self
            .capture
            .start(StreamKind::Audio, None)
            .await
            .map_err(|source| EngineError::Capture {
                kind: StreamKind::Audio,
                source,
            })?;
        state.voice = Some(handle);
        state.pending_audio = CaptureOutcome::NotRecorded;
        Ok(handle)
    }

    /// Stops the voice recording. A recording already cut off by the audio
    /// ceiling still yields its file.
    pub async fn stop_voice_recording(&self) -> Result<CaptureOutcome, EngineError> {
        let mut state = self.state.lock().await;
        let handle = state.voice.take().ok_or(EngineError::Capture {
            kind: StreamKind::Audio,
            source: CaptureError::NotActive(StreamKind::Audio),
        })?;

        let result = self.capture.stop(handle).await;
        let outcome = CaptureOutcome::from_stop(result.clone());
        state.pending_audio = outcome.clone();

        if let (CaptureOutcome::Failed { .. }, Err(source)) = (&outcome, result) {
            return Err(EngineError::Capture {
                kind: StreamKind::Audio,
                source,
            });
        }
        Ok(outcome)
    }

    /// Commits the completed session. On failure the session stays in memory
    /// so the caller can retry without repeating the test.
    pub async fn commit(&self) -> Result<CommitReceipt, EngineError> {
        let session = {
            let state = self.state.lock().await;
            match (state.phase, state.session.as_ref()) {
                (TestPhase::Complete, Some(session)) => session.clone(),
                (TestPhase::Idle, _) | (TestPhase::Complete, None) => {
                    return Err(EngineError::NoCompletedSession)
                }
                (phase, _) => return Err(EngineError::NotComplete(phase)),
            }
        };

        let receipt = self.pipeline.commit(&session).await.map_err(|err| {
            log_error!("commit failed, session kept for retry: {err}");
            EngineError::Commit(err)
        })?;

        {
            let mut state = self.state.lock().await;
            let still_current = state.phase == TestPhase::Complete
                && state.session.as_ref().map(TestSession::timestamp_ms)
                    == Some(session.timestamp_ms());
            if still_current {
                state.session = None;
                self.set_phase(&mut state, TestPhase::Idle);
            }
        }
        self.forget_journaled(session.timestamp_ms()).await;

        Ok(receipt)
    }

    /// Drops the completed session without committing it.
    pub async fn discard_completed(&self) -> Result<TestSession, EngineError> {
        let session = {
            let mut state = self.state.lock().await;
            if state.phase != TestPhase::Complete {
                return Err(EngineError::NoCompletedSession);
            }
            let session = state
                .session
                .take()
                .ok_or(EngineError::NoCompletedSession)?;
            self.set_phase(&mut state, TestPhase::Idle);
            session
        };

        log_warn!("discarding uncommitted session {}", session.timestamp_ms());
        self.forget_journaled(session.timestamp_ms()).await;
        Ok(session)
    }

    /// Loads a journaled session back so it can be committed.
    pub async fn restore_completed(&self, session: TestSession) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let phase = state.phase;
        match phase {
            TestPhase::Armed | TestPhase::Running => return Err(EngineError::AlreadyRunning),
            TestPhase::Complete => return Err(EngineError::UncommittedSession),
            TestPhase::Idle | TestPhase::Aborted => {}
        }
        if session.phase != TestPhase::Complete {
            return Err(EngineError::NotComplete(session.phase));
        }

        log_info!("restored session {} from journal", session.timestamp_ms());
        state.session = Some(session);
        self.set_phase(&mut state, TestPhase::Complete);
        Ok(())
    }

    /// Completed sessions that were never committed, oldest first.
    pub async fn pending_sessions(&self) -> Result<Vec<TestSession>, EngineError> {
        let Some(journal) = &self.journal else {
            return Ok(Vec::new());
        };
        journal
            .list_pending_sessions()
            .await
            .map(|pending| pending.into_iter().map(|entry| entry.session).collect())
            .map_err(|err| EngineError::Journal(format!("{err:#}")))
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut EngineState, phase: TestPhase) {
        if state.phase != phase {
            log_info!("phase {:?} -> {:?}", state.phase, phase);
        }
        state.phase = phase;
        if let Some(session) = state.session.as_mut() {
            session.phase = phase;
        }
        self.emit(EngineEvent::PhaseChanged { phase });
    }

    fn emit_run_event(&self, event: RunEvent) {
        match event {
            RunEvent::Activated(stimulus) => {
                log_debug!(
                    "stimulus {} (#{}) activated at {}ms",
                    stimulus.stimulus_id,
                    stimulus.index,
                    stimulus.activated_at.as_millis()
                );
                self.emit(EngineEvent::StimulusActivated { stimulus });
            }
            RunEvent::Resolved(sample) => {
                log_debug!("stimulus {} missed", sample.stimulus_id);
                self.emit(EngineEvent::StimulusResolved { sample });
            }
        }
    }

    async fn spawn_scheduler(
        &self,
        token: CancellationToken,
        video_rx: watch::Receiver<CaptureState>,
        video: CaptureHandle,
    ) {
        let mut guard = self.scheduler.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let controller = self.clone();
        *guard = Some(tokio::spawn(controller.drive(token, video_rx, video)));
    }

    async fn cancel_scheduler(&self) {
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.abort();
        }
    }

    /// Scheduler loop. Deadlines are absolute offsets from the run start, so
    /// a late wakeup never shifts later activations.
    async fn drive(
        self,
        token: CancellationToken,
        mut video_rx: watch::Receiver<CaptureState>,
        video: CaptureHandle,
    ) {
        loop {
            let deadline = {
                let mut state = self.state.lock().await;
                if token.is_cancelled() || state.phase != TestPhase::Running {
                    return;
                }
                let Some(started) = state.run_started else {
                    return;
                };
                let Some(run) = state.run.as_mut() else {
                    return;
                };

                let events = run.advance(started.elapsed());
                let next = if run.is_finished() {
                    None
                } else {
                    run.next_deadline().map(|offset| started + offset)
                };
                for event in events {
                    self.emit_run_event(event);
                }

                match next {
                    Some(deadline) => deadline,
                    None => break,
                }
            };

            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep_until(deadline) => {}
                _ = self.wake.notified() => {}
                changed = video_rx.changed() => {
                    let failure = match changed {
                        Ok(()) => {
                            let current = video_rx.borrow_and_update().clone();
                            video_failure(&current, video)
                        }
                        Err(_) => Some("capture manager shut down".to_string()),
                    };
                    if let Some(reason) = failure {
                        self.abort_on_capture_failure(&token, StreamKind::Video, reason)
                            .await;
                        return;
                    }
                }
            }
        }

        self.complete(&token).await;
    }

    async fn complete(&self, token: &CancellationToken) {
        let mut state = self.state.lock().await;
        if token.is_cancelled() || state.phase != TestPhase::Running {
            return;
        }
        state.cancel = None;

        let video = match state.video.take() {
            Some(handle) => {
                let outcome = CaptureOutcome::from_stop(self.capture.stop(handle).await);
                if let CaptureOutcome::Failed { reason } = &outcome {
                    log_error!("video did not stop cleanly after the test: {reason}");
                    self.emit(EngineEvent::CaptureFailed {
                        kind: StreamKind::Video,
                        reason: reason.clone(),
                    });
                }
                outcome
            }
            None => CaptureOutcome::NotRecorded,
        };

        let samples = state
            .run
            .take()
            .map(|run| run.recorder().snapshot())
            .unwrap_or_default();
        state.run_started = None;

        let Some(session) = state.session.as_mut() else {
            log_error!("run finished without a session");
            return;
        };
        session.samples = samples;
        session.video = video;
        log_info!(
            "test complete: {} samples, {} misses",
            session.samples.len(),
            session.samples.iter().filter(|s| s.is_miss()).count()
        );
        let journaled = session.clone();
        self.set_phase(&mut state, TestPhase::Complete);

        if let Some(journal) = &self.journal {
            if let Err(err) = journal.save_pending_session(&journaled).await {
                log_error!("failed to journal completed session: {err:#}");
            }
        }
    }

    async fn abort_on_capture_failure(
        &self,
        token: &CancellationToken,
        kind: StreamKind,
        reason: String,
    ) {
        let mut state = self.state.lock().await;
        if token.is_cancelled() || !state.phase.is_live() {
            return;
        }

        log_error!("{kind} capture failed mid-test: {reason}");
        self.emit(EngineEvent::CaptureFailed {
            kind,
            reason: reason.clone(),
        });
        self.abort_locked(&mut state, AbortReason::CaptureFailed { kind, reason })
            .await;
    }

    async fn abort_locked(&self, state: &mut EngineState, reason: AbortReason) {
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }

        let samples = match state.run.take() {
            Some(mut run) => {
                run.cancel();
                run.recorder().snapshot()
            }
            None => Vec::new(),
        };
        state.run_started = None;

        let video = match state.video.take() {
            Some(handle) => {
                let outcome = CaptureOutcome::from_stop(self.capture.stop(handle).await);
                if let CaptureOutcome::Failed { reason } = &outcome {
                    log_warn!("video stop during abort failed: {reason}");
                }
                outcome
            }
            None => CaptureOutcome::NotRecorded,
        };

        if let Some(session) = state.session.as_mut() {
            session.samples = samples;
            session.video = video;
            session.abort_reason = Some(reason.clone());
        }
        log_warn!("test aborted: {reason:?}");
        self.set_phase(state, TestPhase::Aborted);
    }

    async fn forget_journaled(&self, timestamp_ms: i64) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.remove_pending_session(timestamp_ms).await {
                log_error!("failed to clear journal entry {timestamp_ms}: {err:#}");
            }
        }
    }
}

fn video_failure(state: &CaptureState, video: CaptureHandle) -> Option<String> {
    match state {
        CaptureState::Failed {
            handle: Some(handle),
            reason,
        } if *handle == video => Some(reason.clone()),
        CaptureState::Stopped {
            handle,
            timed_out: true,
            ..
        } if *handle == video => Some("video hit its recording ceiling mid-test".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex as StdMutex};

    use anyhow::Result;
    use async_trait::async_trait;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        auth::StaticAuth,
        capture::{CaptureLimits, PermissionStatus, SimulatedDriver},
        sequence::StimulusEvent,
        upload::{CommitSettings, LocalBlobStore, StructuredStore},
    };

    #[derive(Default)]
    struct MemoryRecords {
        records: StdMutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl StructuredStore for MemoryRecords {
        async fn write(&self, path: &str, record: &serde_json::Value) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(path.to_string(), record.clone());
            Ok(())
        }

        async fn read(&self, path: &str) -> Result<Option<serde_json::Value>> {
            Ok(self.records.lock().unwrap().get(path).cloned())
        }
    }

    struct Harness {
        _dir: TempDir,
        driver: Arc<SimulatedDriver>,
        capture: CaptureSessionManager,
        auth: Arc<StaticAuth>,
        records: Arc<MemoryRecords>,
        controller: ReactionTestController,
    }

    fn harness_with(driver: impl FnOnce(&TempDir) -> SimulatedDriver) -> Harness {
        build_harness(driver, CaptureLimits::default())
    }

    fn build_harness(
        driver: impl FnOnce(&TempDir) -> SimulatedDriver,
        limits: CaptureLimits,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(driver(&dir));
        let capture = CaptureSessionManager::new(driver.clone(), limits);
        let auth = Arc::new(StaticAuth::signed_in("u1"));
        let records = Arc::new(MemoryRecords::default());
        let pipeline = CommitPipeline::new(
            Arc::new(LocalBlobStore::new(dir.path().join("blobs"))),
            records.clone(),
            auth.clone(),
            CommitSettings::default(),
        );
        let controller = ReactionTestController::new(
            capture.clone(),
            auth.clone(),
            pipeline,
            ReactionTestConfig::default(),
        );

        Harness {
            _dir: dir,
            driver,
            capture,
            auth,
            records,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(|dir| SimulatedDriver::new(dir.path().join("captures")))
    }

    fn sequence(events: &[(u32, u64)]) -> StimulusSequence {
        StimulusSequence::from_events(
            events
                .iter()
                .map(|&(stimulus_id, scheduled_delay_ms)| StimulusEvent {
                    stimulus_id,
                    scheduled_delay_ms,
                })
                .collect(),
            60_000,
        )
    }

    async fn sleep_ms(ms: u64) {
        time::sleep(Duration::from_millis(ms)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn hit_then_miss_records_latency_and_sentinel() {
        let h = harness();
        let mut events = h.controller.subscribe();

        let snapshot = h
            .controller
            .start_with_sequence(sequence(&[(2, 1000), (0, 1500)]))
            .await
            .unwrap();
        assert_eq!(snapshot.phase, TestPhase::Running);
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.session_id.as_deref().map(|id| id.starts_with("u1-")), Some(true));

        sleep_ms(1200).await;
        let sample = h.controller.acknowledge(2).await.unwrap();
        assert_eq!(sample, ReactionSample::hit(0, 2, 200));

        sleep_ms(5000).await;
        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TestPhase::Complete);
        assert_eq!(
            snapshot.samples,
            vec![ReactionSample::hit(0, 2, 200), ReactionSample::miss(1, 0)]
        );
        assert_eq!(h.driver.live_devices(), 0);

        let phases: Vec<TestPhase> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::PhaseChanged { phase } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![TestPhase::Armed, TestPhase::Running, TestPhase::Complete]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_and_mistargeted_taps_are_dropped() {
        let h = harness();
        h.controller
            .start_with_sequence(sequence(&[(1, 1000)]))
            .await
            .unwrap();

        sleep_ms(1100).await;
        assert_eq!(h.controller.acknowledge(3).await, None);
        assert_eq!(h.controller.snapshot().await.resolved, 0);

        sleep_ms(1500).await;
        assert_eq!(h.controller.acknowledge(1).await, None);

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TestPhase::Complete);
        assert_eq!(snapshot.samples, vec![ReactionSample::miss(0, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_test_at_a_time() {
        let h = harness();
        h.controller
            .start_with_sequence(sequence(&[(0, 1000)]))
            .await
            .unwrap();

        assert!(matches!(
            h.controller.start_with_sequence(sequence(&[(1, 1000)])).await,
            Err(EngineError::AlreadyRunning)
        ));
        assert_eq!(h.driver.live_devices(), 1);

        sleep_ms(3000).await;
        assert!(matches!(
            h.controller.start_test().await,
            Err(EngineError::UncommittedSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn video_start_failure_stays_idle() {
        let h = harness();
        h.driver.fail_next_start(StreamKind::Video);

        let err = h
            .controller
            .start_with_sequence(sequence(&[(0, 1000)]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Capture {
                kind: StreamKind::Video,
                source: CaptureError::DeviceError { .. }
            }
        ));
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Idle);
        assert_eq!(h.driver.live_devices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_camera_permission_blocks_arming() {
        let h = harness_with(|dir| {
            SimulatedDriver::new(dir.path())
                .with_permission(StreamKind::Video, PermissionStatus::Denied)
        });

        let err = h.controller.start_test().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Capture {
                source: CaptureError::PermissionDenied(StreamKind::Video),
                ..
            }
        ));
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn camera_fault_aborts_and_cancels_timers() {
        let h = harness();
        let mut events = h.controller.subscribe();
        h.controller
            .start_with_sequence(sequence(&[(1, 1000), (2, 1000)]))
            .await
            .unwrap();

        sleep_ms(1200).await;
        assert!(h.controller.snapshot().await.active.is_some());

        let video = h.capture.active_handle(StreamKind::Video).unwrap();
        h.capture.report_fault(video, "camera unplugged").await.unwrap();
        sleep_ms(1).await;

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TestPhase::Aborted);
        assert_eq!(
            snapshot.abort_reason,
            Some(AbortReason::CaptureFailed {
                kind: StreamKind::Video,
                reason: "camera unplugged".into()
            })
        );
        assert!(snapshot.samples.is_empty());
        assert_eq!(h.driver.live_devices(), 0);

        sleep_ms(10_000).await;
        assert!(h.controller.snapshot().await.samples.is_empty());
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            EngineEvent::CaptureFailed {
                kind: StreamKind::Video,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn video_ceiling_mid_run_aborts() {
        let h = build_harness(
            |dir| SimulatedDriver::new(dir.path().join("captures")),
            CaptureLimits {
                video_ceiling: Duration::from_secs(2),
                ..CaptureLimits::default()
            },
        );
        h.controller
            .start_with_sequence(sequence(&[(1, 1000), (2, 3000)]))
            .await
            .unwrap();

        sleep_ms(2500).await;
        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TestPhase::Aborted);
        assert_eq!(
            snapshot.abort_reason,
            Some(AbortReason::CaptureFailed {
                kind: StreamKind::Video,
                reason: "video hit its recording ceiling mid-test".into()
            })
        );
        assert!(snapshot.samples.is_empty());
        assert_eq!(h.driver.live_devices(), 0);

        sleep_ms(10_000).await;
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn video_stop_failure_completes_but_blocks_commit() {
        let h = harness();
        let mut events = h.controller.subscribe();
        h.driver.fail_next_stop(StreamKind::Video);
        h.controller
            .start_with_sequence(sequence(&[(0, 1000)]))
            .await
            .unwrap();

        sleep_ms(3000).await;
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Complete);
        assert_eq!(h.driver.live_devices(), 0);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            EngineEvent::CaptureFailed {
                kind: StreamKind::Video,
                ..
            }
        )));

        assert!(matches!(
            h.controller.commit().await,
            Err(EngineError::Commit(CommitError::MissingVideo(_)))
        ));
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Complete);
        assert!(h.records.records.lock().unwrap().is_empty());

        let session = h.controller.discard_completed().await.unwrap();
        assert!(matches!(session.video, CaptureOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_windows_do_not_delay_later_stimuli() {
        let h = harness();
        let mut events = h.controller.subscribe();
        h.controller
            .start_with_sequence(sequence(&[(0, 1000), (1, 1000), (2, 1000)]))
            .await
            .unwrap();

        sleep_ms(5000).await;
        let activations: Vec<Duration> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::StimulusActivated { stimulus } => Some(stimulus.activated_at),
                _ => None,
            })
            .collect();
        assert_eq!(
            activations,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000)
            ]
        );
        assert_eq!(h.controller.snapshot().await.samples.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn user_abort_releases_camera_and_allows_restart() {
        let h = harness();
        h.controller
            .start_with_sequence(sequence(&[(1, 1000), (2, 1000)]))
            .await
            .unwrap();

        sleep_ms(2600).await;
        let snapshot = h.controller.abort_test().await.unwrap();
        assert_eq!(snapshot.phase, TestPhase::Aborted);
        assert_eq!(snapshot.abort_reason, Some(AbortReason::UserCancelled));
        assert_eq!(snapshot.samples, vec![ReactionSample::miss(0, 1)]);
        assert_eq!(h.driver.live_devices(), 0);

        sleep_ms(10_000).await;
        assert_eq!(h.controller.snapshot().await.samples.len(), 1);
        assert!(matches!(
            h.controller.abort_test().await,
            Err(EngineError::NotRunning)
        ));

        h.controller.reset().await.unwrap();
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Idle);
        h.controller
            .start_with_sequence(sequence(&[(0, 500)]))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn every_activation_yields_one_sample() {
        let h = harness();
        let params = SequenceParams::default();
        let generated = generate(&params, &mut StdRng::seed_from_u64(11)).unwrap();
        let expected = generated.len();

        h.controller.start_with_sequence(generated).await.unwrap();
        sleep_ms(100_000).await;

        let snapshot = h.controller.snapshot().await;
        assert_eq!(snapshot.phase, TestPhase::Complete);
        assert_eq!(snapshot.samples.len(), expected);
        for (position, sample) in snapshot.samples.iter().enumerate() {
            assert_eq!(sample.index, position);
            assert!(sample.is_miss());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn voice_recording_is_committed_with_the_session() {
        let h = harness();

        h.controller.start_voice_recording().await.unwrap();
        assert!(h.controller.snapshot().await.voice_recording);
        sleep_ms(3000).await;

        h.controller
            .start_with_sequence(sequence(&[(0, 1000)]))
            .await
            .unwrap();
        assert!(!h.controller.snapshot().await.voice_recording);
        sleep_ms(1100).await;
        h.controller.acknowledge(0).await.unwrap();
        sleep_ms(100).await;
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Complete);

        let receipt = h.controller.commit().await.unwrap();
        assert!(receipt.record.voice_recording.is_some());
        assert_eq!(receipt.record.reactiontime, vec![100]);
        assert!(h
            .records
            .records
            .lock()
            .unwrap()
            .contains_key(&receipt.metadata_path));
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn voice_cut_off_by_ceiling_keeps_its_file() {
        let h = harness();

        h.controller.start_voice_recording().await.unwrap();
        sleep_ms(61_000).await;
        assert!(!h.controller.snapshot().await.voice_recording);

        match h.controller.stop_voice_recording().await.unwrap() {
            CaptureOutcome::Recorded { timed_out, .. } => assert!(timed_out),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            h.controller.stop_voice_recording().await,
            Err(EngineError::Capture {
                source: CaptureError::NotActive(StreamKind::Audio),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_keeps_session_for_retry() {
        let h = harness();
        h.controller
            .start_with_sequence(sequence(&[(0, 1000)]))
            .await
            .unwrap();
        sleep_ms(3000).await;

        h.auth.sign_out();
        assert!(matches!(
            h.controller.commit().await,
            Err(EngineError::Commit(CommitError::NoAuthenticatedUser))
        ));
        assert_eq!(h.controller.snapshot().await.phase, TestPhase::Complete);

        h.auth.sign_in("u1");
        let receipt = h.controller.commit().await.unwrap();
        assert_eq!(receipt.record.reactiontime, vec![-1]);
        assert!(matches!(
            h.controller.commit().await,
            Err(EngineError::NoCompletedSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_session_cannot_be_committed() {
        let h = harness();
        h.controller
            .start_with_sequence(sequence(&[(0, 1000)]))
            .await
            .unwrap();
        assert!(matches!(
            h.controller.commit().await,
            Err(EngineError::NotComplete(TestPhase::Running))
        ));

        sleep_ms(3000).await;
        let session = h.controller.discard_completed().await.unwrap();
        assert_eq!(session.phase, TestPhase::Complete);
        assert!(matches!(
            h.controller.commit().await,
            Err(EngineError::NoCompletedSession)
        ));

        h.controller.restore_completed(session).await.unwrap();
        assert!(h.controller.commit().await.is_ok());
    }
}
