use std::sync::Arc;

use serde::Serialize;

use crate::{
    auth::AuthProvider,
    capture::StreamKind,
    reaction::{TestPhase, TestSession},
};

use super::{
    blob::{read_artifact, BlobStore},
    record::{artifact_path, MetadataLayout, ReactionTestRecord, StructuredStore},
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("no authenticated user; sign in before committing")]
    NoAuthenticatedUser,
    #[error("only completed sessions can be committed (session is {0:?})")]
    NotComplete(TestPhase),
    #[error("session has no usable video recording: {0}")]
    MissingVideo(String),
    #[error("{artifact} upload failed: {reason}")]
    UploadFailed { artifact: StreamKind, reason: String },
    /// Uploads succeeded but no record points at them.
    #[error("metadata write for {session_id} failed after upload: {reason}")]
    MetadataWriteFailed {
        session_id: String,
        orphaned: Vec<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitReceipt {
    pub session_id: String,
    pub metadata_path: String,
    pub record: ReactionTestRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSettings {
    pub game_nb: u32,
    pub layout: MetadataLayout,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            game_nb: 23,
            layout: MetadataLayout::PerUser,
        }
    }
}

/// Uploads a completed session's artifacts and writes its metadata record.
///
/// Steps run strictly in order: audio (when present), video, metadata. A
/// failed step stops the pipeline, so a metadata record never exists without
/// the blobs it references. Paths are derived from the user and the session
/// timestamp, which makes a retried commit overwrite rather than duplicate.
#[derive(Clone)]
pub struct CommitPipeline {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn StructuredStore>,
    auth: Arc<dyn AuthProvider>,
    settings: CommitSettings,
}

impl CommitPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn StructuredStore>,
        auth: Arc<dyn AuthProvider>,
        settings: CommitSettings,
    ) -> Self {
        Self {
            blobs,
            records,
            auth,
            settings,
        }
    }

    pub async fn commit(&self, session: &TestSession) -> Result<CommitReceipt, CommitError> {
        if session.phase != TestPhase::Complete {
            return Err(CommitError::NotComplete(session.phase));
        }

        let current = self
            .auth
            .current_user_id()
            .ok_or(CommitError::NoAuthenticatedUser)?;
        let user_id = match session.user_id.as_deref() {
            Some(owner) if owner != current => {
                log_warn!("committing session of {owner} while {current} is signed in");
                owner.to_string()
            }
            Some(owner) => owner.to_string(),
            None => current,
        };

        let video_uri = session
            .video
            .uri()
            .ok_or_else(|| CommitError::MissingVideo(format!("{:?}", session.video)))?;

        let timestamp_ms = session.timestamp_ms();
        let session_id = session.session_id_for(&user_id);
        log_info!("committing session {session_id}");

        let voice_recording = match session.audio.uri() {
            Some(uri) => Some(
                self.upload_artifact(StreamKind::Audio, uri, &user_id, timestamp_ms)
                    .await?,
            ),
            None => None,
        };
        let video_recording = self
            .upload_artifact(StreamKind::Video, video_uri, &user_id, timestamp_ms)
            .await?;

        let record = ReactionTestRecord {
            session_id: session_id.clone(),
            id_data: timestamp_ms,
            date: timestamp_ms,
            game_nb: self.settings.game_nb,
            reactiontime: session.reaction_times(),
            voice_recording,
            video_recording,
            user_id: user_id.clone(),
        };
        let metadata_path = self.settings.layout.path(&user_id, timestamp_ms);

        let orphaned = || {
            record
                .voice_recording
                .iter()
                .cloned()
                .chain(std::iter::once(record.video_recording.clone()))
                .collect::<Vec<_>>()
        };

        let body = serde_json::to_value(&record).map_err(|err| CommitError::MetadataWriteFailed {
            session_id: session_id.clone(),
            orphaned: orphaned(),
            reason: err.to_string(),
        })?;

        if let Err(err) = self.records.write(&metadata_path, &body).await {
            log_error!("metadata write for {session_id} failed: {err:#}");
            return Err(CommitError::MetadataWriteFailed {
                session_id,
                orphaned: orphaned(),
                reason: format!("{err:#}"),
            });
        }

        log_info!("session {session_id} committed at {metadata_path}");
        Ok(CommitReceipt {
            session_id,
            metadata_path,
            record,
        })
    }

    async fn upload_artifact(
        &self,
        kind: StreamKind,
        local_uri: &str,
        user_id: &str,
        timestamp_ms: i64,
    ) -> Result<String, CommitError> {
        let path = artifact_path(user_id, timestamp_ms, kind);
        let failed = |err: anyhow::Error| {
            log_error!("{kind} upload to {path} failed: {err:#}");
            CommitError::UploadFailed {
                artifact: kind,
                reason: format!("{err:#}"),
            }
        };

        let bytes = read_artifact(local_uri).await.map_err(&failed)?;
        self.blobs.upload(bytes, &path).await.map_err(&failed)?;
        self.blobs.download_url(&path).await.map_err(&failed)
    }
}
