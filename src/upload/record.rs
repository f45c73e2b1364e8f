use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::StreamKind;

/// Durable key/value store for session metadata, addressed by path.
#[async_trait]
pub trait StructuredStore: Send + Sync {
    /// Writes `record` at `path`, overwriting whatever was there.
    async fn write(&self, path: &str, record: &serde_json::Value) -> Result<()>;

    async fn read(&self, path: &str) -> Result<Option<serde_json::Value>>;
}

/// Where metadata records live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MetadataLayout {
    /// `reaction-test/{user_id}/{timestamp}`
    #[default]
    PerUser,
    /// `reaction-test/{timestamp}`
    Flat,
}

impl MetadataLayout {
    pub fn path(&self, user_id: &str, timestamp_ms: i64) -> String {
        match self {
            MetadataLayout::PerUser => format!("reaction-test/{user_id}/{timestamp_ms}"),
            MetadataLayout::Flat => format!("reaction-test/{timestamp_ms}"),
        }
    }
}

pub fn artifact_path(user_id: &str, timestamp_ms: i64, kind: StreamKind) -> String {
    format!("reaction-test/{user_id}/{timestamp_ms}/{kind}_recording")
}

/// Persisted shape of one committed test. Field names are shared with the
/// analytics screens that read these records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionTestRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub id_data: i64,
    pub date: i64,
    pub game_nb: u32,
    /// Latencies in activation order; `-1` marks a miss.
    pub reactiontime: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_recording: Option<String>,
    pub video_recording: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_layout() {
        assert_eq!(
            MetadataLayout::PerUser.path("u1", 1700),
            "reaction-test/u1/1700"
        );
        assert_eq!(MetadataLayout::Flat.path("u1", 1700), "reaction-test/1700");
        assert_eq!(
            artifact_path("u1", 1700, StreamKind::Audio),
            "reaction-test/u1/1700/audio_recording"
        );
    }

    #[test]
    fn record_uses_wire_field_names() {
        let record = ReactionTestRecord {
            session_id: "u1-1700".into(),
            id_data: 1700,
            date: 1700,
            game_nb: 23,
            reactiontime: vec![200, -1],
            voice_recording: None,
            video_recording: "file:///v".into(),
            user_id: "u1".into(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["game_nb"], 23);
        assert_eq!(value["reactiontime"], serde_json::json!([200, -1]));
        assert!(value.get("voice_recording").is_none());

        let back: ReactionTestRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
