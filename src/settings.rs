use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use crate::{
    capture::{CameraOptions, CaptureLimits},
    reaction::ReactionTestConfig,
    sequence::{GenerationPolicy, SequenceParams},
    upload::{CommitSettings, MetadataLayout},
    utils::millis,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestSettings {
    pub circle_count: u32,
    pub sequence_length: usize,
    pub max_duration_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub activation_window_ms: u64,
    pub generation: GenerationPolicy,
    pub game_nb: u32,
    pub metadata_layout: MetadataLayout,
    pub audio_ceiling_ms: u64,
    pub video_ceiling_ms: u64,
    pub camera: CameraOptions,
}

impl Default for TestSettings {
    fn default() -> Self {
        let sequence = SequenceParams::default();
        let limits = CaptureLimits::default();
        let commit = CommitSettings::default();
        Self {
            circle_count: sequence.circle_count,
            sequence_length: sequence.sequence_length,
            max_duration_ms: sequence.max_duration_ms,
            min_delay_ms: sequence.min_delay_ms,
            max_delay_ms: sequence.max_delay_ms,
            activation_window_ms: 1500,
            generation: sequence.policy,
            game_nb: commit.game_nb,
            metadata_layout: commit.layout,
            audio_ceiling_ms: millis(limits.audio_ceiling),
            video_ceiling_ms: millis(limits.video_ceiling),
            camera: CameraOptions::default(),
        }
    }
}

impl TestSettings {
    pub fn sequence_params(&self) -> SequenceParams {
        SequenceParams {
            circle_count: self.circle_count,
            sequence_length: self.sequence_length,
            max_duration_ms: self.max_duration_ms,
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            policy: self.generation,
        }
    }

    pub fn test_config(&self) -> ReactionTestConfig {
        ReactionTestConfig {
            sequence: self.sequence_params(),
            activation_window: Duration::from_millis(self.activation_window_ms),
            camera: self.camera.clone(),
        }
    }

    pub fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            audio_ceiling: Duration::from_millis(self.audio_ceiling_ms),
            video_ceiling: Duration::from_millis(self.video_ceiling_ms),
        }
    }

    pub fn commit_settings(&self) -> CommitSettings {
        CommitSettings {
            game_nb: self.game_nb,
            layout: self.metadata_layout,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<TestSettings>,
}

impl SettingsStore {
    /// Loads settings from `path`. A missing file means defaults; an
    /// unreadable one is logged and replaced by defaults on the next write.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed settings at {}: {err}", path.display());
                TestSettings::default()
            })
        } else {
            TestSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn get(&self) -> TestSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, settings: TestSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &TestSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_observed_protocol() {
        let settings = TestSettings::default();
        assert_eq!(settings.circle_count, 6);
        assert_eq!(settings.sequence_length, 10);
        assert_eq!(settings.max_duration_ms, 60_000);
        assert_eq!(settings.activation_window_ms, 1500);
        assert_eq!(settings.game_nb, 23);
        assert_eq!(settings.audio_ceiling_ms, 60_000);
        assert_eq!(settings.video_ceiling_ms, 120_000);
        assert_eq!(settings.camera.quality, "1080p");
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        let mut settings = store.get();
        settings.generation = GenerationPolicy::Permutation;
        settings.activation_window_ms = 1000;
        store.update(settings.clone()).unwrap();

        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(reloaded.get(), settings);
        assert_eq!(
            reloaded.get().test_config().activation_window,
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn partial_or_malformed_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();

        let partial = dir.path().join("partial.json");
        fs::write(&partial, r#"{ "game_nb": 7 }"#).unwrap();
        let store = SettingsStore::new(partial).unwrap();
        assert_eq!(store.get().game_nb, 7);
        assert_eq!(store.get().circle_count, 6);

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "not json").unwrap();
        assert_eq!(
            SettingsStore::new(broken).unwrap().get(),
            TestSettings::default()
        );
    }
}
