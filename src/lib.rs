pub mod auth;
pub mod capture;
pub mod db;
pub mod reaction;
pub mod sequence;
pub mod settings;
pub mod upload;
pub mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use auth::StaticAuth;
use capture::{CaptureSessionManager, SimulatedDriver};
use db::Database;
use reaction::{EngineEvent, ReactionTestController, TestPhase};
use settings::SettingsStore;
use upload::{CommitPipeline, LocalBlobStore};

const DATA_DIR_ENV: &str = "REACTEST_DATA_DIR";
const USER_ENV: &str = "REACTEST_USER";
const DEBUG_ENV: &str = "REACTEST_DEBUG";

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.data_dir().join("reactest"))
        .unwrap_or_else(|| PathBuf::from(".reactest"))
}

/// Taps each activated stimulus after a human-ish delay. Some delays run
/// past the activation window and become misses.
fn spawn_responder(controller: &ReactionTestController) -> JoinHandle<()> {
    let controller = controller.clone();
    let mut events = controller.subscribe();
    let mut rng = StdRng::from_entropy();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::StimulusActivated { stimulus }) => {
                    let delay = Duration::from_millis(rng.gen_range(180..1800));
                    let controller = controller.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        controller.acknowledge(stimulus.stimulus_id).await;
                    });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Responder skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Headless entry point: runs one simulated reaction test end to end and
/// commits it to a local blob directory and the SQLite record store.
pub async fn run() -> Result<()> {
    let level = if env_flag(DEBUG_ENV) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    info!("reactest starting up...");

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let settings = SettingsStore::new(data_dir.join("settings.json"))?.get();
    let database = Database::new(data_dir.join("reactest.sqlite3"))?;
    info!("Session store at {}", database.path().display());

    let user_id = std::env::var(USER_ENV).unwrap_or_else(|_| "headless".to_string());
    let auth = Arc::new(StaticAuth::signed_in(user_id));

    let driver = Arc::new(SimulatedDriver::new(data_dir.join("captures")));
    let capture = CaptureSessionManager::new(driver, settings.capture_limits());
    let pipeline = CommitPipeline::new(
        Arc::new(LocalBlobStore::new(data_dir.join("blobs"))),
        Arc::new(database.clone()),
        auth.clone(),
        settings.commit_settings(),
    );
    let controller =
        ReactionTestController::new(capture, auth, pipeline, settings.test_config())
            .with_journal(database.clone());

    // Sessions that completed but never reached storage on a previous run.
    for session in controller.pending_sessions().await? {
        warn!(
            "Recovered uncommitted session from {}; committing",
            session.started_at
        );
        controller.restore_completed(session).await?;
        let receipt = controller
            .commit()
            .await
            .context("re-commit of journaled session failed")?;
        info!("Recovered session stored at {}", receipt.metadata_path);
    }

    let permissions = controller.capture().ensure_permissions().await;
    if !permissions.all_granted() {
        bail!("capture permissions missing: {permissions:?}");
    }

    let mut events = controller.subscribe();
    let responder = spawn_responder(&controller);

    let snapshot = controller.start_test().await?;
    info!("Running {} stimuli", snapshot.total);

    let phase = loop {
        match events.recv().await {
            Ok(EngineEvent::PhaseChanged { phase }) if phase.is_terminal() => break phase,
            Ok(EngineEvent::StimulusResolved { sample }) => {
                info!(
                    "#{} circle {}: {}",
                    sample.index,
                    sample.stimulus_id,
                    sample
                        .latency_ms
                        .map(|ms| format!("{ms}ms"))
                        .unwrap_or_else(|| "miss".to_string())
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} engine events"),
            Err(RecvError::Closed) => bail!("engine event stream closed mid-test"),
        }
    };
    responder.abort();

    if phase == TestPhase::Aborted {
        let snapshot = controller.snapshot().await;
        bail!("test aborted: {:?}", snapshot.abort_reason);
    }

    let receipt = controller.commit().await?;
    info!(
        "Committed {} at {}: {}",
        receipt.session_id,
        receipt.metadata_path,
        serde_json::to_string(&receipt.record)?
    );

    let history = database.list_records("reaction-test/").await?;
    info!("{} sessions stored", history.len());

    Ok(())
}
