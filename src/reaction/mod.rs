pub mod controller;
pub mod recorder;
pub mod session;
pub mod state;

pub use controller::{
    EngineError, EngineEvent, ReactionTestConfig, ReactionTestController, TestSnapshot,
};
pub use recorder::{ReactionRecorder, ReactionSample, MISS_SENTINEL};
pub use session::{AbortReason, CaptureOutcome, TestSession};
pub use state::{ActiveStimulus, RunEvent, StimulusRun, TestPhase};
