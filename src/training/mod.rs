// Speaker training pipeline
// Stages samples, drives the external toolkit step by step and records the result

pub mod artifacts;
pub mod config_files;
pub mod layout;
pub mod manifest;
pub mod orchestrator;
pub mod postcondition;
pub mod runner;
pub mod status;
pub mod transcription;
pub mod types;

pub use layout::ExperimentDirectory;
pub use orchestrator::{
    parse_epoch, StagedSample, TrainingHandle, TrainingOrchestrator, PLACEHOLDER_TRANSCRIPT,
};
pub use runner::{run_stage, StageCommand, StageOutput};
pub use status::{TrainingJob, TrainingStatusTracker};
pub use transcription::{ProcessTranscriber, Transcriber};
pub use types::{
    PipelineStage, TrainingFailure, TrainingOutcome, TrainingRequest, TranscriptOrigin,
};
