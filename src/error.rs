//! Error types for speaker storage, training and synthesis
//!
//! One enum covers every failure the pipeline can report. Variants carry enough
//! detail for a caller to explain the failure without reading logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error types for voice operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum VoiceError {
    /// Fewer samples than training requires
    InsufficientSamples {
        speaker: String,
        found: usize,
        required: usize,
    },
    /// No sample falls inside the reference duration window
    NoEligibleReference { durations: Vec<f64> },
    /// Intermediate artifacts disagree on how many utterances exist
    DataConsistencyError {
        stage: String,
        expected: usize,
        actual: usize,
        delta: usize,
        missing: Vec<String>,
        detail: Option<String>,
    },
    /// A stage process could not be started at all
    StageLaunchError { stage: String, message: String },
    /// A stage process ran and failed (nonzero exit or timeout)
    StageExecutionError {
        stage: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// A stage finished but left no usable artifact behind
    NoArtifactProduced { stage: String, searched: String },
    /// Required inputs for a stage are missing
    PreconditionError(String),
    /// Speaker cannot be used for synthesis yet
    NotReady(String),
    /// Speaker (or sample) does not exist
    NotFound(String),
    /// A training job for this speaker is already running
    AlreadyTraining(String),
    /// Malformed request parameters
    InvalidInput(String),
    /// The inference service answered with an error
    InferenceFailed(String),
    /// Metadata persistence failed
    Storage(String),
    /// Filesystem operation failed
    Io(String),
}

impl VoiceError {
    pub fn io(context: impl fmt::Display, err: std::io::Error) -> Self {
        VoiceError::Io(format!("{}: {}", context, err))
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        VoiceError::PreconditionError(msg.into())
    }

    /// Short machine-friendly name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::InsufficientSamples { .. } => "insufficient_samples",
            VoiceError::NoEligibleReference { .. } => "no_eligible_reference",
            VoiceError::DataConsistencyError { .. } => "data_consistency_error",
            VoiceError::StageLaunchError { .. } => "stage_launch_error",
            VoiceError::StageExecutionError { .. } => "stage_execution_error",
            VoiceError::NoArtifactProduced { .. } => "no_artifact_produced",
            VoiceError::PreconditionError(_) => "precondition_error",
            VoiceError::NotReady(_) => "not_ready",
            VoiceError::NotFound(_) => "not_found",
            VoiceError::AlreadyTraining(_) => "already_training",
            VoiceError::InvalidInput(_) => "invalid_input",
            VoiceError::InferenceFailed(_) => "inference_failed",
            VoiceError::Storage(_) => "storage",
            VoiceError::Io(_) => "io",
        }
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::InsufficientSamples {
                speaker,
                found,
                required,
            } => write!(
                f,
                "Speaker '{}' has {} samples, training needs at least {}",
                speaker, found, required
            ),
            VoiceError::NoEligibleReference { durations } => {
                let listed: Vec<String> = durations.iter().map(|d| format!("{:.1}s", d)).collect();
                write!(
                    f,
                    "No sample is between 3 and 10 seconds long (durations: {})",
                    listed.join(", ")
                )
            }
            VoiceError::DataConsistencyError {
                stage,
                expected,
                actual,
                delta,
                missing,
                detail,
            } => {
                write!(
                    f,
                    "Data mismatch in {}: expected {} rows, found {} (delta {})",
                    stage, expected, actual, delta
                )?;
                if !missing.is_empty() {
                    write!(f, "; missing: {}", missing.join(", "))?;
                }
                if let Some(detail) = detail {
                    write!(f, "; {}", detail)?;
                }
                Ok(())
            }
            VoiceError::StageLaunchError { stage, message } => {
                write!(f, "Stage {} could not start: {}", stage, message)
            }
            VoiceError::StageExecutionError {
                stage,
                exit_code,
                stderr,
            } => match exit_code {
                Some(code) => write!(f, "Stage {} exited with code {}: {}", stage, code, stderr),
                None => write!(f, "Stage {} failed: {}", stage, stderr),
            },
            VoiceError::NoArtifactProduced { stage, searched } => {
                write!(f, "Stage {} produced no artifact in {}", stage, searched)
            }
            VoiceError::PreconditionError(msg) => write!(f, "Precondition failed: {}", msg),
            VoiceError::NotReady(msg) => write!(f, "Not ready: {}", msg),
            VoiceError::NotFound(msg) => write!(f, "Not found: {}", msg),
            VoiceError::AlreadyTraining(speaker) => {
                write!(f, "Speaker '{}' is already training", speaker)
            }
            VoiceError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            VoiceError::InferenceFailed(msg) => write!(f, "Inference failed: {}", msg),
            VoiceError::Storage(msg) => write!(f, "Storage error: {}", msg),
            VoiceError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

impl From<anyhow::Error> for VoiceError {
    fn from(err: anyhow::Error) -> Self {
        VoiceError::Storage(format!("{:#}", err))
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
