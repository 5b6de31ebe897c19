// Training pipeline types
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::VoiceError;

/// Stages of a training run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    DataPrep,
    Preprocessing,
    Stage1Gpt,
    Stage2Sovits,
    Finalize,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::DataPrep => "data_prep",
            PipelineStage::Preprocessing => "preprocessing",
            PipelineStage::Stage1Gpt => "stage1_gpt",
            PipelineStage::Stage2Sovits => "stage2_sovits",
            PipelineStage::Finalize => "finalize",
        }
    }

    /// Progress percentage band covered by this stage
    pub fn progress_range(&self) -> (u8, u8) {
        match self {
            PipelineStage::DataPrep => (5, 10),
            PipelineStage::Preprocessing => (10, 30),
            PipelineStage::Stage1Gpt => (30, 65),
            PipelineStage::Stage2Sovits => (65, 95),
            PipelineStage::Finalize => (95, 100),
        }
    }

    /// Progress after `done` of `total` units of work inside this stage
    pub fn progress_at(&self, done: u32, total: u32) -> u8 {
        let (start, end) = self.progress_range();
        if total == 0 {
            return start;
        }
        let fraction = done.min(total) as f64 / total as f64;
        start + ((end - start) as f64 * fraction).floor() as u8
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the transcript manifest text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptOrigin {
    Provided,
    Transcribed,
    Placeholder,
}

/// Hyperparameters for one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub speaker: String,
    pub stage1_epochs: u32,
    pub stage2_epochs: u32,
    pub batch_size: u32,
    /// Transcripts keyed by sample file name
    pub transcripts: Option<std::collections::HashMap<String, String>>,
}

impl TrainingRequest {
    /// Stage-2 epochs derived from stage 1 when not given explicitly
    pub fn default_stage2_epochs(stage1_epochs: u32) -> u32 {
        ((stage1_epochs as f64 * 0.67).floor() as u32).max(8)
    }

    pub fn new(speaker: impl Into<String>, stage1_epochs: u32, batch_size: u32) -> Self {
        Self {
            speaker: speaker.into(),
            stage1_epochs,
            stage2_epochs: Self::default_stage2_epochs(stage1_epochs),
            batch_size,
            transcripts: None,
        }
    }

    pub fn with_stage2_epochs(mut self, epochs: u32) -> Self {
        self.stage2_epochs = epochs;
        self
    }

    pub fn with_transcripts(mut self, transcripts: std::collections::HashMap<String, String>) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    pub fn total_epochs(&self) -> u32 {
        self.stage1_epochs + self.stage2_epochs
    }
}

/// Result of a successful training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub gpt_model_path: String,
    pub sovits_model_path: String,
    pub exp_dir: String,
    pub model_dir: String,
    pub sample_count: usize,
    pub stage1_epochs: u32,
    pub stage2_epochs: u32,
    pub transcript_origin: TranscriptOrigin,
    /// Degraded-but-continued conditions hit during the run
    pub warnings: Vec<String>,
}

/// A failed run: the stage that failed and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingFailure {
    pub stage: PipelineStage,
    pub error: VoiceError,
}

impl TrainingFailure {
    pub fn new(stage: PipelineStage, error: VoiceError) -> Self {
        Self { stage, error }
    }
}

impl fmt::Display for TrainingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Training failed during {}: {}", self.stage, self.error)
    }
}

impl std::error::Error for TrainingFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage2_epoch_default() {
        assert_eq!(TrainingRequest::default_stage2_epochs(8), 8);
        assert_eq!(TrainingRequest::default_stage2_epochs(15), 10);
        assert_eq!(TrainingRequest::default_stage2_epochs(30), 20);
    }

    #[test]
    fn test_progress_within_stage() {
        assert_eq!(PipelineStage::Stage1Gpt.progress_at(0, 8), 30);
        assert_eq!(PipelineStage::Stage1Gpt.progress_at(4, 8), 47);
        assert_eq!(PipelineStage::Stage1Gpt.progress_at(8, 8), 65);
        assert_eq!(PipelineStage::Stage2Sovits.progress_at(20, 8), 95);
    }

    #[test]
    fn test_failure_names_stage() {
        let failure = TrainingFailure::new(
            PipelineStage::Stage1Gpt,
            VoiceError::NoArtifactProduced {
                stage: "stage1_gpt".to_string(),
                searched: "/exp/logs_s1".to_string(),
            },
        );
        assert!(failure.to_string().contains("during stage1_gpt"));
    }
}
