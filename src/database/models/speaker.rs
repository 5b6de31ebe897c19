// Database models - Speakers, audio samples and trained model records
use serde::{Deserialize, Serialize};

/// Method tag recorded for models produced by the two-stage pipeline
pub const METHOD_GPT_SOVITS_TRAINED: &str = "gpt_sovits_trained";

/// A reference clip belonging to one speaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioSample {
    /// Position in the speaker's upload order (0-based)
    pub index: usize,
    /// Copy owned by the speaker's sample directory
    pub storage_path: String,
    /// Path the upload handler originally wrote
    pub original_path: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub uploaded_at: String,
    pub transcript: Option<String>,
}

/// Sample metadata supplied by the upload handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSample {
    pub storage_path: String,
    pub original_path: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub transcript: Option<String>,
}

/// Artifacts of a completed training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub method: String,
    pub gpt_model_path: String,
    pub sovits_model_path: String,
    pub exp_dir: String,
    pub model_dir: String,
    pub sample_count: usize,
    pub stage1_epochs: u32,
    pub stage2_epochs: u32,
    pub trained_at: String,
}

impl ModelInfo {
    /// Both stage artifacts are recorded
    pub fn has_model_pair(&self) -> bool {
        !self.gpt_model_path.is_empty() && !self.sovits_model_path.is_empty()
    }
}

/// A named voice identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    pub samples: Vec<AudioSample>,
    pub trained: bool,
    pub created_at: String,
    pub trained_at: Option<String>,
    pub model_info: Option<ModelInfo>,
}

impl Speaker {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Trained model pair, when the speaker has one
    pub fn model_pair(&self) -> Option<(&str, &str)> {
        match &self.model_info {
            Some(info) if self.trained && info.has_model_pair() => {
                Some((info.gpt_model_path.as_str(), info.sovits_model_path.as_str()))
            }
            _ => None,
        }
    }
}

/// Listing entry for a speaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakerSummary {
    pub name: String,
    pub audio_count: usize,
    pub trained: bool,
    pub created_at: String,
    pub trained_at: Option<String>,
    pub model_path: Option<String>,
}
