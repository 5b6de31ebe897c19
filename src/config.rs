//! Application configuration
//!
//! Paths, external toolkit locations, timeouts and training defaults.
//! Defaults live under the platform data directory; environment variables and
//! an optional JSON file can override them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR_NAME: &str = "voice-studio";

// ============================================================================
// Configuration Types
// ============================================================================

/// Pretrained weights the preprocessing and training steps start from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainedModels {
    pub bert: PathBuf,
    pub ssl: PathBuf,
    pub s1: PathBuf,
    pub s2_generator: PathBuf,
    pub s2_discriminator: PathBuf,
    pub s2_config: PathBuf,
}

impl PretrainedModels {
    /// Standard v2 locations inside a toolkit checkout
    pub fn for_root(root: &Path) -> Self {
        let pretrained = root.join("GPT_SoVITS").join("pretrained_models");
        let v2 = pretrained.join("gsv-v2final-pretrained");
        Self {
            bert: pretrained.join("chinese-roberta-wwm-ext-large"),
            ssl: pretrained.join("chinese-hubert-base"),
            s1: v2.join("s1bert25hz-5kh-longer-epoch=12-step=369668.ckpt"),
            s2_generator: v2.join("s2G2333k.pth"),
            s2_discriminator: v2.join("s2D2333k.pth"),
            s2_config: root.join("GPT_SoVITS").join("configs").join("s2.json"),
        }
    }
}

impl Default for PretrainedModels {
    fn default() -> Self {
        Self::for_root(&default_sovits_root())
    }
}

/// Location and invocation details of the external GPT-SoVITS toolkit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SovitsConfig {
    /// Toolkit checkout root
    pub root: PathBuf,
    /// Interpreter used to run every toolkit script
    pub python_exec: PathBuf,
    pub pretrained: PretrainedModels,
    /// Environment variable receiving the extra search paths
    pub search_path_var: String,
    pub is_half: bool,
    pub gpu_numbers: String,
    /// Language tag written into the transcript manifest
    pub language: String,
    /// Optional transcription script (faster-whisper style `-i/-o/-l` CLI)
    pub asr_script: Option<PathBuf>,
    /// Optional checkpoint-to-weight converter script
    pub converter_script: Option<PathBuf>,
}

impl SovitsConfig {
    pub fn for_root(root: PathBuf) -> Self {
        Self {
            pretrained: PretrainedModels::for_root(&root),
            root,
            ..Self::default()
        }
    }

    pub fn module_dir(&self) -> PathBuf {
        self.root.join("GPT_SoVITS")
    }

    pub fn prepare_script(&self, name: &str) -> PathBuf {
        self.module_dir().join("prepare_datasets").join(name)
    }

    pub fn config_template(&self, name: &str) -> PathBuf {
        self.module_dir().join("configs").join(name)
    }

    /// Search paths prepended for every toolkit process
    pub fn search_paths(&self) -> Vec<PathBuf> {
        vec![self.module_dir(), self.root.clone()]
    }
}

impl Default for SovitsConfig {
    fn default() -> Self {
        let root = default_sovits_root();
        Self {
            pretrained: PretrainedModels::for_root(&root),
            root,
            python_exec: find_python(),
            search_path_var: "PYTHONPATH".to_string(),
            is_half: true,
            gpu_numbers: "0".to_string(),
            language: "zh".to_string(),
            asr_script: None,
            converter_script: None,
        }
    }
}

/// Per-stage time limits, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub preprocess_secs: u64,
    pub transcription_secs: u64,
    pub training_secs: u64,
    pub conversion_secs: u64,
}

impl TimeoutConfig {
    pub fn preprocess(&self) -> Duration {
        Duration::from_secs(self.preprocess_secs)
    }

    pub fn transcription(&self) -> Duration {
        Duration::from_secs(self.transcription_secs)
    }

    pub fn training(&self) -> Duration {
        Duration::from_secs(self.training_secs)
    }

    pub fn conversion(&self) -> Duration {
        Duration::from_secs(self.conversion_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            preprocess_secs: 30 * 60,
            transcription_secs: 30 * 60,
            training_secs: 6 * 60 * 60,
            conversion_secs: 10 * 60,
        }
    }
}

/// Fewest usable samples any training run accepts, whatever the config says
pub const MIN_TRAINING_SAMPLES: usize = 3;

/// Defaults applied when a training request leaves values out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingDefaults {
    pub stage1_epochs: u32,
    pub batch_size: u32,
    pub stage1_save_every: u32,
    pub stage2_save_every: u32,
    pub min_samples: usize,
}

impl Default for TrainingDefaults {
    fn default() -> Self {
        Self {
            stage1_epochs: 8,
            batch_size: 4,
            stage1_save_every: 5,
            stage2_save_every: 4,
            min_samples: MIN_TRAINING_SAMPLES,
        }
    }
}

impl TrainingDefaults {
    /// Configured sample minimum, never below `MIN_TRAINING_SAMPLES`
    pub fn required_samples(&self) -> usize {
        self.min_samples.max(MIN_TRAINING_SAMPLES)
    }
}

/// Inference service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Pause after hot-swapping weights before the first request
    pub weights_settle_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:9880".to_string(),
            request_timeout_secs: 60,
            health_timeout_secs: 2,
            weights_settle_ms: 2000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub sovits: SovitsConfig,
    pub timeouts: TimeoutConfig,
    pub training: TrainingDefaults,
    pub inference: InferenceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME),
            sovits: SovitsConfig::default(),
            timeouts: TimeoutConfig::default(),
            training: TrainingDefaults::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Default configuration rooted at a specific data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file; absent fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("VOICE_STUDIO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("SOVITS_PATH") {
            let python = config.sovits.python_exec.clone();
            config.sovits = SovitsConfig::for_root(PathBuf::from(root));
            config.sovits.python_exec = python;
        }
        if let Ok(python) = std::env::var("SOVITS_PYTHON") {
            config.sovits.python_exec = PathBuf::from(python);
        }
        if let Ok(url) = std::env::var("SOVITS_API_URL") {
            config.inference.api_url = url;
        }
        if let Ok(script) = std::env::var("SOVITS_ASR_SCRIPT") {
            config.sovits.asr_script = Some(PathBuf::from(script));
        }
        if let Ok(script) = std::env::var("SOVITS_CONVERTER_SCRIPT") {
            config.sovits.converter_script = Some(PathBuf::from(script));
        }
        if let Some(secs) = std::env::var("VOICE_STUDIO_TRAINING_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeouts.training_secs = secs;
        }

        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("speakers.db")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn training_data_dir(&self) -> PathBuf {
        self.data_dir.join("training_data")
    }

    pub fn trained_models_dir(&self) -> PathBuf {
        self.data_dir.join("trained_speakers")
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.data_dir.join("training_experiments")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }

    /// Create every directory the service writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.uploads_dir(),
            self.training_data_dir(),
            self.trained_models_dir(),
            self.experiments_dir(),
            self.outputs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_sovits_root() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("GPT-SoVITS-main")
}

/// Locate a Python interpreter on PATH
fn find_python() -> PathBuf {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .unwrap_or_else(|_| PathBuf::from("python3"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_derived_directories() {
        let config = AppConfig::with_data_dir("/srv/voices");
        assert_eq!(config.database_path(), PathBuf::from("/srv/voices/speakers.db"));
        assert_eq!(
            config.experiments_dir(),
            PathBuf::from("/srv/voices/training_experiments")
        );
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/tmp/voices", "training": {"stage1_epochs": 12}}"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/voices"));
        assert_eq!(config.training.stage1_epochs, 12);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.inference.api_url, "http://127.0.0.1:9880");
    }

    #[test]
    fn test_required_samples_has_floor() {
        let mut training = TrainingDefaults::default();
        assert_eq!(training.required_samples(), 3);

        training.min_samples = 1;
        assert_eq!(training.required_samples(), MIN_TRAINING_SAMPLES);
        training.min_samples = 0;
        assert_eq!(training.required_samples(), MIN_TRAINING_SAMPLES);
        training.min_samples = 10;
        assert_eq!(training.required_samples(), 10);
    }

    #[test]
    fn test_toolkit_paths() {
        let sovits = SovitsConfig::for_root(PathBuf::from("/opt/sovits"));
        assert_eq!(
            sovits.prepare_script("1-get-text.py"),
            PathBuf::from("/opt/sovits/GPT_SoVITS/prepare_datasets/1-get-text.py")
        );
        assert_eq!(
            sovits.pretrained.s2_config,
            PathBuf::from("/opt/sovits/GPT_SoVITS/configs/s2.json")
        );
        assert_eq!(sovits.search_paths()[0], PathBuf::from("/opt/sovits/GPT_SoVITS"));
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempdir().unwrap();
        let config = AppConfig::with_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        assert!(config.outputs_dir().is_dir());
        assert!(config.training_data_dir().is_dir());
    }
}
