//! Transcription collaborator
//!
//! Produces text for staged clips that arrived without a transcript. The
//! default implementation runs an external ASR script that writes a `.list`
//! manifest (`path|speaker|LANG|text`) into the output directory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::artifacts;
use super::manifest;
use super::runner::{path_arg, run_stage, StageCommand};
use crate::config::SovitsConfig;
use crate::error::{VoiceError, VoiceResult};

/// Source of transcripts for a directory of clips
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe every clip in `input_dir`; returns text keyed by file name
    async fn transcribe(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        language: &str,
    ) -> VoiceResult<HashMap<String, String>>;
}

/// Runs the toolkit's ASR script as a subprocess
pub struct ProcessTranscriber {
    python: PathBuf,
    script: PathBuf,
    working_dir: PathBuf,
    search_path_var: String,
    search_paths: Vec<PathBuf>,
    timeout: Duration,
}

impl ProcessTranscriber {
    pub fn new(python: PathBuf, script: PathBuf, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            python,
            script,
            working_dir,
            search_path_var: "PYTHONPATH".to_string(),
            search_paths: Vec::new(),
            timeout,
        }
    }

    /// Transcriber from toolkit settings, when an ASR script is configured
    pub fn from_config(sovits: &SovitsConfig, timeout: Duration) -> Option<Self> {
        let script = sovits.asr_script.clone()?;
        let mut transcriber =
            Self::new(sovits.python_exec.clone(), script, sovits.root.clone(), timeout);
        transcriber.search_path_var = sovits.search_path_var.clone();
        transcriber.search_paths = sovits.search_paths();
        Some(transcriber)
    }
}

#[async_trait]
impl Transcriber for ProcessTranscriber {
    async fn transcribe(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        language: &str,
    ) -> VoiceResult<HashMap<String, String>> {
        let command = StageCommand::new("transcription", &self.python)
            .arg(path_arg(&self.script))
            .arg("-i")
            .arg(path_arg(input_dir))
            .arg("-o")
            .arg(path_arg(output_dir))
            .arg("-l")
            .arg(language)
            .working_dir(&self.working_dir)
            .search_paths(&self.search_path_var, self.search_paths.clone())
            .timeout(self.timeout);
        run_stage(command).await?;

        let list_file = artifacts::newest_with_extension(output_dir, "list").ok_or_else(|| {
            VoiceError::NoArtifactProduced {
                stage: "transcription".to_string(),
                searched: output_dir.display().to_string(),
            }
        })?;

        let entries = manifest::read_manifest(&list_file)?;
        let transcripts: HashMap<String, String> = entries
            .into_iter()
            .filter(|e| !e.text.is_empty())
            .map(|e| (e.file_name(), e.text))
            .collect();

        log::info!(
            "Transcribed {} clips from {}",
            transcripts.len(),
            list_file.display()
        );
        Ok(transcripts)
    }
}
