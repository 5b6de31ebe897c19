//! Training orchestrator
//!
//! Runs one speaker through data staging, the three preprocessing steps,
//! stage-1 (GPT) and stage-2 (SoVITS) training, strictly in that order. Each
//! step's outputs are checked before the next step starts. A failure aborts
//! the run with the stage that failed, leaves the speaker untrained and keeps
//! the experiment directory for inspection until the next attempt purges it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::artifacts;
use super::config_files::{self, Stage1Settings, Stage2Settings};
use super::layout::ExperimentDirectory;
use super::manifest::{self, TranscriptEntry};
use super::postcondition::StagePostcondition;
use super::runner::{path_arg, run_stage, StageCommand, StageOutput};
use super::status::TrainingStatusTracker;
use super::transcription::{ProcessTranscriber, Transcriber};
use super::types::{
    PipelineStage, TrainingFailure, TrainingOutcome, TrainingRequest, TranscriptOrigin,
};
use crate::config::AppConfig;
use crate::database::{AudioSample, ModelInfo, Speaker, METHOD_GPT_SOVITS_TRAINED};
use crate::error::{VoiceError, VoiceResult};
use crate::speakers::SpeakerStore;

/// Written for clips that have no transcript at all
pub const PLACEHOLDER_TRANSCRIPT: &str = "这是一段训练语音。";

static EPOCH_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bepoch[\s:=]+(\d+)").expect("Invalid regex"));

/// Lines of step output included in diagnostics
const DIAGNOSTIC_TAIL: usize = 20;

/// Parse an epoch number from a trainer output line
pub fn parse_epoch(line: &str) -> Option<u32> {
    EPOCH_LINE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One sample copied into the experiment directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedSample {
    pub sample_index: usize,
    pub source_path: String,
    pub staged_name: String,
    pub staged_path: String,
    #[serde(skip)]
    pub transcript: Option<String>,
}

impl StagedSample {
    fn source_name(&self) -> String {
        manifest::file_name_of(&self.source_path)
    }
}

/// Handle to a background training task
pub struct TrainingHandle {
    speaker: String,
    task: JoinHandle<Result<TrainingOutcome, TrainingFailure>>,
}

impl TrainingHandle {
    pub fn speaker(&self) -> &str {
        &self.speaker
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> Result<TrainingOutcome, TrainingFailure> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TrainingFailure::new(
                PipelineStage::Finalize,
                VoiceError::Storage(format!("training task ended abnormally: {}", e)),
            )),
        }
    }
}

pub struct TrainingOrchestrator {
    config: Arc<AppConfig>,
    store: Arc<SpeakerStore>,
    tracker: Arc<TrainingStatusTracker>,
    transcriber: Option<Arc<dyn Transcriber>>,
}

impl TrainingOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<SpeakerStore>,
        tracker: Arc<TrainingStatusTracker>,
    ) -> Self {
        let transcriber = ProcessTranscriber::from_config(
            &config.sovits,
            config.timeouts.transcription(),
        )
        .map(|t| Arc::new(t) as Arc<dyn Transcriber>);

        Self {
            config,
            store,
            tracker,
            transcriber,
        }
    }

    pub fn with_transcriber(mut self, transcriber: Option<Arc<dyn Transcriber>>) -> Self {
        self.transcriber = transcriber;
        self
    }

    pub fn tracker(&self) -> &Arc<TrainingStatusTracker> {
        &self.tracker
    }

    /// Request defaults for a speaker: configured epochs and batch size
    pub fn default_request(&self, speaker: &str) -> TrainingRequest {
        TrainingRequest::new(
            speaker,
            self.config.training.stage1_epochs,
            self.config.training.batch_size,
        )
    }

    /// Check a request against the stored speaker
    fn validate(&self, request: &TrainingRequest) -> VoiceResult<Speaker> {
        if request.stage1_epochs == 0 || request.stage2_epochs == 0 || request.batch_size == 0 {
            return Err(VoiceError::InvalidInput(
                "epochs and batch size must be positive".to_string(),
            ));
        }

        let speaker = self.store.get(&request.speaker)?;
        let required = self.config.training.required_samples();
        if speaker.samples.len() < required {
            return Err(VoiceError::InsufficientSamples {
                speaker: speaker.name.clone(),
                found: speaker.samples.len(),
                required,
            });
        }
        Ok(speaker)
    }

    /// Claim the speaker's job slot, then validate against the store.
    /// A failed check hands the slot back in its previous state.
    fn claim(&self, request: &TrainingRequest) -> VoiceResult<Speaker> {
        let previous = self
            .tracker
            .try_begin(&request.speaker, request.total_epochs())?;
        self.validate(request).map_err(|e| {
            self.tracker.restore(&request.speaker, previous);
            e
        })
    }

    /// Claim, validate and run in the background
    pub fn spawn_training(self: &Arc<Self>, request: TrainingRequest) -> VoiceResult<TrainingHandle> {
        let speaker = self.claim(&request)?;

        let name = request.speaker.clone();
        let orchestrator = Arc::clone(self);
        let inner = tokio::spawn(async move { orchestrator.run_claimed(request, speaker).await });

        // Outer task: a panic inside the run still ends the job as failed
        let tracker = Arc::clone(&self.tracker);
        let speaker = name.clone();
        let task = tokio::spawn(async move {
            match inner.await {
                Ok(result) => result,
                Err(e) => {
                    let failure = TrainingFailure::new(
                        PipelineStage::Finalize,
                        VoiceError::Storage(format!("training task ended abnormally: {}", e)),
                    );
                    tracker.set_failed(&speaker, failure.clone());
                    Err(failure)
                }
            }
        });

        log::info!("Started background training for '{}'", name);
        Ok(TrainingHandle {
            speaker: name,
            task,
        })
    }

    /// Train a speaker in the current task
    pub async fn train_speaker(
        &self,
        request: TrainingRequest,
    ) -> Result<TrainingOutcome, TrainingFailure> {
        let speaker = self
            .claim(&request)
            .map_err(|e| TrainingFailure::new(PipelineStage::DataPrep, e))?;

        self.run_claimed(request, speaker).await
    }

    async fn run_claimed(
        &self,
        request: TrainingRequest,
        speaker: Speaker,
    ) -> Result<TrainingOutcome, TrainingFailure> {
        let name = request.speaker.clone();
        log::info!(
            "Training '{}': stage 1 {} epochs, stage 2 {} epochs, batch size {}",
            name,
            request.stage1_epochs,
            request.stage2_epochs,
            request.batch_size
        );

        match self.run_pipeline(&request, &speaker).await {
            Ok(outcome) => {
                log::info!("Training '{}' completed", name);
                self.tracker.set_completed(&name, outcome.clone());
                Ok(outcome)
            }
            Err(failure) => {
                log::error!("Training '{}' failed: {}", name, failure);
                self.tracker.set_failed(&name, failure.clone());
                Err(failure)
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &TrainingRequest,
        speaker: &Speaker,
    ) -> Result<TrainingOutcome, TrainingFailure> {
        let exp = ExperimentDirectory::new(&self.config.experiments_dir(), &speaker.name);
        let mut warnings = Vec::new();

        let at = |stage: PipelineStage| move |e: VoiceError| TrainingFailure::new(stage, e);

        self.enter(&speaker.name, PipelineStage::DataPrep);
        let (staged, origin) = self
            .prepare_data(&exp, speaker, request, &mut warnings)
            .await
            .map_err(at(PipelineStage::DataPrep))?;

        self.enter(&speaker.name, PipelineStage::Preprocessing);
        self.preprocess(&exp, &staged, &mut warnings)
            .await
            .map_err(at(PipelineStage::Preprocessing))?;

        self.enter(&speaker.name, PipelineStage::Stage1Gpt);
        let gpt_model = self
            .train_stage1(&exp, &staged, request)
            .await
            .map_err(at(PipelineStage::Stage1Gpt))?;

        self.enter(&speaker.name, PipelineStage::Stage2Sovits);
        let sovits_model = self
            .train_stage2(&exp, request, &mut warnings)
            .await
            .map_err(at(PipelineStage::Stage2Sovits))?;

        self.enter(&speaker.name, PipelineStage::Finalize);
        self.finalize(&exp, request, staged.len(), &gpt_model, &sovits_model, origin, warnings)
            .map_err(at(PipelineStage::Finalize))
    }

    fn enter(&self, speaker: &str, stage: PipelineStage) {
        log::info!("[{}] Entering stage {}", speaker, stage);
        self.tracker.set_stage(speaker, stage, stage.progress_range().0);
    }

    fn command(&self, stage: &str, script: &Path) -> StageCommand {
        let sovits = &self.config.sovits;
        StageCommand::new(stage, &sovits.python_exec)
            .arg(path_arg(script))
            .working_dir(&sovits.root)
            .search_paths(&sovits.search_path_var, sovits.search_paths())
            .env("PYTHONUNBUFFERED", "1")
    }

    fn require_script(stage: &str, script: &Path) -> VoiceResult<()> {
        if script.is_file() {
            Ok(())
        } else {
            Err(VoiceError::StageLaunchError {
                stage: stage.to_string(),
                message: format!("script {} does not exist", script.display()),
            })
        }
    }

    // ========================================================================
    // Data preparation
    // ========================================================================

    async fn prepare_data(
        &self,
        exp: &ExperimentDirectory,
        speaker: &Speaker,
        request: &TrainingRequest,
        warnings: &mut Vec<String>,
    ) -> VoiceResult<(Vec<StagedSample>, TranscriptOrigin)> {
        // Directory reset and sample copies are bulk filesystem work
        let (staged, staging_warnings) = {
            let exp = exp.clone();
            let samples = speaker.samples.clone();
            tokio::task::spawn_blocking(move || {
                exp.recreate()?;
                let mut warnings = Vec::new();
                let staged = stage_samples(&exp, &samples, &mut warnings)?;
                Ok::<_, VoiceError>((staged, warnings))
            })
            .await
            .map_err(|e| VoiceError::Storage(format!("staging task ended abnormally: {}", e)))??
        };
        warnings.extend(staging_warnings);

        let required = self.config.training.required_samples();
        if staged.len() < required {
            return Err(VoiceError::InsufficientSamples {
                speaker: speaker.name.clone(),
                found: staged.len(),
                required,
            });
        }

        let map_json = serde_json::to_string_pretty(&staged)
            .map_err(|e| VoiceError::Io(format!("serializing staging map: {}", e)))?;
        std::fs::write(exp.staging_map(), map_json)
            .map_err(|e| VoiceError::io("writing staging map", e))?;

        let (texts, origin) = self
            .resolve_transcripts(exp, &staged, request.transcripts.as_ref(), warnings)
            .await;

        let language = self.config.sovits.language.clone();
        let entries: Vec<TranscriptEntry> = staged
            .iter()
            .zip(texts)
            .map(|(sample, text)| TranscriptEntry {
                audio_path: sample.staged_path.clone(),
                speaker: speaker.name.clone(),
                language: language.clone(),
                text,
            })
            .collect();
        manifest::write_manifest(&exp.transcript_manifest(), &entries)?;

        self.tracker.set_stage(&speaker.name, PipelineStage::DataPrep, 8);
        log::info!(
            "Staged {} samples for '{}' (transcripts: {:?})",
            staged.len(),
            speaker.name,
            origin
        );
        Ok((staged, origin))
    }

    /// Text for every staged sample, in staging order
    async fn resolve_transcripts(
        &self,
        exp: &ExperimentDirectory,
        staged: &[StagedSample],
        supplied: Option<&HashMap<String, String>>,
        warnings: &mut Vec<String>,
    ) -> (Vec<String>, TranscriptOrigin) {
        let known: Vec<Option<String>> = staged
            .iter()
            .map(|s| {
                supplied
                    .and_then(|map| map.get(&s.source_name()).or_else(|| map.get(&s.staged_name)))
                    .cloned()
                    .or_else(|| s.transcript.clone())
                    .filter(|t| !t.trim().is_empty())
            })
            .collect();

        if known.iter().all(Option::is_some) {
            return (known.into_iter().flatten().collect(), TranscriptOrigin::Provided);
        }

        if supplied.is_some() {
            let missing: Vec<&str> = staged
                .iter()
                .zip(&known)
                .filter(|(_, t)| t.is_none())
                .map(|(s, _)| s.staged_name.as_str())
                .collect();
            let warning = format!(
                "No transcript supplied for {}; using placeholder text, training quality will suffer",
                missing.join(", ")
            );
            log::warn!("{}", warning);
            warnings.push(warning);
            return (fill_placeholders(known), TranscriptOrigin::Provided);
        }

        let transcribed = match &self.transcriber {
            Some(transcriber) => {
                match transcriber
                    .transcribe(&exp.input_wavs(), exp.root(), &self.config.sovits.language)
                    .await
                {
                    Ok(texts) => Some(texts),
                    Err(e) => {
                        log::warn!("Transcription failed: {}", e);
                        warnings.push(format!("Transcription failed: {}", e));
                        None
                    }
                }
            }
            None => None,
        };

        match transcribed {
            Some(texts) => {
                let merged: Vec<Option<String>> = staged
                    .iter()
                    .zip(known)
                    .map(|(s, t)| t.or_else(|| texts.get(&s.staged_name).cloned()))
                    .collect();
                let gaps = merged.iter().filter(|t| t.is_none()).count();
                if gaps > 0 {
                    let warning = format!(
                        "Transcription produced no text for {} clips; using placeholder text",
                        gaps
                    );
                    log::warn!("{}", warning);
                    warnings.push(warning);
                }
                (fill_placeholders(merged), TranscriptOrigin::Transcribed)
            }
            None => {
                let warning = "No transcripts available; wrote placeholder text for every clip. \
                               Training on placeholder text will not produce a usable voice"
                    .to_string();
                log::warn!("{}", warning);
                warnings.push(warning);
                (fill_placeholders(known), TranscriptOrigin::Placeholder)
            }
        }
    }

    // ========================================================================
    // Preprocessing
    // ========================================================================

    fn preprocess_env(&self, exp: &ExperimentDirectory) -> Vec<(String, String)> {
        let sovits = &self.config.sovits;
        let p = |path: &Path| path.to_string_lossy().into_owned();
        vec![
            ("inp_text".into(), p(&exp.transcript_manifest())),
            ("inp_wav_dir".into(), p(&exp.input_wavs())),
            ("exp_name".into(), exp.speaker().to_string()),
            ("opt_dir".into(), p(exp.root())),
            ("i_part".into(), "0".into()),
            ("all_parts".into(), "1".into()),
            ("bert_pretrained_dir".into(), p(&sovits.pretrained.bert)),
            ("cnhubert_base_dir".into(), p(&sovits.pretrained.ssl)),
            ("pretrained_s2G".into(), p(&sovits.pretrained.s2_generator)),
            ("s2config_path".into(), p(&sovits.pretrained.s2_config)),
            (
                "is_half".into(),
                if sovits.is_half { "True" } else { "False" }.into(),
            ),
            ("_CUDA_VISIBLE_DEVICES".into(), sovits.gpu_numbers.clone()),
        ]
    }

    async fn run_preprocess_step(
        &self,
        exp: &ExperimentDirectory,
        stage: &str,
        script_name: &str,
    ) -> VoiceResult<StageOutput> {
        let script = self.config.sovits.prepare_script(script_name);
        Self::require_script(stage, &script)?;

        let mut command = self
            .command(stage, &script)
            .timeout(self.config.timeouts.preprocess());
        for (key, value) in self.preprocess_env(exp) {
            command = command.env(key, value);
        }
        run_stage(command).await
    }

    async fn preprocess(
        &self,
        exp: &ExperimentDirectory,
        staged: &[StagedSample],
        warnings: &mut Vec<String>,
    ) -> VoiceResult<()> {
        exp.purge_intermediates()?;
        let speaker = exp.speaker();
        let names: Vec<String> = staged.iter().map(|s| s.staged_name.clone()).collect();

        // Step 1: text normalization and BERT features
        self.run_preprocess_step(exp, "preprocess_text", "1-get-text.py")
            .await?;
        StagePostcondition::new("preprocess_text")
            .file(exp.phoneme_table())
            .check()?;
        self.tracker.set_stage(
            speaker,
            PipelineStage::Preprocessing,
            PipelineStage::Preprocessing.progress_at(1, 3),
        );

        // Step 2: HuBERT features and 32k audio
        self.run_preprocess_step(exp, "preprocess_hubert", "2-get-hubert-wav32k.py")
            .await?;
        StagePostcondition::new("preprocess_hubert")
            .dir(exp.hubert_dir())
            .dir(exp.wav32k_dir())
            .check()?;
        let missing_features: Vec<&String> = names
            .iter()
            .filter(|n| !exp.hubert_dir().join(format!("{}.pt", n)).exists())
            .collect();
        if !missing_features.is_empty() {
            let shown: Vec<&str> = missing_features.iter().take(5).map(|s| s.as_str()).collect();
            let warning = format!(
                "{} clips have no HuBERT features (e.g. {})",
                missing_features.len(),
                shown.join(", ")
            );
            log::warn!("{}", warning);
            warnings.push(warning);
        }
        self.tracker.set_stage(
            speaker,
            PipelineStage::Preprocessing,
            PipelineStage::Preprocessing.progress_at(2, 3),
        );

        // Step 3: semantic tokens, one row per transcript entry
        let output = self
            .run_preprocess_step(exp, "preprocess_semantic", "3-get-semantic.py")
            .await?;
        let expected = manifest::read_manifest(&exp.transcript_manifest())?
            .iter()
            .map(TranscriptEntry::file_name)
            .collect::<Vec<_>>();
        StagePostcondition::new("preprocess_semantic")
            .rows(exp.semantic_table(), expected)
            .check()
            .map_err(|err| with_semantic_diagnostics(err, exp, &output))?;

        Ok(())
    }

    // ========================================================================
    // Stage 1 (GPT)
    // ========================================================================

    fn stage_epoch_callback(
        &self,
        speaker: &str,
        stage_epochs: u32,
    ) -> Arc<dyn Fn(&str) + Send + Sync> {
        let tracker = Arc::clone(&self.tracker);
        let speaker = speaker.to_string();
        Arc::new(move |line: &str| {
            if let Some(epoch) = parse_epoch(line) {
                tracker.set_epoch(&speaker, epoch, stage_epochs);
            }
        })
    }

    async fn train_stage1(
        &self,
        exp: &ExperimentDirectory,
        staged: &[StagedSample],
        request: &TrainingRequest,
    ) -> VoiceResult<PathBuf> {
        let stage = PipelineStage::Stage1Gpt.as_str();
        let sovits = &self.config.sovits;

        // Row counts must agree before the trainer sees the data
        let names: Vec<String> = staged.iter().map(|s| s.staged_name.clone()).collect();
        StagePostcondition::new(stage)
            .rows(exp.phoneme_table(), names.clone())
            .rows(exp.semantic_table(), names)
            .require()?;

        let script = sovits.module_dir().join("s1_train.py");
        Self::require_script(stage, &script)?;

        let logs = exp.stage1_logs();
        std::fs::create_dir_all(&logs)
            .map_err(|e| VoiceError::io(format!("creating {}", logs.display()), e))?;
        config_files::write_stage1_config(
            &sovits.config_template("s1longer-v2.yaml"),
            &exp.stage1_config(),
            &Stage1Settings {
                speaker: exp.speaker(),
                epochs: request.stage1_epochs,
                batch_size: request.batch_size,
                save_every: self.config.training.stage1_save_every,
                pretrained: &sovits.pretrained.s1,
                semantic_table: &exp.semantic_table(),
                phoneme_table: &exp.phoneme_table(),
                output_dir: &logs,
            },
        )?;

        let command = self
            .command(stage, &script)
            .arg("--config_file")
            .arg(path_arg(&exp.stage1_config()))
            .env("_CUDA_VISIBLE_DEVICES", sovits.gpu_numbers.clone())
            .env("hz", "25hz")
            .timeout(self.config.timeouts.training())
            .on_line(self.stage_epoch_callback(exp.speaker(), request.stage1_epochs));
        run_stage(command).await?;

        let checkpoint = artifacts::newest_with_extension(&logs, "ckpt").ok_or_else(|| {
            VoiceError::NoArtifactProduced {
                stage: stage.to_string(),
                searched: logs.display().to_string(),
            }
        })?;
        log::info!("Stage 1 checkpoint: {}", checkpoint.display());
        Ok(checkpoint)
    }

    // ========================================================================
    // Stage 2 (SoVITS)
    // ========================================================================

    async fn train_stage2(
        &self,
        exp: &ExperimentDirectory,
        request: &TrainingRequest,
        warnings: &mut Vec<String>,
    ) -> VoiceResult<PathBuf> {
        let stage = PipelineStage::Stage2Sovits.as_str();
        let sovits = &self.config.sovits;

        StagePostcondition::new(stage)
            .dir(exp.hubert_dir())
            .dir(exp.wav32k_dir())
            .file(exp.phoneme_table())
            .file(exp.semantic_table())
            .require()?;

        let script = sovits.module_dir().join("s2_train.py");
        Self::require_script(stage, &script)?;

        tokio::fs::copy(exp.phoneme_table(), exp.stage2_phoneme_table())
            .await
            .map_err(|e| VoiceError::io("copying phoneme table for stage 2", e))?;

        let logs = exp.stage2_logs();
        tokio::fs::create_dir_all(&logs)
            .await
            .map_err(|e| VoiceError::io(format!("creating {}", logs.display()), e))?;
        config_files::write_stage2_config(
            &sovits.pretrained.s2_config,
            &exp.stage2_config(),
            &Stage2Settings {
                speaker: exp.speaker(),
                epochs: request.stage2_epochs,
                batch_size: request.batch_size,
                save_every: self.config.training.stage2_save_every,
                gpu_numbers: &sovits.gpu_numbers,
                pretrained_generator: &sovits.pretrained.s2_generator,
                pretrained_discriminator: &sovits.pretrained.s2_discriminator,
                exp_dir: exp.root(),
                phoneme_table: &exp.stage2_phoneme_table(),
                wav_dir: &exp.wav32k_dir(),
                output_dir: &logs,
            },
        )?;

        let command = self
            .command(stage, &script)
            .arg("--config")
            .arg(path_arg(&exp.stage2_config()))
            .env("_CUDA_VISIBLE_DEVICES", sovits.gpu_numbers.clone())
            .timeout(self.config.timeouts.training())
            .on_line(self.stage_epoch_callback(exp.speaker(), request.stage2_epochs));
        run_stage(command).await?;

        self.resolve_stage2_artifact(exp, request, warnings).await
    }

    /// Exported weight, else a converted checkpoint, else the raw checkpoint
    async fn resolve_stage2_artifact(
        &self,
        exp: &ExperimentDirectory,
        request: &TrainingRequest,
        warnings: &mut Vec<String>,
    ) -> VoiceResult<PathBuf> {
        let logs = exp.stage2_logs();
        if let Some(weight) = artifacts::find_exported_weight(&logs, exp.speaker()) {
            log::info!("Stage 2 exported weight: {}", weight.display());
            return Ok(weight);
        }

        let checkpoint = artifacts::newest_generator_checkpoint(&logs).ok_or_else(|| {
            VoiceError::NoArtifactProduced {
                stage: PipelineStage::Stage2Sovits.as_str().to_string(),
                searched: logs.display().to_string(),
            }
        })?;

        let output = logs.join(format!("{}_e{}.pth", exp.speaker(), request.stage2_epochs));
        let failure = match self.convert_checkpoint(exp, &checkpoint, &output).await {
            Ok(()) if output.is_file() => {
                log::info!("Converted {} to {}", checkpoint.display(), output.display());
                return Ok(output);
            }
            Ok(()) => format!("converter left no file at {}", output.display()),
            Err(e) => e.to_string(),
        };

        let warning = format!(
            "Stage 2 produced only the raw checkpoint {} ({}); it may not load for inference",
            checkpoint.display(),
            failure
        );
        log::warn!("{}", warning);
        warnings.push(warning);
        Ok(checkpoint)
    }

    async fn convert_checkpoint(
        &self,
        exp: &ExperimentDirectory,
        checkpoint: &Path,
        output: &Path,
    ) -> VoiceResult<()> {
        let converter = self.config.sovits.converter_script.as_ref().ok_or_else(|| {
            VoiceError::precondition("no checkpoint converter configured")
        })?;
        Self::require_script("conversion", converter)?;

        let command = self
            .command("conversion", converter)
            .arg(path_arg(checkpoint))
            .arg(path_arg(output))
            .arg(path_arg(&exp.stage2_config()))
            .timeout(self.config.timeouts.conversion());
        run_stage(command).await.map(|_| ())
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        exp: &ExperimentDirectory,
        request: &TrainingRequest,
        sample_count: usize,
        gpt_model: &Path,
        sovits_model: &Path,
        origin: TranscriptOrigin,
        warnings: Vec<String>,
    ) -> VoiceResult<TrainingOutcome> {
        let model_dir = self.store.model_dir(exp.speaker());
        std::fs::create_dir_all(&model_dir)
            .map_err(|e| VoiceError::io(format!("creating {}", model_dir.display()), e))?;

        // Files the current record points at stay until the new record commits
        let previous: Vec<PathBuf> = self
            .store
            .get(exp.speaker())
            .ok()
            .and_then(|s| {
                s.model_pair()
                    .map(|(gpt, sovits)| vec![PathBuf::from(gpt), PathBuf::from(sovits)])
            })
            .unwrap_or_default();

        let mut installed = Vec::with_capacity(2);
        for model in [gpt_model, sovits_model] {
            match install_artifact(model, &model_dir) {
                Ok(path) => installed.push((model.to_path_buf(), path)),
                Err(e) => {
                    discard_installed(&installed, &previous);
                    return Err(e);
                }
            }
        }
        let gpt_path = installed[0].1.clone();
        let sovits_path = installed[1].1.clone();

        let lossy = |p: &Path| p.to_string_lossy().into_owned();
        let info = ModelInfo {
            method: METHOD_GPT_SOVITS_TRAINED.to_string(),
            gpt_model_path: lossy(&gpt_path),
            sovits_model_path: lossy(&sovits_path),
            exp_dir: lossy(exp.root()),
            model_dir: lossy(&model_dir),
            sample_count,
            stage1_epochs: request.stage1_epochs,
            stage2_epochs: request.stage2_epochs,
            trained_at: chrono::Utc::now().to_rfc3339(),
        };

        if let Err(e) = self.commit_model_info(exp.speaker(), &model_dir, &info) {
            discard_installed(&installed, &previous);
            return Err(e);
        }
        remove_stale_models(&model_dir, &[&gpt_path, &sovits_path]);

        Ok(TrainingOutcome {
            gpt_model_path: info.gpt_model_path,
            sovits_model_path: info.sovits_model_path,
            exp_dir: info.exp_dir,
            model_dir: info.model_dir,
            sample_count,
            stage1_epochs: request.stage1_epochs,
            stage2_epochs: request.stage2_epochs,
            transcript_origin: origin,
            warnings,
        })
    }

    /// Write `model_info.json` and the database record; on failure both are left as they were
    fn commit_model_info(
        &self,
        speaker: &str,
        model_dir: &Path,
        info: &ModelInfo,
    ) -> VoiceResult<()> {
        let info_path = model_dir.join("model_info.json");
        let info_json = serde_json::to_string_pretty(info)
            .map_err(|e| VoiceError::Io(format!("serializing model info: {}", e)))?;
        let previous_json = std::fs::read(&info_path).ok();

        std::fs::write(&info_path, info_json)
            .map_err(|e| VoiceError::io("writing model_info.json", e))?;

        if let Err(e) = self.store.mark_trained(speaker, info) {
            let _ = match previous_json {
                Some(bytes) => std::fs::write(&info_path, bytes),
                None => std::fs::remove_file(&info_path),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Copy each sample into `input_wavs/{speaker}_{index:04}.{ext}`; missing sources are skipped
fn stage_samples(
    exp: &ExperimentDirectory,
    samples: &[AudioSample],
    warnings: &mut Vec<String>,
) -> VoiceResult<Vec<StagedSample>> {
    let input_dir = exp.input_wavs();
    let mut staged = Vec::with_capacity(samples.len());

    for sample in samples {
        let source = Path::new(&sample.storage_path);
        if !source.is_file() {
            let warning = format!("Sample {} is missing on disk; skipped", sample.storage_path);
            log::warn!("{}", warning);
            warnings.push(warning);
            continue;
        }

        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "wav".to_string());
        let staged_name = format!("{}_{:04}.{}", exp.speaker(), staged.len(), ext);
        let dest = input_dir.join(&staged_name);
        std::fs::copy(source, &dest).map_err(|e| {
            VoiceError::io(format!("staging {} as {}", source.display(), staged_name), e)
        })?;

        staged.push(StagedSample {
            sample_index: sample.index,
            source_path: sample.storage_path.clone(),
            staged_name,
            staged_path: dest.to_string_lossy().into_owned(),
            transcript: sample.transcript.clone(),
        });
    }

    Ok(staged)
}

fn fill_placeholders(texts: Vec<Option<String>>) -> Vec<String> {
    texts
        .into_iter()
        .map(|t| t.unwrap_or_else(|| PLACEHOLDER_TRANSCRIPT.to_string()))
        .collect()
}

/// Attach counts of every intermediate artifact when the semantic table is empty
fn with_semantic_diagnostics(
    err: VoiceError,
    exp: &ExperimentDirectory,
    output: &StageOutput,
) -> VoiceError {
    match err {
        VoiceError::DataConsistencyError {
            stage,
            expected,
            actual: 0,
            delta,
            missing,
            ..
        } => {
            let count = |dir: PathBuf, ext: Option<&str>| {
                std::fs::read_dir(dir)
                    .map(|entries| {
                        entries
                            .flatten()
                            .filter(|e| {
                                ext.map_or(true, |ext| {
                                    e.path().extension().map_or(false, |x| x == ext)
                                })
                            })
                            .count()
                    })
                    .unwrap_or(0)
            };
            let detail = format!(
                "semantic table is empty; manifest lines: {}, hubert features: {}, 32k wavs: {}\n{}",
                manifest::count_lines(&exp.transcript_manifest()),
                count(exp.hubert_dir(), Some("pt")),
                count(exp.wav32k_dir(), None),
                output.tail(DIAGNOSTIC_TAIL)
            );
            VoiceError::DataConsistencyError {
                stage,
                expected,
                actual: 0,
                delta,
                missing,
                detail: Some(detail),
            }
        }
        other => other,
    }
}

/// Move an artifact into the model directory, copying across filesystems
fn install_artifact(source: &Path, model_dir: &Path) -> VoiceResult<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| VoiceError::precondition(format!("{} has no file name", source.display())))?;
    let dest = model_dir.join(name);

    if std::fs::rename(source, &dest).is_err() {
        std::fs::copy(source, &dest).map_err(|e| {
            VoiceError::io(
                format!("installing {} into {}", source.display(), model_dir.display()),
                e,
            )
        })?;
    }
    Ok(dest)
}

/// Undo `install_artifact` for files no committed record uses
fn discard_installed(installed: &[(PathBuf, PathBuf)], keep: &[PathBuf]) {
    for (source, dest) in installed {
        if keep.iter().any(|k| k == dest) {
            continue;
        }
        if std::fs::rename(dest, source).is_err() {
            let _ = std::fs::remove_file(dest);
        }
    }
}

/// Drop model files from earlier runs
fn remove_stale_models(model_dir: &Path, keep: &[&Path]) {
    let Ok(entries) = std::fs::read_dir(model_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_model = path
            .extension()
            .map_or(false, |e| e == "ckpt" || e == "pth");
        if is_model && !keep.iter().any(|k| *k == path.as_path()) {
            log::debug!("Removing stale model {}", path.display());
            let _ = std::fs::remove_file(&path);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SovitsConfig;
    use crate::database::NewSample;
    use crate::training::status::TrainingJob;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};

    const GET_TEXT: &str = r#"
while IFS='|' read -r path spk lang text; do
  [ -n "$path" ] || continue
  printf '%s\tph\t1\t%s\n' "$(basename "$path")" "$text"
done < "$inp_text" > "$opt_dir/2-name2text-0.txt"
"#;

    const GET_HUBERT: &str = r#"
mkdir -p "$opt_dir/4-cnhubert" "$opt_dir/5-wav32k"
for f in "$inp_wav_dir"/*; do
  n=$(basename "$f")
  : > "$opt_dir/4-cnhubert/$n.pt"
  cp "$f" "$opt_dir/5-wav32k/$n"
done
"#;

    const GET_SEMANTIC: &str = r#"
for f in "$opt_dir"/4-cnhubert/*.pt; do
  printf '%s\t1 2 3\n' "$(basename "$f" .pt)"
done > "$opt_dir/6-name2semantic-0.tsv"
"#;

    const S1_TRAIN: &str = r#"
exp=$(dirname "$2")
name=$(basename "$exp")
for e in 1 2 3 4 5 6 7 8; do echo "Epoch $e/8"; done
mkdir -p "$exp/logs_s1/ckpt"
: > "$exp/logs_s1/ckpt/$name-e8.ckpt"
"#;

    const S2_TRAIN: &str = r#"
exp=$(dirname "$2")
name=$(basename "$exp")
: > "$exp/logs_s2_v2/G_100.pth"
: > "$exp/logs_s2_v2/${name}_e8.pth"
"#;

    const S2_TRAIN_RAW_ONLY: &str = r#"
exp=$(dirname "$2")
: > "$exp/logs_s2_v2/G_100.pth"
: > "$exp/logs_s2_v2/D_100.pth"
"#;

    struct Harness {
        dir: TempDir,
        config: Arc<AppConfig>,
        store: Arc<SpeakerStore>,
        tracker: Arc<TrainingStatusTracker>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(|_| {})
        }

        fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
            let dir = tempdir().unwrap();
            let toolkit = dir.path().join("toolkit");

            let mut config = AppConfig::with_data_dir(dir.path().join("data"));
            config.sovits = SovitsConfig::for_root(toolkit);
            config.sovits.python_exec = PathBuf::from("sh");
            config.sovits.asr_script = None;
            config.sovits.converter_script = None;
            adjust(&mut config);

            let store = Arc::new(SpeakerStore::open(&config).unwrap());
            let harness = Self {
                dir,
                config: Arc::new(config),
                store,
                tracker: Arc::new(TrainingStatusTracker::new()),
            };

            harness.script("GPT_SoVITS/prepare_datasets/1-get-text.py", GET_TEXT);
            harness.script("GPT_SoVITS/prepare_datasets/2-get-hubert-wav32k.py", GET_HUBERT);
            harness.script("GPT_SoVITS/prepare_datasets/3-get-semantic.py", GET_SEMANTIC);
            harness.script("GPT_SoVITS/s1_train.py", S1_TRAIN);
            harness.script("GPT_SoVITS/s2_train.py", S2_TRAIN);
            harness.script("GPT_SoVITS/configs/s1longer-v2.yaml", "train:\n  epochs: 20\n");
            harness.script("GPT_SoVITS/configs/s2.json", r#"{"train": {}, "data": {}, "model": {}}"#);
            harness
        }

        fn toolkit(&self) -> PathBuf {
            self.config.sovits.root.clone()
        }

        fn script(&self, relative: &str, body: &str) {
            let path = self.toolkit().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }

        fn add_samples(&self, speaker: &str, count: usize, with_transcripts: bool) {
            for i in 0..count {
                let path = self.dir.path().join("uploads").join(format!("{}_{}.wav", speaker, i));
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, b"RIFF").unwrap();
                self.store
                    .add_sample(
                        speaker,
                        NewSample {
                            storage_path: path.to_string_lossy().into_owned(),
                            original_path: path.to_string_lossy().into_owned(),
                            duration: 5.0,
                            sample_rate: 32000,
                            transcript: with_transcripts.then(|| format!("sentence {}", i)),
                        },
                    )
                    .unwrap();
            }
        }

        fn orchestrator(&self) -> Arc<TrainingOrchestrator> {
            Arc::new(self.plain_orchestrator())
        }

        fn plain_orchestrator(&self) -> TrainingOrchestrator {
            TrainingOrchestrator::new(
                self.config.clone(),
                self.store.clone(),
                self.tracker.clone(),
            )
        }

        fn exp(&self, speaker: &str) -> ExperimentDirectory {
            ExperimentDirectory::new(&self.config.experiments_dir(), speaker)
        }
    }

    struct FixedTranscriber(HashMap<String, String>);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(
            &self,
            _input_dir: &Path,
            _output_dir: &Path,
            _language: &str,
        ) -> VoiceResult<HashMap<String, String>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenTranscriber;

    #[async_trait]
    impl Transcriber for BrokenTranscriber {
        async fn transcribe(
            &self,
            _input_dir: &Path,
            _output_dir: &Path,
            _language: &str,
        ) -> VoiceResult<HashMap<String, String>> {
            Err(VoiceError::StageExecutionError {
                stage: "transcription".to_string(),
                exit_code: Some(1),
                stderr: "No module named faster_whisper".to_string(),
            })
        }
    }

    #[test]
    fn test_parse_epoch() {
        assert_eq!(parse_epoch("Epoch 3/8"), Some(3));
        assert_eq!(parse_epoch("INFO: epoch=12 loss=0.3"), Some(12));
        assert_eq!(parse_epoch("step 40"), None);
    }

    #[tokio::test]
    async fn test_full_pipeline_trains_speaker() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        let orchestrator = h.orchestrator();

        let outcome = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();

        assert_eq!(outcome.sample_count, 3);
        assert_eq!(outcome.stage2_epochs, 8);
        assert_eq!(outcome.transcript_origin, TranscriptOrigin::Provided);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert!(outcome.gpt_model_path.ends_with("alice-e8.ckpt"));
        assert!(outcome.sovits_model_path.ends_with("alice_e8.pth"));
        assert!(Path::new(&outcome.gpt_model_path).is_file());
        assert!(Path::new(&outcome.sovits_model_path).is_file());
        assert!(Path::new(&outcome.model_dir).join("model_info.json").is_file());

        let speaker = h.store.get("alice").unwrap();
        assert!(speaker.trained);
        let (gpt, sovits) = speaker.model_pair().unwrap();
        assert_eq!(gpt, outcome.gpt_model_path);
        assert_eq!(sovits, outcome.sovits_model_path);

        let manifest = std::fs::read_to_string(h.exp("alice").transcript_manifest()).unwrap();
        assert!(manifest.contains("alice_0002.wav|alice|ZH|sentence 2"));
        assert!(h.exp("alice").stage1_config().is_file());

        match h.tracker.get("alice") {
            TrainingJob::Completed { result, .. } => assert_eq!(result, outcome),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insufficient_samples_launches_nothing() {
        let h = Harness::new();
        h.add_samples("alice", 2, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineStage::DataPrep);
        assert_eq!(
            failure.error,
            VoiceError::InsufficientSamples {
                speaker: "alice".to_string(),
                found: 2,
                required: 3,
            }
        );
        assert!(!h.exp("alice").root().exists());
        assert_eq!(h.tracker.get("alice"), TrainingJob::NotStarted);
    }

    #[tokio::test]
    async fn test_semantic_row_mismatch_stops_before_stage1() {
        let h = Harness::new();
        h.script(
            "GPT_SoVITS/prepare_datasets/3-get-semantic.py",
            r#"
for f in "$opt_dir"/4-cnhubert/*.pt; do
  printf '%s\t1 2 3\n' "$(basename "$f" .pt)"
done | head -n 8 > "$opt_dir/6-name2semantic-0.tsv"
"#,
        );
        h.add_samples("alice", 10, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Preprocessing);
        match failure.error {
            VoiceError::DataConsistencyError {
                expected,
                actual,
                delta,
                missing,
                ..
            } => {
                assert_eq!((expected, actual, delta), (10, 8, 2));
                assert_eq!(missing, vec!["alice_0008.wav", "alice_0009.wav"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let exp = h.exp("alice");
        assert!(!exp.stage1_config().exists());
        assert!(exp.input_wavs().is_dir());
        assert!(!h.store.get("alice").unwrap().trained);
        match h.tracker.get("alice") {
            TrainingJob::Failed { stage, .. } => assert_eq!(stage, PipelineStage::Preprocessing),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_semantic_table_carries_diagnostics() {
        let h = Harness::new();
        h.script(
            "GPT_SoVITS/prepare_datasets/3-get-semantic.py",
            "echo 'loading ssl model'\n: > \"$opt_dir/6-name2semantic-0.tsv\"\n",
        );
        h.add_samples("alice", 3, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        match failure.error {
            VoiceError::DataConsistencyError { actual, detail, .. } => {
                assert_eq!(actual, 0);
                let detail = detail.unwrap();
                assert!(detail.contains("manifest lines: 3"));
                assert!(detail.contains("hubert features: 3"));
                assert!(detail.contains("loading ssl model"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_step_records_stage_and_stderr() {
        let h = Harness::new();
        h.script(
            "GPT_SoVITS/prepare_datasets/1-get-text.py",
            "echo 'No module named transformers' >&2\nexit 1\n",
        );
        h.add_samples("alice", 3, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Preprocessing);
        match &failure.error {
            VoiceError::StageExecutionError {
                stage,
                exit_code,
                stderr,
            } => {
                assert_eq!(stage, "preprocess_text");
                assert_eq!(*exit_code, Some(1));
                assert!(stderr.contains("transformers"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!h.store.get("alice").unwrap().trained);
    }

    #[tokio::test]
    async fn test_missing_toolkit_script_is_launch_error() {
        let h = Harness::new();
        std::fs::remove_file(h.toolkit().join("GPT_SoVITS/s1_train.py")).unwrap();
        h.add_samples("alice", 3, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Stage1Gpt);
        assert_eq!(failure.error.kind(), "stage_launch_error");
    }

    #[tokio::test]
    async fn test_stage1_without_checkpoint_is_no_artifact() {
        let h = Harness::new();
        h.script("GPT_SoVITS/s1_train.py", "echo 'Epoch 1/8'\n");
        h.add_samples("alice", 3, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Stage1Gpt);
        assert_eq!(failure.error.kind(), "no_artifact_produced");
    }

    #[tokio::test]
    async fn test_stage2_missing_features_is_precondition() {
        let h = Harness::new();
        h.script(
            "GPT_SoVITS/s1_train.py",
            &format!("{}\nrm -rf \"$exp/5-wav32k\"\n", S1_TRAIN),
        );
        h.add_samples("alice", 3, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, PipelineStage::Stage2Sovits);
        assert_eq!(failure.error.kind(), "precondition_error");
    }

    #[tokio::test]
    async fn test_stage2_raw_checkpoint_fallback_warns() {
        let h = Harness::new();
        h.script("GPT_SoVITS/s2_train.py", S2_TRAIN_RAW_ONLY);
        h.add_samples("alice", 3, true);

        let outcome = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();

        assert!(outcome.sovits_model_path.ends_with("G_100.pth"));
        assert!(outcome.warnings.iter().any(|w| w.contains("raw checkpoint")));
        assert!(h.store.get("alice").unwrap().trained);
    }

    #[tokio::test]
    async fn test_stage2_checkpoint_is_converted() {
        let h = Harness::with_config(|config| {
            config.sovits.converter_script = Some(config.sovits.root.join("convert.sh"));
        });
        h.script("GPT_SoVITS/s2_train.py", S2_TRAIN_RAW_ONLY);
        h.script("convert.sh", "cp \"$1\" \"$2\"\n");
        h.add_samples("alice", 3, true);

        let outcome = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4).with_stage2_epochs(9))
            .await
            .unwrap();

        assert!(outcome.sovits_model_path.ends_with("alice_e9.pth"));
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_transcripts_when_nothing_available() {
        let h = Harness::new();
        h.add_samples("alice", 3, false);
        let orchestrator = h
            .plain_orchestrator()
            .with_transcriber(Some(Arc::new(BrokenTranscriber)));

        let outcome = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();

        assert_eq!(outcome.transcript_origin, TranscriptOrigin::Placeholder);
        assert!(outcome.warnings.iter().any(|w| w.contains("faster_whisper")));
        assert!(outcome.warnings.iter().any(|w| w.contains("placeholder")));
        let manifest = std::fs::read_to_string(h.exp("alice").transcript_manifest()).unwrap();
        assert_eq!(manifest.matches(PLACEHOLDER_TRANSCRIPT).count(), 3);
    }

    #[tokio::test]
    async fn test_transcriber_fills_missing_text() {
        let h = Harness::new();
        h.add_samples("alice", 3, false);
        let texts: HashMap<String, String> = (0..3)
            .map(|i| (format!("alice_{:04}.wav", i), format!("heard {}", i)))
            .collect();
        let orchestrator = h
            .plain_orchestrator()
            .with_transcriber(Some(Arc::new(FixedTranscriber(texts))));

        let outcome = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();

        assert_eq!(outcome.transcript_origin, TranscriptOrigin::Transcribed);
        let manifest = std::fs::read_to_string(h.exp("alice").transcript_manifest()).unwrap();
        assert!(manifest.contains("|heard 1"));
    }

    #[tokio::test]
    async fn test_supplied_map_keyed_by_upload_name() {
        let h = Harness::new();
        h.add_samples("alice", 3, false);
        let texts: HashMap<String, String> = [
            ("alice_0.wav".to_string(), "first".to_string()),
            ("alice_1.wav".to_string(), "second".to_string()),
        ]
        .into_iter()
        .collect();

        let outcome = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4).with_transcripts(texts))
            .await
            .unwrap();

        assert_eq!(outcome.transcript_origin, TranscriptOrigin::Provided);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("alice_0002.wav"));
        let manifest = std::fs::read_to_string(h.exp("alice").transcript_manifest()).unwrap();
        assert!(manifest.contains("alice_0001.wav|alice|ZH|second"));
        assert!(manifest.contains(PLACEHOLDER_TRANSCRIPT));
    }

    #[tokio::test]
    async fn test_rejects_training_while_in_flight() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        h.tracker.try_begin("alice", 16).unwrap();
        let orchestrator = h.orchestrator();

        let err = orchestrator
            .spawn_training(TrainingRequest::new("alice", 8, 4))
            .err()
            .unwrap();
        assert_eq!(err, VoiceError::AlreadyTraining("alice".to_string()));

        let failure = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), "already_training");

        // The in-flight job is untouched and nothing was staged
        assert!(h.tracker.is_training("alice"));
        assert!(!h.exp("alice").root().exists());
    }

    #[tokio::test]
    async fn test_background_training_completes() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        let orchestrator = h.orchestrator();

        let handle = orchestrator
            .spawn_training(orchestrator.default_request("alice"))
            .unwrap();
        assert_eq!(handle.speaker(), "alice");

        let outcome = handle.wait().await.unwrap();
        assert!(h.store.get("alice").unwrap().trained);
        match h.tracker.get("alice") {
            TrainingJob::Completed { result, .. } => assert_eq!(result, outcome),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retraining_replaces_previous_models() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        let orchestrator = h.orchestrator();

        orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();
        h.script("GPT_SoVITS/s2_train.py", S2_TRAIN_RAW_ONLY);
        let second = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();

        let model_dir = h.store.model_dir("alice");
        assert!(!model_dir.join("alice_e8.pth").exists());
        assert!(model_dir.join("G_100.pth").is_file());
        assert!(Path::new(&second.gpt_model_path).is_file());
    }

    #[tokio::test]
    async fn test_sample_floor_overrides_lower_config() {
        let h = Harness::with_config(|c| c.training.min_samples = 1);
        h.add_samples("alice", 1, true);

        let failure = h
            .orchestrator()
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();

        assert_eq!(
            failure.error,
            VoiceError::InsufficientSamples {
                speaker: "alice".to_string(),
                found: 1,
                required: 3,
            }
        );
        assert!(!h.store.get("alice").unwrap().trained);
        assert!(!h.exp("alice").root().exists());
    }

    #[tokio::test]
    async fn test_failed_finalize_keeps_previous_models() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        let orchestrator = h.orchestrator();
        let first = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();

        // Second run yields a differently named SoVITS file and cannot write its info file
        h.script("GPT_SoVITS/s2_train.py", S2_TRAIN_RAW_ONLY);
        let model_dir = PathBuf::from(&first.model_dir);
        std::fs::remove_file(model_dir.join("model_info.json")).unwrap();
        std::fs::create_dir(model_dir.join("model_info.json")).unwrap();

        let failure = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, PipelineStage::Finalize);

        let speaker = h.store.get("alice").unwrap();
        assert!(speaker.trained);
        let (gpt, sovits) = speaker.model_pair().unwrap();
        assert_eq!(sovits, first.sovits_model_path);
        assert!(Path::new(gpt).is_file());
        assert!(Path::new(sovits).is_file());
        assert!(!model_dir.join("G_100.pth").exists());
    }

    #[tokio::test]
    async fn test_deleted_speaker_is_not_claimed() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        h.store.delete("alice").unwrap();
        let orchestrator = h.orchestrator();

        let err = orchestrator
            .spawn_training(TrainingRequest::new("alice", 8, 4))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "not_found");

        let failure = orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), "not_found");

        assert!(!h.exp("alice").root().exists());
        assert_eq!(h.tracker.get("alice"), TrainingJob::NotStarted);
    }

    #[tokio::test]
    async fn test_rejected_request_keeps_previous_status() {
        let h = Harness::new();
        h.add_samples("alice", 3, true);
        let orchestrator = h.orchestrator();
        orchestrator
            .train_speaker(TrainingRequest::new("alice", 8, 4))
            .await
            .unwrap();
        let completed = h.tracker.get("alice");

        let failure = orchestrator
            .train_speaker(TrainingRequest::new("alice", 0, 4))
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), "invalid_input");
        assert_eq!(h.tracker.get("alice"), completed);
    }
}
