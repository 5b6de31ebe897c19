//! Speaker store
//!
//! Wraps the SQLite repository with the filesystem side of a speaker: sample
//! copies under `training_data/<speaker>`, trained models under
//! `trained_speakers/<speaker>` and the experiment directory. Deletion
//! tombstones the row first, removes files, then drops the row; a tombstone
//! left behind by a crash is finished by `reconcile` on the next open.

use std::path::{Path, PathBuf};

use crate::audio::wav::probe_wav;
use crate::config::AppConfig;
use crate::database::{DatabaseManager, ModelInfo, NewSample, Speaker, SpeakerSummary};
use crate::error::{VoiceError, VoiceResult};

const MAX_NAME_LEN: usize = 128;

/// Reject names that could escape the per-speaker directories
pub fn validate_speaker_name(name: &str) -> VoiceResult<()> {
    let invalid = |reason: &str| VoiceError::InvalidInput(format!("speaker name '{}' {}", name, reason));

    if name.trim().is_empty() {
        return Err(invalid("is empty"));
    }
    if name != name.trim() {
        return Err(invalid("has surrounding whitespace"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("is too long"));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(invalid("contains path characters"));
    }
    Ok(())
}

pub struct SpeakerStore {
    db: DatabaseManager,
    samples_dir: PathBuf,
    models_dir: PathBuf,
    experiments_dir: PathBuf,
}

impl SpeakerStore {
    /// Open the store described by `config`, finishing any interrupted deletes
    pub fn open(config: &AppConfig) -> VoiceResult<Self> {
        config.ensure_dirs()?;
        let db = DatabaseManager::new(config.database_path())?;
        let store = Self {
            db,
            samples_dir: config.training_data_dir(),
            models_dir: config.trained_models_dir(),
            experiments_dir: config.experiments_dir(),
        };
        store.reconcile()?;
        Ok(store)
    }

    pub fn sample_dir(&self, speaker: &str) -> PathBuf {
        self.samples_dir.join(speaker)
    }

    pub fn model_dir(&self, speaker: &str) -> PathBuf {
        self.models_dir.join(speaker)
    }

    pub fn experiment_dir(&self, speaker: &str) -> PathBuf {
        self.experiments_dir.join(speaker)
    }

    /// Record a sample whose file the caller has already placed; returns the new count
    pub fn add_sample(&self, speaker: &str, sample: NewSample) -> VoiceResult<usize> {
        validate_speaker_name(speaker)?;
        if !sample.duration.is_finite() || sample.duration < 0.0 {
            return Err(VoiceError::InvalidInput(format!(
                "sample duration {} is not valid",
                sample.duration
            )));
        }

        let count = self.db.insert_sample(speaker, &sample)?;
        log::info!(
            "Added sample {} to speaker '{}' ({} total)",
            sample.storage_path,
            speaker,
            count
        );
        Ok(count)
    }

    /// Copy an uploaded WAV into the speaker's sample directory and record it
    pub fn import_upload(
        &self,
        speaker: &str,
        upload_path: &Path,
        transcript: Option<String>,
    ) -> VoiceResult<usize> {
        validate_speaker_name(speaker)?;
        let info = probe_wav(upload_path)
            .map_err(|e| VoiceError::InvalidInput(format!("{:#}", e)))?;

        let dir = self.sample_dir(speaker);
        std::fs::create_dir_all(&dir)
            .map_err(|e| VoiceError::io(format!("creating {}", dir.display()), e))?;
        let dest = unique_destination(&dir, upload_path);
        std::fs::copy(upload_path, &dest).map_err(|e| {
            VoiceError::io(
                format!("copying {} to {}", upload_path.display(), dest.display()),
                e,
            )
        })?;

        let sample = NewSample {
            storage_path: dest.to_string_lossy().into_owned(),
            original_path: upload_path.to_string_lossy().into_owned(),
            duration: info.duration,
            sample_rate: info.sample_rate,
            transcript: transcript.filter(|t| !t.trim().is_empty()),
        };

        match self.add_sample(speaker, sample) {
            Ok(count) => Ok(count),
            Err(err) => {
                let _ = std::fs::remove_file(&dest);
                Err(err)
            }
        }
    }

    /// Attach a transcript to an existing sample
    pub fn set_transcript(&self, speaker: &str, index: usize, text: &str) -> VoiceResult<()> {
        if self.db.set_sample_transcript(speaker, index, text.trim())? {
            Ok(())
        } else {
            Err(VoiceError::NotFound(format!(
                "sample {} of speaker '{}'",
                index, speaker
            )))
        }
    }

    /// Record training results; both artifacts must exist on disk
    pub fn mark_trained(&self, speaker: &str, info: &ModelInfo) -> VoiceResult<()> {
        for path in [&info.gpt_model_path, &info.sovits_model_path] {
            if path.is_empty() || !Path::new(path).is_file() {
                return Err(VoiceError::precondition(format!(
                    "model artifact '{}' does not exist",
                    path
                )));
            }
        }

        if !self.db.mark_speaker_trained(speaker, info)? {
            return Err(VoiceError::NotFound(format!("speaker '{}'", speaker)));
        }
        log::info!("Speaker '{}' marked as trained", speaker);
        Ok(())
    }

    pub fn get(&self, speaker: &str) -> VoiceResult<Speaker> {
        self.db
            .get_speaker(speaker)?
            .ok_or_else(|| VoiceError::NotFound(format!("speaker '{}'", speaker)))
    }

    pub fn list(&self) -> VoiceResult<Vec<SpeakerSummary>> {
        Ok(self.db.list_speakers()?)
    }

    /// Remove a speaker and every file it owns
    pub fn delete(&self, speaker: &str) -> VoiceResult<()> {
        let record = self.get(speaker)?;

        self.db.tombstone_speaker(speaker)?;
        self.remove_owned_files(&record)?;
        self.db.delete_speaker_rows(speaker)?;

        log::info!("Deleted speaker '{}'", speaker);
        Ok(())
    }

    /// Finish deletes interrupted after the tombstone was written
    pub fn reconcile(&self) -> VoiceResult<usize> {
        let pending = self.db.list_tombstoned_speakers()?;
        for speaker in &pending {
            log::warn!("Completing interrupted delete of speaker '{}'", speaker.name);
            self.remove_owned_files(speaker)?;
            self.db.delete_speaker_rows(&speaker.name)?;
        }
        Ok(pending.len())
    }

    fn remove_owned_files(&self, speaker: &Speaker) -> VoiceResult<()> {
        for sample in &speaker.samples {
            remove_path(Path::new(&sample.storage_path))?;
            remove_path(Path::new(&sample.original_path))?;
        }
        for dir in [
            self.sample_dir(&speaker.name),
            self.model_dir(&speaker.name),
            self.experiment_dir(&speaker.name),
        ] {
            remove_path(&dir)?;
        }
        Ok(())
    }
}

/// Delete a file or directory tree; absence is not an error
fn remove_path(path: &Path) -> VoiceResult<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VoiceError::io(format!("removing {}", path.display()), e)),
    }
}

/// `dir/<upload name>`, suffixed `_1`, `_2`, ... when taken
fn unique_destination(dir: &Path, upload_path: &Path) -> PathBuf {
    let stem = upload_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sample".to_string());
    let ext = upload_path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_string());

    let mut candidate = dir.join(format!("{}.{}", stem, ext));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.{}", stem, n, ext));
        n += 1;
    }
    candidate
}
