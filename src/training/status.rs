//! Training status tracker - per-speaker job state
//!
//! The only shared mutable state of the training pipeline. Entries are
//! updated under DashMap's per-shard lock, so a check-and-set on one speaker
//! never races with another request for the same speaker.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::types::{PipelineStage, TrainingFailure, TrainingOutcome};
use crate::error::{VoiceError, VoiceResult};

/// Job state of one speaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingJob {
    NotStarted,
    Training {
        progress: u8,
        stage: PipelineStage,
        total_epochs: u32,
        current_epoch: Option<u32>,
        started_at: String,
    },
    Completed {
        result: TrainingOutcome,
        started_at: String,
        finished_at: String,
    },
    Failed {
        stage: PipelineStage,
        error: VoiceError,
        message: String,
        started_at: String,
        finished_at: String,
    },
}

impl TrainingJob {
    pub fn is_training(&self) -> bool {
        matches!(self, TrainingJob::Training { .. })
    }

    pub fn progress(&self) -> u8 {
        match self {
            TrainingJob::NotStarted => 0,
            TrainingJob::Training { progress, .. } => *progress,
            TrainingJob::Completed { .. } => 100,
            TrainingJob::Failed { .. } => 0,
        }
    }

    fn started_at(&self) -> Option<&str> {
        match self {
            TrainingJob::NotStarted => None,
            TrainingJob::Training { started_at, .. }
            | TrainingJob::Completed { started_at, .. }
            | TrainingJob::Failed { started_at, .. } => Some(started_at),
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Default)]
pub struct TrainingStatusTracker {
    jobs: DashMap<String, TrainingJob>,
}

impl TrainingStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a speaker into `training` unless a job is already in flight.
    /// Returns the state it replaced, for `restore`.
    pub fn try_begin(&self, speaker: &str, total_epochs: u32) -> VoiceResult<TrainingJob> {
        match self.jobs.entry(speaker.to_string()) {
            Entry::Occupied(entry) if entry.get().is_training() => {
                Err(VoiceError::AlreadyTraining(speaker.to_string()))
            }
            Entry::Occupied(mut entry) => Ok(entry.insert(Self::fresh(total_epochs))),
            Entry::Vacant(entry) => {
                entry.insert(Self::fresh(total_epochs));
                Ok(TrainingJob::NotStarted)
            }
        }
    }

    /// Give back a slot claimed by `try_begin` that never ran
    pub fn restore(&self, speaker: &str, previous: TrainingJob) {
        match previous {
            TrainingJob::NotStarted => {
                self.jobs.remove(speaker);
            }
            job => {
                self.jobs.insert(speaker.to_string(), job);
            }
        }
    }

    fn fresh(total_epochs: u32) -> TrainingJob {
        TrainingJob::Training {
            progress: 0,
            stage: PipelineStage::DataPrep,
            total_epochs,
            current_epoch: None,
            started_at: now(),
        }
    }

    /// Unconditionally mark a speaker as training
    pub fn set_training(&self, speaker: &str, total_epochs: u32) {
        self.jobs.insert(speaker.to_string(), Self::fresh(total_epochs));
    }

    /// Advance the stage and progress of an in-flight job
    pub fn set_stage(&self, speaker: &str, new_stage: PipelineStage, new_progress: u8) {
        if let Some(mut job) = self.jobs.get_mut(speaker) {
            if let TrainingJob::Training {
                progress,
                stage,
                current_epoch,
                ..
            } = job.value_mut()
            {
                if *stage != new_stage {
                    *current_epoch = None;
                }
                *stage = new_stage;
                *progress = (*progress).max(new_progress.min(99));
            }
        }
    }

    /// Record a trainer-reported epoch of the current stage
    pub fn set_epoch(&self, speaker: &str, epoch: u32, stage_epochs: u32) {
        if let Some(mut job) = self.jobs.get_mut(speaker) {
            if let TrainingJob::Training {
                progress,
                stage,
                current_epoch,
                ..
            } = job.value_mut()
            {
                *current_epoch = Some(epoch);
                *progress = (*progress).max(stage.progress_at(epoch, stage_epochs).min(99));
            }
        }
    }

    pub fn set_completed(&self, speaker: &str, result: TrainingOutcome) {
        let started_at = self.started_at(speaker);
        self.jobs.insert(
            speaker.to_string(),
            TrainingJob::Completed {
                result,
                started_at,
                finished_at: now(),
            },
        );
    }

    pub fn set_failed(&self, speaker: &str, failure: TrainingFailure) {
        let started_at = self.started_at(speaker);
        let message = failure.to_string();
        self.jobs.insert(
            speaker.to_string(),
            TrainingJob::Failed {
                stage: failure.stage,
                error: failure.error,
                message,
                started_at,
                finished_at: now(),
            },
        );
    }

    /// Current job state; `NotStarted` for unknown speakers
    pub fn get(&self, speaker: &str) -> TrainingJob {
        self.jobs
            .get(speaker)
            .map(|job| job.value().clone())
            .unwrap_or(TrainingJob::NotStarted)
    }

    pub fn is_training(&self, speaker: &str) -> bool {
        self.jobs
            .get(speaker)
            .map(|job| job.is_training())
            .unwrap_or(false)
    }

    /// Forget a speaker's job history
    pub fn remove(&self, speaker: &str) {
        self.jobs.remove(speaker);
    }

    fn started_at(&self, speaker: &str) -> String {
        self.jobs
            .get(speaker)
            .and_then(|job| job.started_at().map(str::to_string))
            .unwrap_or_else(now)
    }
}
