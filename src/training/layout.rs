// Experiment directory layout
// Per-speaker scratch space shared with the external toolkit

use std::path::{Path, PathBuf};

use crate::error::{VoiceError, VoiceResult};

/// Intermediate outputs removed before preprocessing runs again
const INTERMEDIATE_DIRS: &[&str] = &[
    "2-name2text",
    "3-bert",
    "4-cnhubert",
    "5-wav32k",
    "6-name2semantic",
    "logs_s1",
    "logs_s2_v2",
];
const INTERMEDIATE_FILES: &[&str] = &[
    "2-name2text-0.txt",
    "2-name2text.txt",
    "6-name2semantic-0.tsv",
];

#[derive(Debug, Clone)]
pub struct ExperimentDirectory {
    root: PathBuf,
    speaker: String,
}

impl ExperimentDirectory {
    pub fn new(experiments_dir: &Path, speaker: &str) -> Self {
        Self {
            root: experiments_dir.join(speaker),
            speaker: speaker.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn speaker(&self) -> &str {
        &self.speaker
    }

    pub fn input_wavs(&self) -> PathBuf {
        self.root.join("input_wavs")
    }

    pub fn transcript_manifest(&self) -> PathBuf {
        self.root.join("input_text.txt")
    }

    pub fn staging_map(&self) -> PathBuf {
        self.root.join("staging_map.json")
    }

    pub fn phoneme_table(&self) -> PathBuf {
        self.root.join("2-name2text-0.txt")
    }

    /// Copy of the phoneme table under the name stage 2 reads
    pub fn stage2_phoneme_table(&self) -> PathBuf {
        self.root.join("2-name2text.txt")
    }

    pub fn bert_dir(&self) -> PathBuf {
        self.root.join("3-bert")
    }

    pub fn hubert_dir(&self) -> PathBuf {
        self.root.join("4-cnhubert")
    }

    pub fn wav32k_dir(&self) -> PathBuf {
        self.root.join("5-wav32k")
    }

    pub fn semantic_table(&self) -> PathBuf {
        self.root.join("6-name2semantic-0.tsv")
    }

    pub fn stage1_logs(&self) -> PathBuf {
        self.root.join("logs_s1")
    }

    pub fn stage2_logs(&self) -> PathBuf {
        self.root.join("logs_s2_v2")
    }

    pub fn stage1_config(&self) -> PathBuf {
        self.root.join("s1_config.yaml")
    }

    pub fn stage2_config(&self) -> PathBuf {
        self.root.join("s2_config.json")
    }

    /// Remove everything from a previous attempt and start empty
    pub fn recreate(&self) -> VoiceResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root).map_err(|e| {
                VoiceError::io(format!("clearing {}", self.root.display()), e)
            })?;
        }
        std::fs::create_dir_all(self.input_wavs())
            .map_err(|e| VoiceError::io(format!("creating {}", self.root.display()), e))
    }

    /// Remove generated features and checkpoints, keeping staged inputs
    pub fn purge_intermediates(&self) -> VoiceResult<()> {
        for name in INTERMEDIATE_DIRS {
            let path = self.root.join(name);
            if path.exists() {
                log::debug!("Purging {}", path.display());
                std::fs::remove_dir_all(&path)
                    .map_err(|e| VoiceError::io(format!("purging {}", path.display()), e))?;
            }
        }
        for name in INTERMEDIATE_FILES {
            let path = self.root.join(name);
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| VoiceError::io(format!("purging {}", path.display()), e))?;
            }
        }
        Ok(())
    }
}
