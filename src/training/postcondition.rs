//! Stage postconditions
//!
//! Declares what a step must leave on disk (directories, files, table row
//! counts) and checks it once the step has exited. The same object doubles as
//! a precondition check for the step that consumes those outputs.

use std::path::PathBuf;

use super::manifest;
use crate::error::{VoiceError, VoiceResult};

#[derive(Debug, Clone)]
enum Expectation {
    Dir(PathBuf),
    File(PathBuf),
    /// Table whose first-column keys must cover `expected` exactly
    Rows {
        path: PathBuf,
        expected: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct StagePostcondition {
    stage: String,
    expectations: Vec<Expectation>,
}

impl StagePostcondition {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            expectations: Vec::new(),
        }
    }

    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.expectations.push(Expectation::Dir(path.into()));
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.expectations.push(Expectation::File(path.into()));
        self
    }

    pub fn rows(mut self, path: impl Into<PathBuf>, expected: Vec<String>) -> Self {
        self.expectations.push(Expectation::Rows {
            path: path.into(),
            expected,
        });
        self
    }

    /// Check outputs of a step that just ran
    pub fn check(&self) -> VoiceResult<()> {
        for expectation in &self.expectations {
            match expectation {
                Expectation::Dir(path) if !path.is_dir() => {
                    return Err(self.missing(path));
                }
                Expectation::File(path) if !path.is_file() => {
                    return Err(self.missing(path));
                }
                Expectation::Rows { path, expected } => {
                    if !path.is_file() {
                        return Err(self.missing(path));
                    }
                    self.check_rows(path, expected)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check inputs a step is about to consume; absent paths become `PreconditionError`
    pub fn require(&self) -> VoiceResult<()> {
        self.check().map_err(|err| match err {
            VoiceError::NoArtifactProduced { searched, .. } => VoiceError::PreconditionError(
                format!("{} requires {}, which does not exist", self.stage, searched),
            ),
            other => other,
        })
    }

    fn missing(&self, path: &std::path::Path) -> VoiceError {
        VoiceError::NoArtifactProduced {
            stage: self.stage.clone(),
            searched: path.display().to_string(),
        }
    }

    fn check_rows(&self, path: &std::path::Path, expected: &[String]) -> VoiceResult<()> {
        let keys = manifest::table_keys(path)?;
        if keys.len() == expected.len() {
            return Ok(());
        }

        let missing = manifest::missing_names(expected, &keys);
        let detail = if keys.is_empty() {
            Some(format!("{} is empty", path.display()))
        } else {
            None
        };
        Err(VoiceError::DataConsistencyError {
            stage: self.stage.clone(),
            expected: expected.len(),
            actual: keys.len(),
            delta: expected.len().abs_diff(keys.len()),
            missing,
            detail,
        })
    }
}
