//! Flat-file manifests exchanged with the external toolkit
//!
//! The transcript manifest holds one `path|speaker|LANG|text` line per staged
//! clip. Feature tables (phoneme and semantic) are tab-separated with the
//! staged file name in the first column.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{VoiceError, VoiceResult};

/// One line of the transcript manifest
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub audio_path: String,
    pub speaker: String,
    pub language: String,
    pub text: String,
}

impl TranscriptEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.audio_path,
            self.speaker,
            self.language.to_uppercase(),
            sanitize_text(&self.text)
        )
    }

    /// Parse `path|speaker|LANG|text`; the text may itself contain `|`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, '|');
        let audio_path = parts.next()?.trim();
        let speaker = parts.next()?.trim();
        let language = parts.next()?.trim();
        let text = parts.next()?.trim();
        if audio_path.is_empty() {
            return None;
        }
        Some(Self {
            audio_path: audio_path.to_string(),
            speaker: speaker.to_string(),
            language: language.to_string(),
            text: text.to_string(),
        })
    }

    /// File name of the referenced clip
    pub fn file_name(&self) -> String {
        file_name_of(&self.audio_path)
    }
}

/// Text fit for the last manifest field: one line, no field separators
fn sanitize_text(text: &str) -> String {
    text.replace(['\n', '\r', '|'], " ").trim().to_string()
}

/// Final path component of a path string
pub fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

pub fn write_manifest(path: &Path, entries: &[TranscriptEntry]) -> VoiceResult<()> {
    let mut body = entries
        .iter()
        .map(TranscriptEntry::to_line)
        .collect::<Vec<_>>()
        .join("\n");
    body.push('\n');
    std::fs::write(path, body)
        .map_err(|e| VoiceError::io(format!("writing manifest {}", path.display()), e))
}

pub fn read_manifest(path: &Path) -> VoiceResult<Vec<TranscriptEntry>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| VoiceError::io(format!("reading manifest {}", path.display()), e))?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(TranscriptEntry::parse)
        .collect())
}

/// First-column keys of a tab-separated feature table, header rows skipped
pub fn table_keys(path: &Path) -> VoiceResult<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| VoiceError::io(format!("reading table {}", path.display()), e))?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| l.split('\t').next())
        .map(|key| file_name_of(key.trim()))
        .filter(|key| key != "item_name")
        .collect())
}

/// Number of data rows in a feature table
pub fn count_rows(path: &Path) -> VoiceResult<usize> {
    Ok(table_keys(path)?.len())
}

/// Expected names that do not appear in `present`, in expected order
pub fn missing_names(expected: &[String], present: &[String]) -> Vec<String> {
    let present: HashSet<&str> = present.iter().map(String::as_str).collect();
    expected
        .iter()
        .filter(|name| !present.contains(name.as_str()))
        .cloned()
        .collect()
}

/// Number of non-empty lines in a text file
pub fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
