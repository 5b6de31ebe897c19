// Trained artifact discovery
// Locates checkpoints and exported weights the trainers leave behind

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

static EPOCH_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_e(\d+)").expect("Invalid regex"));

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_files(&path, true, out);
            }
        } else {
            out.push(path);
        }
    }
}

/// Most recently modified file with `ext` anywhere under `dir`
pub fn newest_with_extension(dir: &Path, ext: &str) -> Option<PathBuf> {
    let mut files = Vec::new();
    collect_files(dir, true, &mut files);
    files
        .into_iter()
        .filter(|p| has_extension(p, ext))
        .max_by(|a, b| modified(a).cmp(&modified(b)).then_with(|| a.cmp(b)))
}

/// Epoch number encoded as `_e<N>` in a weight file name
pub fn epoch_of(name: &str) -> Option<u32> {
    EPOCH_SUFFIX
        .captures_iter(name)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Exported stage-2 weight for `speaker` with the highest epoch
pub fn find_exported_weight(dir: &Path, speaker: &str) -> Option<PathBuf> {
    let mut files = Vec::new();
    collect_files(dir, false, &mut files);
    files
        .into_iter()
        .filter(|p| has_extension(p, "pth"))
        .filter_map(|p| {
            let name = file_name(&p);
            if name.starts_with("G_") || name.starts_with("D_") || !name.contains(speaker) {
                return None;
            }
            epoch_of(&name).map(|epoch| (epoch, p))
        })
        .max_by(|(a, pa), (b, pb)| a.cmp(b).then_with(|| pa.cmp(pb)))
        .map(|(_, p)| p)
}

/// Newest raw generator checkpoint (`G_*.pth`)
pub fn newest_generator_checkpoint(dir: &Path) -> Option<PathBuf> {
    let mut files = Vec::new();
    collect_files(dir, false, &mut files);
    files
        .into_iter()
        .filter(|p| has_extension(p, "pth") && file_name(p).starts_with("G_"))
        .max_by(|a, b| modified(a).cmp(&modified(b)).then_with(|| a.cmp(b)))
}
