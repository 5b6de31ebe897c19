// WAV file I/O - probing uploaded samples and writing placeholder clips
use anyhow::{Context, Result};
use std::path::Path;

/// Sample rate of generated placeholder clips
pub const PLACEHOLDER_SAMPLE_RATE: u32 = 32000;

/// Basic properties of a WAV file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavInfo {
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Read the header of a WAV file and compute its duration
pub fn probe_wav(path: &Path) -> Result<WavInfo> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to read WAV file '{}'", path.display()))?;

    let spec = reader.spec();
    if spec.sample_rate == 0 {
        anyhow::bail!("WAV file '{}' declares a zero sample rate", path.display());
    }

    // duration() counts frames, independent of channel count
    let frames = reader.duration();
    Ok(WavInfo {
        duration: frames as f64 / spec.sample_rate as f64,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Write a silent mono 16-bit clip of the given length
pub fn write_silence(path: &Path, seconds: f64, sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file '{}'", path.display()))?;

    let frames = (seconds.max(0.0) * sample_rate as f64).round() as u64;
    for _ in 0..frames {
        writer.write_sample(0i16)?;
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_silence_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("silence.wav");

        write_silence(&path, 1.5, PLACEHOLDER_SAMPLE_RATE).unwrap();
        let info = probe_wav(&path).unwrap();

        assert_eq!(info.sample_rate, 32000);
        assert_eq!(info.channels, 1);
        assert!((info.duration - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_probe_rejects_non_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fake.wav");
        std::fs::write(&path, b"not a wav").unwrap();
        assert!(probe_wav(&path).is_err());
    }
}
