//! Reference scorer
//!
//! Pure ranking of audio samples for use as synthesis references. Only clips
//! between 3 and 10 seconds are usable; within that window a clip scores
//! higher the closer it sits to the window centre, plus a bonus for high
//! sample rates. Ordering is stable, so equal scores keep upload order.

use crate::database::models::AudioSample;
use crate::error::{VoiceError, VoiceResult};

pub const MIN_REFERENCE_SECS: f64 = 3.0;
pub const MAX_REFERENCE_SECS: f64 = 10.0;

const BASE_SCORE: f64 = 50.0;
const DURATION_BONUS: f64 = 30.0;
const SWEET_SPOT_SECS: f64 = (MIN_REFERENCE_SECS + MAX_REFERENCE_SECS) / 2.0;
const HALF_WINDOW_SECS: f64 = (MAX_REFERENCE_SECS - MIN_REFERENCE_SECS) / 2.0;

/// A sample together with its reference score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredReference {
    pub sample: AudioSample,
    pub score: f64,
}

/// Primary reference plus ranked auxiliary references
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSelection {
    pub primary: ScoredReference,
    pub auxiliary: Vec<ScoredReference>,
}

impl ReferenceSelection {
    pub fn auxiliary_paths(&self) -> Vec<String> {
        self.auxiliary
            .iter()
            .map(|r| r.sample.storage_path.clone())
            .collect()
    }
}

fn is_eligible(duration: f64) -> bool {
    (MIN_REFERENCE_SECS..=MAX_REFERENCE_SECS).contains(&duration)
}

/// Score one sample, or None when its duration is outside the reference window
pub fn score_sample(duration: f64, sample_rate: u32) -> Option<f64> {
    if !is_eligible(duration) {
        return None;
    }

    let centering = 1.0 - (duration - SWEET_SPOT_SECS).abs() / HALF_WINDOW_SECS;
    let rate_bonus = if sample_rate >= 32000 {
        20.0
    } else if sample_rate >= 22050 {
        10.0
    } else {
        0.0
    };

    Some((BASE_SCORE + DURATION_BONUS * centering + rate_bonus).clamp(0.0, 100.0))
}

/// Pick the best primary reference and up to `aux_count` auxiliary references
pub fn select_references(
    samples: &[AudioSample],
    aux_count: usize,
) -> VoiceResult<ReferenceSelection> {
    let mut ranked: Vec<ScoredReference> = samples
        .iter()
        .filter_map(|sample| {
            score_sample(sample.duration, sample.sample_rate).map(|score| ScoredReference {
                sample: sample.clone(),
                score,
            })
        })
        .collect();

    if ranked.is_empty() {
        return Err(VoiceError::NoEligibleReference {
            durations: samples.iter().map(|s| s.duration).collect(),
        });
    }

    // sort_by is stable: ties stay in upload order
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut ranked = ranked.into_iter();
    let primary = ranked.next().ok_or_else(|| VoiceError::NoEligibleReference {
        durations: samples.iter().map(|s| s.duration).collect(),
    })?;
    let auxiliary: Vec<ScoredReference> = ranked.take(aux_count).collect();

    log::debug!(
        "Selected reference {} (score {:.1}) with {} auxiliary clips",
        primary.sample.storage_path,
        primary.score,
        auxiliary.len()
    );

    Ok(ReferenceSelection { primary, auxiliary })
}
