// Reference audio selection
// Scores a speaker's samples and picks the clips that condition synthesis

pub mod scorer;

pub use scorer::{
    score_sample, select_references, ReferenceSelection, ScoredReference, MAX_REFERENCE_SECS,
    MIN_REFERENCE_SECS,
};
