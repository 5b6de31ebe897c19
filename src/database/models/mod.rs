// Database models - Re-exports all domain-specific models
//
// - speaker.rs: Speakers, their audio samples and trained model records

mod speaker;

pub use speaker::{
    AudioSample, ModelInfo, NewSample, Speaker, SpeakerSummary, METHOD_GPT_SOVITS_TRAINED,
};
