// Speaker store
// Durable record of speakers, their samples and training outcomes

pub mod store;

pub use store::{validate_speaker_name, SpeakerStore};
