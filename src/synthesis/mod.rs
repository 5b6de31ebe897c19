// Speech synthesis
// Inference service client and the dispatcher choosing a generation path

pub mod client;
pub mod dispatcher;

pub use client::{InferenceClient, SovitsApiClient, TtsRequest};
pub use dispatcher::{
    estimate_placeholder_duration, normalize_language, SynthesisDispatcher, SynthesisMode,
    SynthesisResult,
};
