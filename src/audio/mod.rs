// Audio file helpers

pub mod wav;

pub use wav::{probe_wav, write_silence, WavInfo, PLACEHOLDER_SAMPLE_RATE};
