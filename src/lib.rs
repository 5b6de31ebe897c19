// Voice-Studio - Speaker voice-model training and synthesis orchestration
//
// Drives an external GPT-SoVITS toolkit:
// - Speaker store (SQLite metadata + per-speaker sample files)
// - Two-stage training pipeline run as background jobs
// - Reference clip scoring and synthesis dispatch

// Stage logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

// Core modules
pub mod audio;
pub mod config;
pub mod database;
pub mod error;
pub mod reference;
pub mod speakers;
pub mod state;
pub mod synthesis;
pub mod training;

pub use config::AppConfig;
pub use error::{VoiceError, VoiceResult};
pub use state::VoiceService;

use env_logger::Env;

/// Initialize logging; `RUST_LOG` overrides the default `info` level
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
