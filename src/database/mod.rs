// Database module for the speaker store
// Provides SQLite persistence for speakers, their samples and trained models

pub mod manager;
pub mod migrations;
pub mod models;
pub mod speakers_repo;

pub use manager::DatabaseManager;
pub use models::*;
