pub mod analyzer;
pub mod blob;
pub mod config;
pub mod db;
pub mod ingest;
pub mod selector;

/// Audio file extensions accepted on import
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "wav",
    // Transcoded through ffmpeg
    "flac", "ogg", "m4a", "aac", "opus",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "autodj";
