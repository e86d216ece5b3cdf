use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have defaults, so the config file is optional.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding imported audio blobs (overrides XDG default).
    pub library_dir: Option<PathBuf>,
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel analysis workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub decoder: DecoderConfig,
    pub dj: DjConfig,
}

/// External decode tool settings.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    /// ffmpeg-compatible program, looked up on PATH if not absolute.
    pub program: PathBuf,
    /// Root for per-decode scratch workspaces (system temp dir if unset).
    pub scratch_dir: Option<PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            scratch_dir: None,
        }
    }
}

/// Selection defaults.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DjConfig {
    pub target_energy: f64,
    /// Let trashed tracks be picked and analyzed.
    pub include_deleted: bool,
}

impl Default for DjConfig {
    fn default() -> Self {
        Self {
            target_energy: 0.6,
            include_deleted: false,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/autodj/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from an explicit path, falling back to defaults on error.
    pub fn load_from(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str::<AppConfig>(&contents) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn data_dir() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("", "", crate::APP_NAME)?;
    let data_dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir).ok();
    Some(data_dir)
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    match data_dir() {
        Some(dir) => dir.join("autodj.db"),
        // Fallback: current directory
        None => PathBuf::from("autodj.db"),
    }
}

/// Resolve the default audio library directory using XDG data directory.
pub fn default_library_dir() -> PathBuf {
    match data_dir() {
        Some(dir) => dir.join("audio"),
        None => PathBuf::from("audio"),
    }
}
