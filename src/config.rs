use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as number: {source}")]
    ParseNum {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
///
/// The archive root resolves in priority order: `SOCMED_DATA_DIR`, then a
/// directory next to the executable that already contains `data/`, then the
/// current working directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Archive root. Everything durable lives under `<root>/data/`.
    pub data_root: PathBuf,

    /// Netscape-format cookies file exported from the browser.
    pub cookies_file: PathBuf,

    /// API host. Overridable so tests can point at a mock server.
    pub api_base_url: String,

    // External tools (extraction pipeline)
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub whisper_path: String,
    pub whisper_model: Option<PathBuf>,
    pub tesseract_path: String,

    // Timeouts
    pub http_timeout_secs: u64,
    pub media_timeout_secs: u64,
    pub ffmpeg_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_root = resolve_data_root();
        let cookies_file = optional_env("SOCMED_COOKIES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("credentials").join("instagram").join("cookies.txt"));

        Ok(Self {
            data_root,
            cookies_file,
            api_base_url: env_or_default("SOCMED_API_BASE_URL", crate::constants::IG_BASE_URL),
            ffmpeg_path: env_or_default("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: env_or_default("FFPROBE_PATH", "ffprobe"),
            whisper_path: env_or_default("WHISPER_PATH", "whisper-cli"),
            whisper_model: optional_env("WHISPER_MODEL").map(PathBuf::from),
            tesseract_path: env_or_default("TESSERACT_PATH", "tesseract"),
            http_timeout_secs: parse_env_u64("SOCMED_HTTP_TIMEOUT_SECS", 15)?,
            media_timeout_secs: parse_env_u64("SOCMED_MEDIA_TIMEOUT_SECS", 30)?,
            ffmpeg_timeout_secs: parse_env_u64("SOCMED_FFMPEG_TIMEOUT_SECS", 60)?,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("SOCMED_HTTP_TIMEOUT_SECS", self.http_timeout_secs),
            ("SOCMED_MEDIA_TIMEOUT_SECS", self.media_timeout_secs),
            ("SOCMED_FFMPEG_TIMEOUT_SECS", self.ffmpeg_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Configuration for tests: everything rooted under one directory, tool
    /// paths pointing nowhere so no subprocess can accidentally run.
    #[must_use]
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            data_root: root.to_path_buf(),
            cookies_file: root.join("cookies.txt"),
            api_base_url: crate::constants::IG_BASE_URL.to_string(),
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            whisper_path: "/nonexistent/whisper-cli".to_string(),
            whisper_model: None,
            tesseract_path: "/nonexistent/tesseract".to_string(),
            http_timeout_secs: 5,
            media_timeout_secs: 5,
            ffmpeg_timeout_secs: 5,
        }
    }

    /// Path of the saved-posts archive file.
    #[must_use]
    pub fn saved_posts_path(&self) -> PathBuf {
        self.data_root
            .join("data")
            .join("instagram")
            .join("saved_posts.json")
    }

    /// Path of the sync-cursor store.
    #[must_use]
    pub fn sync_state_path(&self) -> PathBuf {
        self.data_root.join("data").join("sync_state.json")
    }

    /// Root directory for downloaded media bytes.
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.data_root.join("data").join("media")
    }
}

fn resolve_data_root() -> PathBuf {
    if let Some(dir) = optional_env("SOCMED_DATA_DIR") {
        return PathBuf::from(dir);
    }

    // A data/ layout next to the binary wins over the working directory.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            if parent.join("data").is_dir() {
                return parent.to_path_buf();
            }
        }
    }

    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseNum {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_u64_default() {
        assert_eq!(parse_env_u64("SOCMED_NONEXISTENT_VAR", 42).unwrap(), 42);
    }

    #[test]
    fn test_data_paths() {
        let config = Config {
            data_root: PathBuf::from("/tmp/archive"),
            cookies_file: PathBuf::from("/tmp/cookies.txt"),
            api_base_url: crate::constants::IG_BASE_URL.to_string(),
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            whisper_path: "whisper-cli".into(),
            whisper_model: None,
            tesseract_path: "tesseract".into(),
            http_timeout_secs: 15,
            media_timeout_secs: 30,
            ffmpeg_timeout_secs: 60,
        };
        assert_eq!(
            config.saved_posts_path(),
            PathBuf::from("/tmp/archive/data/instagram/saved_posts.json")
        );
        assert_eq!(
            config.sync_state_path(),
            PathBuf::from("/tmp/archive/data/sync_state.json")
        );
        assert_eq!(config.media_dir(), PathBuf::from("/tmp/archive/data/media"));
    }
}
