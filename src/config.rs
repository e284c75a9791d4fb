//! Runtime configuration and the read-only settings seam

use crate::error::{MaktabError, Result};
use crate::quran::{reciter_id, ReciterId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.quran.com/api/v4";
const DEFAULT_AUDIO_CDN: &str = "https://verses.quran.com/";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const CONFIG_FILE_NAME: &str = "config.json";
const DATABASE_FILE_NAME: &str = "offline.db";

/// Pacing knobs for bulk downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Text job pauses after every this many pages.
    pub text_batch_size: u16,
    pub text_batch_pause_ms: u64,
    /// Pause between pages while pre-caching a chapter's text.
    pub page_pause_ms: u64,
    /// Pause between verse payload downloads.
    pub verse_pause_ms: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            text_batch_size: 10,
            text_batch_pause_ms: 50,
            page_pause_ms: 5,
            verse_pause_ms: 10,
        }
    }
}

impl DownloadOptions {
    /// No pauses at all, for tests and scripted runs.
    pub fn unpaced() -> Self {
        Self {
            text_batch_pause_ms: 0,
            page_pause_ms: 0,
            verse_pause_ms: 0,
            ..Self::default()
        }
    }

    pub(crate) fn text_batch_pause(&self) -> Duration {
        Duration::from_millis(self.text_batch_pause_ms)
    }

    pub(crate) fn page_pause(&self) -> Duration {
        Duration::from_millis(self.page_pause_ms)
    }

    pub(crate) fn verse_pause(&self) -> Duration {
        Duration::from_millis(self.verse_pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub api_base: String,
    pub audio_cdn: String,
    pub request_timeout_secs: u64,
    /// Upper bound for the offline database, if any.
    pub quota_bytes: Option<u64>,
    /// Reciter slug, see [`crate::quran::RECITERS`].
    pub reciter: String,
    pub translation_lang: String,
    pub download: DownloadOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            api_base: DEFAULT_API_BASE.to_string(),
            audio_cdn: DEFAULT_AUDIO_CDN.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            quota_bytes: None,
            reciter: "mishary-rashid".to_string(),
            translation_lang: "en".to_string(),
            download: DownloadOptions::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then a JSON file, then environment overrides.
    ///
    /// With no explicit path, `<data_dir>/config.json` is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = get_data_dir().join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| MaktabError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| MaktabError::Config(format!("Failed to parse {:?}: {}", path, e)))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var("MAKTAB_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(base) = var("MAKTAB_API_BASE") {
            self.api_base = base;
        }
        if let Some(cdn) = var("MAKTAB_AUDIO_CDN") {
            self.audio_cdn = cdn;
        }
        if let Some(reciter) = var("MAKTAB_RECITER") {
            self.reciter = reciter;
        }
        if let Some(lang) = var("MAKTAB_LANG") {
            self.translation_lang = lang;
        }
        if let Some(quota) = var("MAKTAB_QUOTA_BYTES") {
            let bytes = quota
                .parse()
                .map_err(|_| MaktabError::Config(format!("Invalid MAKTAB_QUOTA_BYTES: {}", quota)))?;
            self.quota_bytes = Some(bytes);
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Get the data directory
///
/// Platform data directory (`~/.local/share/Maktab`, `~/Library/Application Support/Maktab`, ...)
/// when one exists, otherwise `./data`.
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("Maktab"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Read access to the user's small settings.
///
/// The persistence of these settings belongs to the UI shell; the offline
/// layer only needs the current reciter and translation language.
pub trait SettingsSource: Send + Sync {
    fn reciter_id(&self) -> ReciterId;
    fn translation_lang(&self) -> String;
}

/// Settings fixed at startup from [`Config`].
#[derive(Debug, Clone)]
pub struct StaticSettings {
    reciter_id: ReciterId,
    translation_lang: String,
}

impl StaticSettings {
    pub fn new(reciter_id: ReciterId, translation_lang: impl Into<String>) -> Self {
        Self {
            reciter_id,
            translation_lang: translation_lang.into(),
        }
    }
}

impl From<&Config> for StaticSettings {
    fn from(config: &Config) -> Self {
        Self::new(reciter_id(&config.reciter), config.translation_lang.clone())
    }
}

impl SettingsSource for StaticSettings {
    fn reciter_id(&self) -> ReciterId {
        self.reciter_id
    }

    fn translation_lang(&self) -> String {
        self.translation_lang.clone()
    }
}
