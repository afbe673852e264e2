//! Runtime settings.
//!
//! Everything is read from the environment (after `.env` is loaded in `main`).
//! Unparsable values fall back to their defaults with a warning.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_LLM_MODEL: &str = "google/gemini-2.5-flash";

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub upload: UploadSettings,
    pub ocr: OcrSettings,
    pub batch: BatchSettings,
    pub llm: Option<LlmSettings>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Where uploaded and reassembled files are written.
    pub dir: PathBuf,
    pub max_file_size: u64,
    /// Chunk size suggested to clients on `/upload/init`.
    pub chunk_size: u64,
    /// Idle time after which an unfinished session is swept. `None` disables the sweep.
    pub session_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub tesseract_cmd: String,
    pub timeout: Duration,
    pub default_language: String,
    pub default_config: String,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        let ttl_secs: u64 = parse_env_or("UPLOAD_SESSION_TTL_SECS", 3600);

        Self {
            server: ServerSettings {
                host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_env_or("API_PORT", 5000),
            },
            upload: UploadSettings {
                dir: env_non_empty("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(env::temp_dir),
                max_file_size: parse_env_or("MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE),
                chunk_size: parse_env_or("UPLOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
                session_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
                sweep_interval: Duration::from_secs(
                    parse_env_or("UPLOAD_SWEEP_INTERVAL_SECS", 60u64).max(1),
                ),
            },
            ocr: OcrSettings {
                tesseract_cmd: env_non_empty("TESSERACT_CMD")
                    .unwrap_or_else(|| "tesseract".to_string()),
                timeout: Duration::from_secs(parse_env_or("OCR_TIMEOUT_SECS", 120)),
                default_language: env_non_empty("OCR_DEFAULT_LANGUAGE")
                    .unwrap_or_else(|| "eng".to_string()),
                default_config: env_non_empty("OCR_DEFAULT_CONFIG")
                    .unwrap_or_else(|| "--psm 6".to_string()),
            },
            batch: BatchSettings {
                workers: parse_env_or("BATCH_WORKERS", 2usize).max(1),
            },
            llm: LlmSettings::from_env(),
        }
    }
}

impl LlmSettings {
    /// Present only when an API key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = env_non_empty("OPENROUTER_API_KEY").or_else(|| env_non_empty("GEMINI_API_KEY"))?;
        Some(Self::with_key(api_key))
    }

    /// Settings for an explicitly supplied key, other fields from the environment.
    pub fn with_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: env_non_empty("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            base_url: env_non_empty("LLM_BASE_URL"),
            timeout: Duration::from_secs(parse_env_or("LLM_TIMEOUT_SECS", 120)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            upload: UploadSettings {
                dir: env::temp_dir(),
                max_file_size: DEFAULT_MAX_FILE_SIZE,
                chunk_size: DEFAULT_CHUNK_SIZE,
                session_ttl: Some(Duration::from_secs(3600)),
                sweep_interval: Duration::from_secs(60),
            },
            ocr: OcrSettings {
                tesseract_cmd: "tesseract".to_string(),
                timeout: Duration::from_secs(120),
                default_language: "eng".to_string(),
                default_config: "--psm 6".to_string(),
            },
            batch: BatchSettings { workers: 2 },
            llm: None,
        }
    }
}
