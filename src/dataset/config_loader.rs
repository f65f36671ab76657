//! Configuration for the dataset pipeline
//!
//! This module provides functionality for:
//! 1. Loading `config.toml` into one typed section per pipeline stage
//! 2. Writing a default config file when none exists
//! 3. Validating every section eagerly so bad settings fail at startup

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::image_normalizer::TargetFormat;

/// Default name of the configuration file.
pub const CONFIG_NAME: &str = "config.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("latest_id ({latest_id}) must be smaller than max_id ({max_id})")]
    InvalidRange { latest_id: u64, max_id: u64 },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings for crawling posts off the image board.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SpiderConfig {
    pub domain: String,
    pub protocol: String,
    pub file_save_location: PathBuf,
    /// Pixel ceiling (width * height) for saved images.
    pub max_res: u64,
    /// First post id to crawl (inclusive).
    pub latest_id: u64,
    /// Last post id to crawl (exclusive).
    pub max_id: u64,
    pub target_format: String,
    pub user_agent: String,
    /// 0 disables the request timeout.
    pub timeout_secs: u64,
    /// Tags replaced in place while building the tag set (`from = "to"`).
    pub tag_rewrites: BTreeMap<String, String>,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            domain: "danbooru.donmai.us".to_string(),
            protocol: "https".to_string(),
            file_save_location: PathBuf::from("./data/dataset"),
            max_res: 2048 * 2048,
            latest_id: 9_182_170,
            max_id: 9_182_175,
            target_format: "png".to_string(),
            user_agent: format!("booru_dataset/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 60,
            tag_rewrites: BTreeMap::new(),
        }
    }
}

impl SpiderConfig {
    /// The ids to crawl, ascending, `max_id` excluded.
    pub fn id_range(&self) -> std::ops::Range<u64> {
        self.latest_id..self.max_id
    }

    /// Parsed encode format. Only valid after [`AppConfig::validate`].
    pub fn format(&self) -> ConfigResult<TargetFormat> {
        TargetFormat::from_config_string(&self.target_format).ok_or_else(|| ConfigError::Invalid {
            field: "spider.target_format",
            reason: format!(
                "`{}` is not a lossless format (expected png, webp or tiff)",
                self.target_format
            ),
        })
    }
}

/// Settings for the natural-language captioning stage.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TaggerConfig {
    pub image_folder: PathBuf,
    pub output_folder: PathBuf,
    pub batch_size: usize,
    pub overwrite: bool,
    pub filter_format: Vec<String>,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            image_folder: PathBuf::from("./data/dataset"),
            output_folder: PathBuf::from("./data/ntags"),
            batch_size: 2,
            overwrite: false,
            filter_format: vec!["png".to_string()],
        }
    }
}

/// Settings for the quality scoring stage.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScorerConfig {
    pub image_folder: PathBuf,
    pub batch_size: usize,
    pub filter_format: Vec<String>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            image_folder: PathBuf::from("./data/dataset"),
            batch_size: 8,
            filter_format: vec!["png".to_string(), "jpg".to_string(), "webp".to_string()],
        }
    }
}

/// Settings for the subject position stage.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BBoxConfig {
    pub image_folder: PathBuf,
    /// Root holding existing tag files used as captioning hints.
    pub txt_folder: PathBuf,
    /// Root for intermediate captions.
    pub nlp_out: PathBuf,
    /// Root for the final tag files.
    pub tag_out: PathBuf,
    pub filter_format: Vec<String>,
    pub overwrite: bool,
    pub keep_intermediate: bool,
}

impl Default for BBoxConfig {
    fn default() -> Self {
        Self {
            image_folder: PathBuf::from("./data/dataset"),
            txt_folder: PathBuf::from("./data/dataset"),
            nlp_out: PathBuf::from("./data/nlp"),
            tag_out: PathBuf::from("./data/tags"),
            filter_format: vec!["png".to_string()],
            overwrite: false,
            keep_intermediate: false,
        }
    }
}

/// Settings for the in-place metadata washer.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WasherConfig {
    pub image_folder: PathBuf,
    pub filter_format: Vec<String>,
}

impl Default for WasherConfig {
    fn default() -> Self {
        Self {
            image_folder: PathBuf::from("./data"),
            filter_format: vec!["png".to_string()],
        }
    }
}

/// Where the external models are served.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    pub endpoint: String,
    /// 0 disables the request timeout.
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_format: String,
    pub log_directory: PathBuf,
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "line".to_string(),
            log_directory: PathBuf::from("./logs"),
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Return a failing exit status when any item of a run failed.
    pub strict_exit: bool,
    pub spider: SpiderConfig,
    pub tagger: TaggerConfig,
    pub scorer: ScorerConfig,
    pub bbox: BBoxConfig,
    pub washer: WasherConfig,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Checks every section, failing on the first bad value.
    pub fn validate(&self) -> ConfigResult<()> {
        let spider = &self.spider;
        if spider.latest_id >= spider.max_id {
            return Err(ConfigError::InvalidRange {
                latest_id: spider.latest_id,
                max_id: spider.max_id,
            });
        }
        if spider.domain.trim().is_empty() {
            return Err(invalid("spider.domain", "must not be empty"));
        }
        if !matches!(spider.protocol.as_str(), "http" | "https") {
            return Err(invalid(
                "spider.protocol",
                format!("`{}` is not http or https", spider.protocol),
            ));
        }
        if spider.max_res == 0 {
            return Err(invalid("spider.max_res", "must be greater than zero"));
        }
        spider.format()?;

        for (field, size) in [
            ("tagger.batch_size", self.tagger.batch_size),
            ("scorer.batch_size", self.scorer.batch_size),
        ] {
            if size == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        for (field, filter) in [
            ("tagger.filter_format", &self.tagger.filter_format),
            ("scorer.filter_format", &self.scorer.filter_format),
            ("bbox.filter_format", &self.bbox.filter_format),
            ("washer.filter_format", &self.washer.filter_format),
        ] {
            if filter.iter().all(|ext| ext.trim().is_empty()) {
                return Err(invalid(field, "must list at least one extension"));
            }
        }

        if self.inference.endpoint.trim().is_empty() {
            return Err(invalid("inference.endpoint", "must not be empty"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Loads and validates the configuration file.
pub struct ConfigManager {
    config_path: PathBuf,
    app_config: AppConfig,
    created_default: bool,
}

impl ConfigManager {
    /// Loads the config at `config_path`, creating a default one if it is missing.
    pub fn load(config_path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();

        let created_default = !config_path.exists();
        let app_config = if created_default {
            let default_config = AppConfig::default();
            Self::write_config(&config_path, &default_config)?;
            default_config
        } else {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        };

        app_config.validate()?;

        Ok(Self {
            config_path,
            app_config,
            created_default,
        })
    }

    fn write_config(path: &Path, config: &AppConfig) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let toml_string =
            toml::to_string_pretty(config).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Whether `load` found no file and wrote the defaults.
    ///
    /// Loading happens before logging is installed, so the caller reports this.
    pub fn created_default(&self) -> bool {
        self.created_default
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn into_app_config(self) -> AppConfig {
        self.app_config
    }
}
