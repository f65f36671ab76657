//! Dataset module for the booru dataset builder
//! Crawls posts off an image board and enriches them with model-derived text

pub mod batch_runner;
pub mod caption_stage;
pub mod config_loader;
pub mod crawl_driver;
pub mod detect_stage;
pub mod directory_walker;
pub mod image_normalizer;
pub mod inference;
pub mod logger;
pub mod post_fetcher;
pub mod postprocess;
pub mod score_stage;
pub mod stage;
pub mod tag_set;
pub mod wash_stage;

// Re-export commonly used types for convenience
pub use config_loader::{
    AppConfig, BBoxConfig, ConfigError, ConfigManager, ConfigResult, InferenceConfig,
    LoggingConfig, ScorerConfig, SpiderConfig, TaggerConfig, WasherConfig,
};

// Re-export the stages
pub use caption_stage::CaptionStage;
pub use crawl_driver::CrawlDriver;
pub use detect_stage::DetectStage;
pub use score_stage::ScoreStage;
pub use wash_stage::wash_tree;

pub use image_normalizer::ImageNormalizer;
pub use inference::HttpInferenceClient;
pub use logger::init_logger;
pub use post_fetcher::BooruFetcher;
pub use stage::{RunSummary, StageError};
