use std::fmt;
use std::io::{self, IsTerminal};

use anyhow::{Context, Error, bail};
use console::{Term, style};
use dialoguer::{Select, theme::ColorfulTheme};
use tracing::{info, trace};

use crate::dataset::{
    AppConfig, BooruFetcher, CaptionStage, CrawlDriver, DetectStage, HttpInferenceClient,
    ImageNormalizer, RunSummary, ScoreStage, wash_tree,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// One pipeline stage, selectable from the command line or the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Crawl,
    Caption,
    Score,
    Detect,
    Wash,
}

impl Stage {
    pub(crate) const ALL: [Stage; 5] = [
        Stage::Crawl,
        Stage::Caption,
        Stage::Score,
        Stage::Detect,
        Stage::Wash,
    ];

    pub(crate) fn from_arg(arg: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.name() == arg)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Stage::Crawl => "crawl",
            Stage::Caption => "caption",
            Stage::Score => "score",
            Stage::Detect => "detect",
            Stage::Wash => "wash",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Stage::Crawl => "Crawl posts into the dataset folder",
            Stage::Caption => "Caption images with natural language",
            Stage::Score => "Append aesthetic quality tags",
            Stage::Detect => "Tag subject position and booru tags",
            Stage::Wash => "Strip metadata from images in place",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8} {}", self.name(), self.description())
    }
}

/// Handles stage selection and runs one stage against the loaded config.
pub(crate) struct Program {
    config: AppConfig,
}

impl Program {
    pub(crate) fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Whether a menu can be shown.
    pub(crate) fn is_interactive_terminal() -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }

    /// Asks the user which stage to run.
    pub(crate) fn choose_stage() -> Result<Stage, Error> {
        println!("\n{}", style(format!("{} {}", NAME, VERSION)).cyan().bold());

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select a stage")
            .items(&Stage::ALL)
            .default(0)
            .interact()
            .context("Failed to read stage selection")?;

        Ok(Stage::ALL[selection])
    }

    /// Runs `stage` to completion and returns its outcome counts.
    pub(crate) fn run(&self, stage: Stage) -> Result<RunSummary, Error> {
        let _ = Term::stdout().set_title(NAME);
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        info!(stage = stage.name(), "Starting stage");

        let summary = match stage {
            Stage::Crawl => self.crawl()?,
            Stage::Caption => {
                let tagger = &self.config.tagger;
                CaptionStage::new(tagger, self.inference_client()?).process(&tagger.image_folder)
            }
            Stage::Score => {
                let scorer = &self.config.scorer;
                ScoreStage::new(scorer, self.inference_client()?).process(&scorer.image_folder)
            }
            Stage::Detect => {
                let bbox = &self.config.bbox;
                DetectStage::new(bbox, self.inference_client()?).process(&bbox.image_folder)
            }
            Stage::Wash => wash_tree(&self.config.washer, &self.config.washer.image_folder),
        };

        let headline = format!("{} finished: {}", stage.name(), summary);
        if summary.has_failures() {
            println!("{}", style(headline).yellow());
        } else {
            println!("{}", style(headline).green());
        }
        Ok(summary)
    }

    fn crawl(&self) -> Result<RunSummary, Error> {
        let spider = &self.config.spider;
        let fetcher = BooruFetcher::new(spider).context("Failed to build HTTP client")?;
        let normalizer = ImageNormalizer::from_config(spider)?;
        let ids = spider.id_range();
        info!(
            domain = %spider.domain,
            start = ids.start,
            end = ids.end,
            "Crawling into {}",
            spider.file_save_location.display()
        );

        let mut driver = CrawlDriver::new(fetcher, normalizer, &spider.file_save_location)
            .with_progress(io::stderr().is_terminal());
        Ok(driver.crawl(ids))
    }

    fn inference_client(&self) -> Result<HttpInferenceClient, Error> {
        let inference = &self.config.inference;
        HttpInferenceClient::new(inference)
            .with_context(|| format!("Failed to set up inference client for {}", inference.endpoint))
    }
}

/// Parses a stage name, listing the valid ones on failure.
pub(crate) fn parse_stage(arg: &str) -> Result<Stage, Error> {
    match Stage::from_arg(arg) {
        Some(stage) => Ok(stage),
        None => {
            let names: Vec<&str> = Stage::ALL.iter().map(Stage::name).collect();
            bail!("Unknown stage `{}`, expected one of: {}", arg, names.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(parse_stage(stage.name()).unwrap(), stage);
        }
    }

    #[test]
    fn test_unknown_stage_lists_choices() {
        let message = parse_stage("merge").unwrap_err().to_string();
        assert!(message.contains("crawl, caption, score, detect, wash"));
    }
}
