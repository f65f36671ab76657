//! Post page fetching for the image board
//!
//! One post page is fetched per id and reduced to a [`PostRecord`]: the
//! original image URL, the credited artists and the categorized tags.

use std::collections::BTreeMap;
use std::time::Duration;

use lazy_static::lazy_static;
use reqwest::Url;
use reqwest::blocking::Client;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::dataset::SpiderConfig;
use crate::dataset::tag_set::TagSet;

/// Partition used when a post credits no artist.
pub const UNKNOWN_ARTIST: &str = "unknown";

lazy_static! {
    static ref ORIGINAL_LINK: Selector = Selector::parse("a.image-view-original-link").unwrap();
    static ref MAIN_IMAGE: Selector = Selector::parse("#image").unwrap();
    static ref ARTIST_LIST: Selector = Selector::parse("ul.artist-tag-list").unwrap();
    static ref TAG_LIST: Selector = Selector::parse(".tag-list.categorized-tag-list").unwrap();
    static ref SEARCH_TAG: Selector = Selector::parse(".search-tag").unwrap();
}

/// Error types for fetching a post
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Everything extracted from one post page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub id: u64,
    pub image_url: String,
    pub artists: Vec<String>,
    pub tags: Vec<String>,
}

impl PostRecord {
    /// First credited artist, if any.
    pub fn artist(&self) -> Option<&str> {
        self.artists.first().map(String::as_str)
    }

    /// Destination folder name for this post.
    pub fn partition(&self) -> String {
        match self.artist() {
            Some(artist) => {
                let sanitized = sanitize_filename(artist);
                if sanitized.trim().is_empty() {
                    UNKNOWN_ARTIST.to_string()
                } else {
                    sanitized
                }
            }
            None => UNKNOWN_ARTIST.to_string(),
        }
    }

    /// Tag file contents.
    pub fn tag_line(&self) -> String {
        self.tags.join(",")
    }
}

/// A remote source of posts and their image bytes.
pub trait PostSource {
    fn fetch_post(&mut self, id: u64) -> FetchResult<PostRecord>;

    fn fetch_image(&mut self, url: &str) -> FetchResult<Vec<u8>>;
}

/// Fetches post pages over HTTP(S).
pub struct BooruFetcher {
    client: Client,
    protocol: String,
    domain: String,
    tag_rewrites: BTreeMap<String, String>,
}

impl BooruFetcher {
    pub fn new(config: &SpiderConfig) -> FetchResult<Self> {
        let timeout = match config.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            protocol: config.protocol.clone(),
            domain: config.domain.clone(),
            tag_rewrites: config.tag_rewrites.clone(),
        })
    }

    /// Page URL for a post id.
    pub fn post_url(&self, id: u64) -> String {
        format!("{}://{}/posts/{}", self.protocol, self.domain, id)
    }

    fn get_bytes(&self, url: &str) -> FetchResult<Vec<u8>> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        Ok(response.bytes()?.to_vec())
    }
}

impl PostSource for BooruFetcher {
    #[instrument(skip(self))]
    fn fetch_post(&mut self, id: u64) -> FetchResult<PostRecord> {
        let url = self.post_url(id);
        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        let body = response.text()?;

        let mut record = parse_post_page(id, &body, &self.tag_rewrites)?;
        record.image_url = resolve_url(&url, &record.image_url)?;
        debug!(post_id = id, image_url = %record.image_url, "Resolved image URL");
        Ok(record)
    }

    fn fetch_image(&mut self, url: &str) -> FetchResult<Vec<u8>> {
        self.get_bytes(url)
    }
}

/// Extracts a [`PostRecord`] from a post page.
///
/// A missing artist list yields no artists; a missing tag list is an error.
pub fn parse_post_page(
    id: u64,
    html: &str,
    tag_rewrites: &BTreeMap<String, String>,
) -> FetchResult<PostRecord> {
    let document = Html::parse_document(html);

    let image_url = match document.select(&ORIGINAL_LINK).next() {
        Some(link) => link
            .value()
            .attr("href")
            .map(str::to_string)
            .ok_or_else(|| FetchError::Parse("original image link has no href".to_string()))?,
        None => {
            let image = document
                .select(&MAIN_IMAGE)
                .next()
                .ok_or_else(|| FetchError::Parse("no image element on page".to_string()))?;
            let src = image
                .value()
                .attr("src")
                .ok_or_else(|| FetchError::Parse("image element has no src".to_string()))?;
            original_from_sample(src)
        }
    };

    let artists = match document.select(&ARTIST_LIST).next() {
        Some(list) => list
            .select(&SEARCH_TAG)
            .map(|node| node.text().collect::<String>().trim().to_string())
            .filter(|artist| !artist.is_empty())
            .collect(),
        None => Vec::new(),
    };

    let tag_list = document
        .select(&TAG_LIST)
        .next()
        .ok_or_else(|| FetchError::Parse("categorized tag list is missing".to_string()))?;
    let mut tags = TagSet::with_rewrites(tag_rewrites);
    for node in tag_list.select(&SEARCH_TAG) {
        tags.insert(&node.text().collect::<String>());
    }
    if tags.is_empty() {
        debug!(post_id = id, "post has an empty tag list");
    }

    Ok(PostRecord {
        id,
        image_url,
        artists,
        tags: tags.into_vec(),
    })
}

/// Rewrites a sample-resolution URL to its original-resolution form.
pub fn original_from_sample(src: &str) -> String {
    src.replace("sample-", "").replace("/sample/", "/original/")
}

fn resolve_url(page_url: &str, image_url: &str) -> FetchResult<String> {
    let base = Url::parse(page_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    base.join(image_url)
        .map(|url| url.to_string())
        .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", image_url, e)))
}

/// Sanitize a filename to remove invalid characters
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    let mut result = name.trim().to_string();

    for c in invalid_chars {
        result = result.replace(c, "_");
    }

    // Keep folder names short enough for every filesystem
    if result.chars().count() > 100 {
        result = result.chars().take(100).collect();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> String {
        format!("<html><body>{}</body></html>", body)
    }

    const TAGS: &str = r#"
        <section class="tag-list categorized-tag-list">
            <ul class="general-tag-list">
                <li><a class="search-tag" href="/posts?tags=long_hair">long_hair</a></li>
                <li><a class="search-tag" href="/posts?tags=smile">smile</a></li>
                <li><a class="search-tag" href="/posts?tags=long_hair">long_hair</a></li>
                <li><a class="search-tag" href="/posts?tags=1girl">1girl</a></li>
            </ul>
        </section>"#;

    #[test]
    fn test_prefers_original_link() {
        let html = page(&format!(
            r#"<a class="image-view-original-link" href="https://cdn.example/original/ab/cd/abcd.png">view original</a>
               <img id="image" src="https://cdn.example/sample/ab/cd/sample-abcd.jpg">
               <ul class="artist-tag-list"><li><a class="search-tag">some_artist</a></li></ul>
               {}"#,
            TAGS
        ));

        let record = parse_post_page(7, &html, &BTreeMap::new()).unwrap();

        assert_eq!(record.id, 7);
        assert_eq!(record.image_url, "https://cdn.example/original/ab/cd/abcd.png");
        assert_eq!(record.artists, vec!["some_artist".to_string()]);
        assert_eq!(record.tags, vec!["long hair", "smile", "1girl"]);
        assert_eq!(record.tag_line(), "long hair,smile,1girl");
    }

    #[test]
    fn test_falls_back_to_sample_image() {
        let html = page(&format!(
            r#"<img id="image" src="https://cdn.example/sample/ab/cd/sample-abcd.jpg">{}"#,
            TAGS
        ));

        let record = parse_post_page(1, &html, &BTreeMap::new()).unwrap();

        assert_eq!(record.image_url, "https://cdn.example/original/ab/cd/abcd.jpg");
    }

    #[test]
    fn test_missing_artist_list_is_tolerated() {
        let html = page(&format!(r#"<img id="image" src="/a.png">{}"#, TAGS));

        let record = parse_post_page(2, &html, &BTreeMap::new()).unwrap();

        assert!(record.artists.is_empty());
        assert_eq!(record.artist(), None);
        assert_eq!(record.partition(), UNKNOWN_ARTIST);
    }

    #[test]
    fn test_missing_tag_list_is_a_parse_error() {
        let html = page(
            r#"<img id="image" src="/a.png">
               <ul class="artist-tag-list"><li><a class="search-tag">someone</a></li></ul>"#,
        );

        assert!(matches!(
            parse_post_page(3, &html, &BTreeMap::new()),
            Err(FetchError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_image_is_a_parse_error() {
        let html = page(TAGS);

        assert!(matches!(
            parse_post_page(4, &html, &BTreeMap::new()),
            Err(FetchError::Parse(_))
        ));
    }

    #[test]
    fn test_tag_rewrites_apply_during_extraction() {
        let html = page(&format!(r#"<img id="image" src="/a.png">{}"#, TAGS));
        let mut rewrites = BTreeMap::new();
        rewrites.insert("smile".to_string(), "smiling".to_string());

        let record = parse_post_page(5, &html, &rewrites).unwrap();

        assert_eq!(record.tags, vec!["long hair", "smiling", "1girl"]);
    }

    #[test]
    fn test_partition_is_sanitized() {
        let record = PostRecord {
            id: 9,
            image_url: String::new(),
            artists: vec!["ac/dc".to_string(), "second".to_string()],
            tags: Vec::new(),
        };
        assert_eq!(record.partition(), "ac_dc");
    }

    #[test]
    fn test_relative_image_url_is_resolved() {
        let resolved = resolve_url("https://board.example/posts/5", "/data/original/a.png").unwrap();
        assert_eq!(resolved, "https://board.example/data/original/a.png");

        let absolute = resolve_url("https://board.example/posts/5", "https://cdn.example/a.png").unwrap();
        assert_eq!(absolute, "https://cdn.example/a.png");
    }

    #[test]
    fn test_post_url_shape() {
        let fetcher = BooruFetcher::new(&SpiderConfig::default()).unwrap();
        assert_eq!(fetcher.post_url(42), "https://danbooru.donmai.us/posts/42");
    }
}
