//! Trending-post sources.
//!
//! The Scan stage only sees [`SourceCollector`]; [`RedditCollector`] is the
//! production implementation, reading the public listing JSON of a
//! subreddit.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::TimeFilter;
use crate::errors::StageError;
use crate::item::{Payload, WorkItem, extract_text_from_title};

/// One source to scan, with its filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub subreddit: String,
    /// Posts below this score are dropped.
    pub min_score: i64,
    pub max_posts: usize,
    pub time_filter: TimeFilter,
}

impl SourceConfig {
    pub fn new(subreddit: impl Into<String>) -> Self {
        Self {
            subreddit: subreddit.into(),
            min_score: 1000,
            max_posts: 10,
            time_filter: TimeFilter::Day,
        }
    }
}

#[async_trait]
pub trait SourceCollector: Send + Sync {
    /// Fetch candidate posts. Filtering by score happens in the Scan stage.
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<WorkItem>, StageError>;
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    title: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    post_hint: Option<String>,
}

pub struct RedditCollector {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    timeout: Duration,
}

impl RedditCollector {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://www.reddit.com".to_string(),
            user_agent: user_agent.into(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn classify(&self, subreddit: &str, status: reqwest::StatusCode) -> StageError {
        let detail = format!("r/{} returned {}", subreddit, status);
        match status.as_u16() {
            429 => StageError::RateLimited(detail),
            401 | 403 => StageError::CredentialRejected(detail),
            _ => StageError::SourceUnavailable(detail),
        }
    }
}

#[async_trait]
impl SourceCollector for RedditCollector {
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<WorkItem>, StageError> {
        let url = format!("{}/r/{}/top.json", self.base_url, source.subreddit);
        tracing::debug!(subreddit = %source.subreddit, %url, "fetching listing");
        let resp = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .query(&[
                ("t", source.time_filter.to_string()),
                ("limit", source.max_posts.to_string()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                StageError::SourceUnavailable(format!("r/{}: {}", source.subreddit, e))
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(self.classify(&source.subreddit, status));
        }
        let listing: Listing = resp.json().await.map_err(|e| {
            StageError::SourceUnavailable(format!(
                "r/{} returned an unreadable listing: {}",
                source.subreddit, e
            ))
        })?;
        Ok(items_from_listing(listing, &source.subreddit))
    }
}

fn items_from_listing(listing: Listing, subreddit: &str) -> Vec<WorkItem> {
    listing
        .data
        .children
        .into_iter()
        .map(|child| {
            let post = child.data;
            let image_url = post.url.clone().filter(|url| {
                let lower = url.to_lowercase();
                post.post_hint.as_deref() == Some("image")
                    || IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
            });
            let origin = match (&post.permalink, &post.url) {
                (Some(permalink), _) => format!("https://www.reddit.com{}", permalink),
                (None, Some(url)) => url.clone(),
                (None, None) => format!("reddit:{}", post.id),
            };
            let payload = Payload {
                source: subreddit.to_string(),
                text_content: extract_text_from_title(&post.title),
                title: post.title,
                image_url,
                score: post.score,
                ..Default::default()
            };
            WorkItem::new(post.id, origin, payload)
        })
        .collect()
}
