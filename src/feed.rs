//! Release feed fetcher.
//!
//! Each tracked repository publishes an Atom feed of its releases, newest
//! entry first. Only the first entry is ever consulted.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::ReleaseEntry;

pub const DEFAULT_URL_TEMPLATE: &str = "https://{repository}/releases.atom";
const REPOSITORY_PLACEHOLDER: &str = "{repository}";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("feed {url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("feed {url} is malformed: {reason}")]
    Malformed { url: String, reason: String },
    #[error("feed {url} has no entries")]
    Empty { url: String },
    #[error("feed fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Newest release entry for `repository_id`.
    async fn fetch_latest(&self, repository_id: &str) -> Result<ReleaseEntry, FetchError>;
}

#[derive(Clone)]
pub struct HttpFeedSource {
    http: Client,
    url_template: String,
}

impl fmt::Debug for HttpFeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedSource")
            .field("url_template", &self.url_template)
            .finish_non_exhaustive()
    }
}

impl HttpFeedSource {
    pub fn new(http: Client) -> Self {
        Self::with_url_template(http, DEFAULT_URL_TEMPLATE)
    }

    /// `template` must contain `{repository}`; it is replaced by the repository id.
    pub fn with_url_template(http: Client, template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: template.into(),
        }
    }

    pub fn default_client(user_agent: &str, timeout: Duration) -> reqwest::Result<Client> {
        Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
    }

    pub fn feed_url(&self, repository_id: &str) -> String {
        self.url_template
            .replace(REPOSITORY_PLACEHOLDER, repository_id)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_latest(&self, repository_id: &str) -> Result<ReleaseEntry, FetchError> {
        let url = self.feed_url(repository_id);
        debug!(%url, "fetching release feed");

        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;
        if !res.status().is_success() {
            let status = res.status();
            warn!(%url, %status, "release feed request failed");
            return Err(FetchError::Status { url, status });
        }
        let body = res.bytes().await.map_err(|source| FetchError::Request {
            url: url.clone(),
            source,
        })?;

        latest_entry(&url, &body)
    }
}

/// Parse a feed document and return its first entry.
///
/// The entry title is the release tag; `updated` is preferred over
/// `published` for the timestamp.
pub fn latest_entry(url: &str, body: &[u8]) -> Result<ReleaseEntry, FetchError> {
    let feed = feed_rs::parser::parse(body).map_err(|err| FetchError::Malformed {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    let first = feed.entries.into_iter().next().ok_or_else(|| FetchError::Empty {
        url: url.to_string(),
    })?;

    let tag = first
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| FetchError::Malformed {
            url: url.to_string(),
            reason: "first entry has no title".into(),
        })?;
    let published_at = first
        .updated
        .or(first.published)
        .ok_or_else(|| FetchError::Malformed {
            url: url.to_string(),
            reason: "first entry has no timestamp".into(),
        })?;

    Ok(ReleaseEntry::new(tag, published_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>tag:github.com,2008:https://github.com/acme/widget/releases</id>
  <title>Release notes from widget</title>
  <updated>2024-05-02T10:00:00Z</updated>
  <entry>
    <id>tag:github.com,2008:Repository/1/v1.1.0</id>
    <updated>2024-05-02T10:00:00Z</updated>
    <title>v1.1.0</title>
  </entry>
  <entry>
    <id>tag:github.com,2008:Repository/1/v1.0.0</id>
    <updated>2024-04-01T08:30:00Z</updated>
    <title>v1.0.0</title>
  </entry>
</feed>"#;

    #[test]
    fn first_entry_wins() {
        let entry = latest_entry("u", ATOM.as_bytes()).unwrap();
        assert_eq!(entry.tag, "v1.1.0");
        assert_eq!(entry.published_at.to_rfc3339(), "2024-05-02T10:00:00+00:00");
    }

    #[test]
    fn empty_feed_is_an_error() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>empty</id>
  <title>nothing yet</title>
  <updated>2024-05-02T10:00:00Z</updated>
</feed>"#;
        assert!(matches!(
            latest_entry("u", body.as_bytes()),
            Err(FetchError::Empty { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            latest_entry("u", b"not a feed"),
            Err(FetchError::Malformed { .. })
        ));
    }

    #[test]
    fn feed_url_substitutes_repository() {
        let source = HttpFeedSource::new(Client::new());
        assert_eq!(
            source.feed_url("github.com/acme/widget"),
            "https://github.com/acme/widget/releases.atom"
        );
    }
}
