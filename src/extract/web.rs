//! HTTP fetching for URL sources.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tracing::debug;

use crate::error::ExtractError;

/// A fetched response body and its declared type.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FetchedPage {
    /// Last non-empty path segment, when it looks like a file name.
    pub fn url_filename(&self) -> Option<String> {
        let url = Url::parse(&self.url).ok()?;
        let last = url.path_segments()?.rev().find(|s| !s.is_empty())?;
        last.contains('.').then(|| last.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WebFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl WebFetcher {
    pub fn new(timeout_secs: u64, max_bytes: usize) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("open-notebook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    /// Validate that `url` is absolute http(s).
    pub fn parse_url(url: &str) -> Result<Url, ExtractError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| ExtractError::InvalidInput(format!("invalid URL '{}': {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(ExtractError::InvalidInput(format!(
                "unsupported URL scheme '{}'",
                other
            ))),
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, ExtractError> {
        let parsed = Self::parse_url(url)?;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ExtractError::FetchTimeout(url.to_string())
            } else {
                ExtractError::ExtractionFailed(format!("fetching {}: {}", url, e))
            }
        };

        let mut response = self
            .client
            .get(parsed)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::ExtractionFailed(format!(
                "fetching {}: HTTP {}",
                url, status
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let final_url = response.url().to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_err)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(ExtractError::InvalidInput(format!(
                    "{} is larger than {} bytes",
                    url, self.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        debug!(url, bytes = bytes.len(), content_type = ?content_type, "fetched");

        Ok(FetchedPage {
            url: final_url,
            content_type,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn only_http_schemes() {
        assert!(WebFetcher::parse_url("https://example.com/a").is_ok());
        assert!(matches!(
            WebFetcher::parse_url("file:///etc/passwd"),
            Err(ExtractError::InvalidInput(_))
        ));
        assert!(matches!(
            WebFetcher::parse_url("not a url"),
            Err(ExtractError::InvalidInput(_))
        ));
    }

    #[test]
    fn filename_from_url_path() {
        let page = |url: &str| FetchedPage {
            url: url.into(),
            content_type: None,
            bytes: vec![],
        };
        assert_eq!(
            page("https://x.org/files/report.pdf?dl=1").url_filename().as_deref(),
            Some("report.pdf")
        );
        assert_eq!(page("https://x.org/blog/post/").url_filename(), None);
    }

    #[tokio::test]
    async fn fetches_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string("<p>hi</p>"),
            )
            .mount(&server)
            .await;

        let fetcher = WebFetcher::new(5, 1024).unwrap();
        let page = fetcher.fetch(&format!("{}/page", server.uri())).await.unwrap();
        assert_eq!(page.bytes, b"<p>hi</p>");
        assert_eq!(page.content_type.as_deref(), Some("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn error_status_and_size_limit() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let fetcher = WebFetcher::new(5, 1024).unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
        let err = fetcher
            .fetch(&format!("{}/big", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fetcher = WebFetcher::new(1, 1024).unwrap();
        let err = fetcher
            .fetch(&format!("{}/slow", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::FetchTimeout(_)));
    }
}
