//! Origin fetching for the warming engine.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Url};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid asset url `{url}`: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("origin answered {0}")]
    Status(u16),
}

/// Fetches an asset from the origin.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// [`Fetcher`] backed by a shared `reqwest` client and a base URL.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
    base: Url,
}

impl HttpFetcher {
    pub fn new(client: Client, base: &str) -> Result<Self, FetchError> {
        let base = Url::parse(base)
            .and_then(|url| url.join("/"))
            .map_err(|source| FetchError::Url {
                url: base.to_string(),
                source,
            })?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("kessel-warmer/", env!("CARGO_PKG_VERSION"))
    }

    fn resolve(&self, url: &str) -> Result<Url, FetchError> {
        self.base.join(url).map_err(|source| FetchError::Url {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(self.resolve(url)?)
            .header(reqwest::header::USER_AGENT, Self::user_agent())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?)
    }
}
