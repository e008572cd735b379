use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;

use crate::error::HarvestError;

pub trait RemoteFetcher: Send + Sync {
    fn fetch_url(&self, url: &str) -> Result<Vec<u8>, HarvestError>;
}

pub fn fetch_json<F, T>(fetcher: &F, url: &str) -> Result<T, HarvestError>
where
    F: RemoteFetcher + ?Sized,
    T: DeserializeOwned,
{
    let body = fetcher.fetch_url(url)?;
    serde_json::from_slice(&body).map_err(|err| HarvestError::ReposRead(format!("{url}: {err}")))
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("repos-consumer/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::Transport(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::Transport(err.to_string()))?;
        Ok(Self { client })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "repository request failed".to_string());
        Err(HarvestError::BadAccess {
            status: Some(status),
            message,
        })
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch_url(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        tracing::debug!(url, "fetching");
        let response = self.client.get(url).send().map_err(|err| {
            if err.is_builder() {
                HarvestError::InvalidSource(format!("{url}: {err}"))
            } else {
                HarvestError::Transport(format!("{url}: {err}"))
            }
        })?;
        let response = Self::handle_status(response)?;
        let bytes = response
            .bytes()
            .map_err(|err| HarvestError::Transport(format!("{url}: {err}")))?;
        Ok(bytes.to_vec())
    }
}
