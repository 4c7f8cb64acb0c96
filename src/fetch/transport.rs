// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network transport used by the fetcher

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{NestError, Result};

/// A single HTTP GET. Errors are plain messages: the fetcher only needs to
/// know that a try failed and why, for the log.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, String>;
}

/// HTTPS transport backed by reqwest
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kea-nest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NestError::InvalidConfig {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP status {status}"));
        }

        response
            .bytes()
            .await
            .map(|body| body.to_vec())
            .map_err(|e| format!("reading body failed: {e}"))
    }
}
