//! Minimal HTTP fetch helpers shared by the filter-list updater and the
//! favicon downloader.
//!
//! A single attempt per call: no timeout tuning, backoff or retry. A failed
//! fetch is terminal for that attempt and is retried only when the user asks
//! again.

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

use crate::error::{PolicyError, Result};

const USER_AGENT: &str = concat!("suribrows-policy/", env!("CARGO_PKG_VERSION"));

pub fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| PolicyError::http("<client>", e))
}

/// Body and declared content type of a successful response.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub async fn fetch(client: &Client, url: &str) -> Result<Fetched> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PolicyError::http(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(PolicyError::HttpStatus {
            url: url.to_owned(),
            status: status.as_u16(),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = response
        .bytes()
        .await
        .map_err(|e| PolicyError::http(url, e))?
        .to_vec();

    Ok(Fetched { content_type, body })
}

pub async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let fetched = fetch(client, url).await?;
    Ok(String::from_utf8_lossy(&fetched.body).into_owned())
}
