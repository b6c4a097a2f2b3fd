//! Thin client for the host application's HTTP API.
//!
//! Used for two things only: waiting until the host is reachable at startup,
//! and triggering library scans so new source files get indexed.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HostApiError {
    #[error("Invalid host API URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Host API key is not configured")]
    MissingKey,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Host API returned {status} for {endpoint}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("Host API unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Library {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct HostApiClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl HostApiClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, HostApiError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut base_url = Url::parse(base_url)?;
        // Keep a trailing slash so `join` appends instead of replacing the last segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, HostApiError> {
        let key = config
            .host_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(HostApiError::MissingKey)?;
        Self::new(&config.host_api_url, key)
    }

    fn endpoint(&self, path: &str) -> Result<Url, HostApiError> {
        Ok(self.base_url.join(path)?)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("x-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// True when the host answers its ping endpoint with 200.
    pub async fn ping(&self) -> bool {
        let Ok(url) = self.endpoint("api/server/ping") else {
            return false;
        };
        match self
            .request(reqwest::Method::GET, url)
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                debug!(error = %err, "Host ping failed");
                false
            }
        }
    }

    pub async fn list_libraries(&self) -> Result<Vec<Library>, HostApiError> {
        let url = self.endpoint("api/libraries")?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HostApiError::Status {
                endpoint: "api/libraries".to_string(),
                status,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn scan_library(&self, library_id: Uuid) -> Result<(), HostApiError> {
        let endpoint = format!("api/libraries/{library_id}/scan");
        let url = self.endpoint(&endpoint)?;
        let response = self.request(reqwest::Method::POST, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HostApiError::Status { endpoint, status });
        }
        debug!(library_id = %library_id, "Triggered library scan");
        Ok(())
    }

    /// Polls `ping` until it succeeds, up to `attempts` times.
    pub async fn wait_for_host(&self, attempts: u32, delay: Duration) -> Result<(), HostApiError> {
        for attempt in 1..=attempts {
            if self.ping().await {
                info!(attempt, "Host API reachable");
                return Ok(());
            }
            warn!(attempt, attempts, "Host API not reachable yet");
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(HostApiError::Unreachable { attempts })
    }

    /// Scans every library except `excluded`. Individual scan failures are
    /// logged and skipped. Returns the number of scans triggered.
    pub async fn scan_libraries_except(&self, excluded: &HashSet<Uuid>) -> Result<usize, HostApiError> {
        let libraries = self.list_libraries().await?;
        let mut scanned = 0;
        for library in libraries {
            if excluded.contains(&library.id) {
                debug!(library_id = %library.id, "Skipping mirror target library");
                continue;
            }
            match self.scan_library(library.id).await {
                Ok(()) => scanned += 1,
                Err(err) => warn!(library_id = %library.id, error = %err, "Library scan failed"),
            }
        }
        if scanned > 0 {
            info!(count = scanned, "Triggered library scans");
        }
        Ok(scanned)
    }
}
