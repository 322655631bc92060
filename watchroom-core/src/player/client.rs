//! Player API HTTP Client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::types::*;
use super::PlayerControl;

/// Default player API port
pub const DEFAULT_PORT: u16 = 9736;

/// Default connection timeout (short since it's localhost)
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Default request timeout (short since it's localhost)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur when talking to the local player
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("player is not running or not reachable")]
    NotReachable,

    #[error("invalid API token")]
    Unauthorized,

    #[error("no media loaded")]
    NoMedia,

    #[error("player rejected the command: {0}")]
    Rejected(String),

    #[error("API error: {0}")]
    Api(String),
}

/// Client for the local player's REST API
#[derive(Debug, Clone)]
pub struct PlayerClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl PlayerClient {
    /// Create a new PlayerClient with default settings (localhost:9736)
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    /// Create a new PlayerClient with a custom port
    pub fn with_port(port: u16) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            // Limit connection pool to avoid stale connections
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            .tcp_keepalive(None)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            // Use 127.0.0.1 explicitly to avoid IPv6 issues
            base_url: format!("http://127.0.0.1:{}", port),
            api_token: None,
        }
    }

    /// Set the API token for authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Build a request with optional authentication
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v1/player{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.api_token {
            req = req.header("apitoken", token);
        }

        req
    }

    /// Check if the player is active and reachable
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn is_active(&self) -> Result<(), PlayerError> {
        debug!("Checking player connection");

        let resp = self
            .request(reqwest::Method::GET, "/active")
            .send()
            .await
            .map_err(|e| {
                warn!("Connection error: {:?}", e);
                if e.is_connect() {
                    PlayerError::NotReachable
                } else if e.is_timeout() {
                    PlayerError::Api("Connection timed out".to_string())
                } else {
                    PlayerError::Api(format!("Network error ({})", e))
                }
            })?;

        debug!("Response status: {}", resp.status());

        match resp.status().as_u16() {
            200 | 204 => Ok(()),
            401 | 403 => Err(PlayerError::Unauthorized),
            code => Err(PlayerError::Api(format!("Unexpected response (HTTP {})", code))),
        }
    }
}

#[async_trait]
impl PlayerControl for PlayerClient {
    async fn status(&self) -> Result<PlayerStatus, PlayerError> {
        let resp = self.request(reqwest::Method::GET, "/status").send().await?;

        // Nothing loaded yet
        if resp.status() == 404 || resp.status() == 204 {
            return Err(PlayerError::NoMedia);
        }

        let body: ApiResponse<StatusResponse> = resp.json().await?;
        Ok(PlayerStatus::from(body.data))
    }

    async fn load(&self, entry_id: &str, source: &str) -> Result<(), PlayerError> {
        let resp = self
            .request(reqwest::Method::POST, "/load")
            .json(&LoadRequest {
                entry_id: entry_id.to_string(),
                source: source.to_string(),
            })
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 204 => Ok(()),
            422 => Err(PlayerError::Rejected(format!("load refused for {}", entry_id))),
            code => Err(PlayerError::Api(format!("load failed (HTTP {})", code))),
        }
    }

    async fn set_speed(&self, speed: f64) -> Result<(), PlayerError> {
        let resp = self
            .request(reqwest::Method::POST, "/speed")
            .json(&SpeedRequest { speed })
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 204 => Ok(()),
            422 => Err(PlayerError::Rejected(format!("speed {} refused", speed))),
            code => Err(PlayerError::Api(format!("speed change failed (HTTP {})", code))),
        }
    }

    async fn seek(&self, position_secs: f64) -> Result<SeekOutcome, PlayerError> {
        let resp = self
            .request(reqwest::Method::POST, "/seek")
            .json(&SeekRequest {
                position: position_secs,
            })
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => {
                let body: ApiResponse<SeekResponse> = resp.json().await?;
                Ok(SeekOutcome {
                    reloaded: body.data.reloaded,
                })
            }
            204 => Ok(SeekOutcome { reloaded: false }),
            422 => Err(PlayerError::Rejected(format!("seek to {:.1}s refused", position_secs))),
            code => Err(PlayerError::Api(format!("seek failed (HTTP {})", code))),
        }
    }

    async fn select_tracks(
        &self,
        audio: Option<u32>,
        subtitle: Option<u32>,
    ) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/tracks")
            .json(&TrackRequest { audio, subtitle })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for PlayerClient {
    fn default() -> Self {
        Self::new()
    }
}
