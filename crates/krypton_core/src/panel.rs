//! Client for the panel's two upstream endpoints.

use std::time::Duration;

use krypton_datamodel::remote::{ServerConfig, ValidateResponse};
use reqwest::header::{self, HeaderMap};

use crate::config::KryptonRemote;
use crate::error::{Error, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_ATTEMPTS: u32 = 3;
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off before retry `attempt` (1-based): linear, one second per attempt.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt))
}

pub struct PanelClient {
    http: reqwest::Client,
    app_url: String,
}

impl PanelClient {
    pub fn new(remote: &KryptonRemote) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", remote.api_key)
            .parse()
            .map_err(|_| Error::Internal("panel api key is not a valid header value".into()))?;
        headers.insert(header::AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .user_agent(concat!("krypton/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build panel client: {e}")))?;

        Ok(Self {
            http,
            app_url: remote.app_url.trim_end_matches('/').to_owned(),
        })
    }

    fn config_url(&self, server_id: &str) -> String {
        format!("{}/api/servers/{}/config", self.app_url, server_id)
    }

    fn validate_url(&self, server_id: &str, token: &str) -> String {
        format!("{}/api/servers/{}/validate/{}", self.app_url, server_id, token)
    }

    /// Fetch the authoritative server configuration, retrying transient
    /// failures with linear back-off.
    pub async fn fetch_config(&self, server_id: &str) -> Result<ServerConfig> {
        let url = self.config_url(server_id);

        for attempt in 1..=FETCH_ATTEMPTS {
            match self.try_fetch_config(&url).await {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!(
                        "config fetch for {server_id} failed (attempt {attempt}/{FETCH_ATTEMPTS}): {e}"
                    );
                    if attempt < FETCH_ATTEMPTS {
                        tokio::time::sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }

        Err(Error::PanelUnavailable)
    }

    async fn try_fetch_config(&self, url: &str) -> Result<ServerConfig> {
        let response = self
            .http
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("panel transport failure: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "panel answered {} for {url}",
                response.status()
            )));
        }

        response
            .json::<ServerConfig>()
            .await
            .map_err(|e| Error::Internal(format!("panel sent an unparsable config: {e}")))
    }

    /// Check a session token with the panel. Single attempt; every failure
    /// mode is an unvalidated verdict, never an error.
    pub async fn validate(&self, server_id: &str, token: &str) -> bool {
        let url = self.validate_url(server_id, token);

        let response = match self.http.get(&url).timeout(VALIDATE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("validate transport failure for {server_id}: {e}");
                return false;
            }
        };

        if !response.status().is_success() {
            tracing::debug!("panel answered {} to validate for {server_id}", response.status());
            return false;
        }

        match response.json::<ValidateResponse>().await {
            Ok(body) => body.validated,
            Err(e) => {
                tracing::debug!("unparsable validate response for {server_id}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PanelClient {
        PanelClient::new(&KryptonRemote {
            app_url: "http://panel.local/".to_owned(),
            api_key: "k".to_owned(),
        })
        .unwrap()
    }

    #[test]
    fn urls_are_built_without_a_doubled_slash() {
        let client = client();
        assert_eq!(
            client.config_url("s1"),
            "http://panel.local/api/servers/s1/config"
        );
        assert_eq!(
            client.validate_url("s1", "tok"),
            "http://panel.local/api/servers/s1/validate/tok"
        );
    }

    #[test]
    fn backoff_is_linear_in_the_attempt_number() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(3), Duration::from_secs(3));
    }
}
