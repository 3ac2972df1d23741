//! Session bootstrap against the job source HTTP API

use applier_core::config::ServerConfig;
use applier_core::{ApplierError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Creates sessions on the job source
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Start a new session and return its id
    async fn create_session(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
}

/// [`SessionApi`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: Client,
    api_url: String,
}

impl HttpSessionApi {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(&server.api_url)
    }

    pub fn session_endpoint(&self) -> String {
        format!("{}/session", self.api_url)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self) -> Result<String> {
        let body = json!({
            "jobs": [],
            "applicationPreferences": {},
        });

        debug!("POST {}", self.session_endpoint());
        let resp = self
            .client
            .post(self.session_endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| ApplierError::Bootstrap(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ApplierError::Bootstrap(format!(
                "job source answered {}: {}",
                status, text
            )));
        }

        let created: CreateSessionResponse = resp
            .json()
            .await
            .map_err(|e| ApplierError::Bootstrap(format!("unexpected response body: {}", e)))?;
        info!("Created session {}", created.session_id);
        Ok(created.session_id)
    }
}
