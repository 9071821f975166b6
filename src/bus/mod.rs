pub mod stream;
pub mod types;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use self::types::{Agent, AuditEntry, Message, MessageStatus, RegisterAgent, SendMessage};

const USER_AGENT: &str = "nyarla-daemon";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("bus request failed: {0}")]
    Http(String),
}

/// REST surface of the event-bus service.
///
/// Modeled as a trait so the registry, router, and daemon can be exercised
/// against an in-memory fake.
#[async_trait]
pub trait BusApi: Send + Sync {
    async fn list_agents(&self, limit: u32) -> Result<Vec<Agent>>;
    async fn register_agent(&self, req: RegisterAgent) -> Result<Agent>;
    async fn deregister_agent(&self, agent_id: &str) -> Result<()>;
    async fn heartbeat(&self, agent_id: &str) -> Result<()>;
    async fn get_message(&self, message_id: &str) -> Result<Message>;
    async fn claim_message(&self, message_id: &str, agent_id: &str) -> Result<()>;
    async fn update_message_status(&self, message_id: &str, status: MessageStatus) -> Result<()>;
    async fn send_message(&self, req: SendMessage) -> Result<Message>;
    async fn post_audit(&self, entries: &[AuditEntry]) -> Result<()>;
}

/// HTTP client for the bus with a mutable header bag.
///
/// The bag is overlaid onto every request after the bearer credential, so a
/// `set_header` mutation (the JWT refresher) is visible to all subsequent
/// calls from any holder of the client.
pub struct HttpBusClient {
    client: Client,
    /// Separate client without a total-request timeout; an SSE read would
    /// otherwise be cut off mid-stream.
    stream_client: Client,
    base_url: String,
    api_key: String,
    headers: RwLock<HashMap<String, String>>,
}

impl HttpBusClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let stream_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build streaming HTTP client")?;

        Ok(Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            headers: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_header(&self, name: &str, value: &str) {
        if let Ok(mut bag) = self.headers.write() {
            bag.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_header(&self, name: &str) {
        if let Ok(mut bag) = self.headers.write() {
            bag.remove(name);
        }
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req
            .bearer_auth(&self.api_key)
            .header("User-Agent", USER_AGENT);
        if let Ok(bag) = self.headers.read() {
            for (k, v) in bag.iter() {
                req = req.header(k.as_str(), v.as_str());
            }
        }
        req
    }

    /// Open the SSE subscription. Returns the raw response; the caller owns
    /// the byte stream.
    pub async fn open_stream(
        &self,
        machine_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages/stream", self.base_url);
        let mut req = self
            .stream_client
            .get(&url)
            .query(&[("machine_id", machine_id)])
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }
        let resp = self
            .apply_headers(req)
            .send()
            .await
            .map_err(|e| BusError::Http(e.to_string()))
            .context("failed to open event stream")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(BusError::Api {
                status: status.as_u16(),
                message: derive_error_message(&body),
            });
        }
        Ok(resp)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!(BusError::Api {
            status: status.as_u16(),
            message: derive_error_message(&body),
        })
    }
}

/// Pull a human-readable message out of an error body; falls back to the raw
/// text, truncated.
fn derive_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message", "detail"] {
            if let Some(msg) = v.get(key).and_then(|m| m.as_str()) {
                return msg.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

#[async_trait]
impl BusApi for HttpBusClient {
    async fn list_agents(&self, limit: u32) -> Result<Vec<Agent>> {
        let url = format!("{}/v1/agents", self.base_url);
        let req = self.client.get(&url).query(&[("limit", limit)]);
        let resp = self
            .apply_headers(req)
            .send()
            .await
            .context("failed to list agents")?;
        let resp = Self::check(resp).await?;
        resp.json().await.context("failed to parse agent list")
    }

    async fn register_agent(&self, body: RegisterAgent) -> Result<Agent> {
        let url = format!("{}/v1/agents", self.base_url);
        let req = self.client.post(&url).json(&body);
        let resp = self
            .apply_headers(req)
            .send()
            .await
            .context("failed to register agent")?;
        let resp = Self::check(resp).await?;
        resp.json().await.context("failed to parse agent record")
    }

    async fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        let url = format!("{}/v1/agents/{agent_id}", self.base_url);
        let resp = self
            .apply_headers(self.client.delete(&url))
            .send()
            .await
            .context("failed to deregister agent")?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let url = format!("{}/v1/agents/{agent_id}/heartbeat", self.base_url);
        let resp = self
            .apply_headers(self.client.patch(&url))
            .send()
            .await
            .context("failed to send heartbeat")?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        let url = format!("{}/v1/messages/{message_id}", self.base_url);
        let resp = self
            .apply_headers(self.client.get(&url))
            .send()
            .await
            .context("failed to fetch message")?;
        let resp = Self::check(resp).await?;
        resp.json().await.context("failed to parse message")
    }

    async fn claim_message(&self, message_id: &str, agent_id: &str) -> Result<()> {
        let url = format!("{}/v1/messages/{message_id}/claim", self.base_url);
        let body = json!({ "claimed_by": agent_id });
        let resp = self
            .apply_headers(self.client.patch(&url).json(&body))
            .send()
            .await
            .context("failed to claim message")?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn update_message_status(&self, message_id: &str, status: MessageStatus) -> Result<()> {
        let url = format!("{}/v1/messages/{message_id}/status", self.base_url);
        let body = json!({ "status": status });
        let resp = self
            .apply_headers(self.client.patch(&url).json(&body))
            .send()
            .await
            .context("failed to update message status")?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn send_message(&self, body: SendMessage) -> Result<Message> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .apply_headers(self.client.post(&url).json(&body))
            .send()
            .await
            .context("failed to send message")?;
        let resp = Self::check(resp).await?;
        resp.json().await.context("failed to parse sent message")
    }

    async fn post_audit(&self, entries: &[AuditEntry]) -> Result<()> {
        let url = format!("{}/v1/audit", self.base_url);
        let body = json!({ "entries": entries });
        let resp = self
            .apply_headers(self.client.post(&url).json(&body))
            .send()
            .await
            .context("failed to post audit batch")?;
        Self::check(resp).await?;
        Ok(())
    }
}
