use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub machine_id: String,
    pub session_id: String,
    #[serde(default)]
    pub session_name: Option<String>,
    pub project_path: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Offline,
}

/// Body for `POST /v1/agents`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterAgent {
    pub machine_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub project_path: String,
    pub capabilities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub sender_id: String,
    pub target_type: TargetType,
    #[serde(default)]
    pub target_address: String,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub status: MessageStatus,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// `metadata.deliveryMode` when present ("push", "pull", "broadcast").
    pub fn delivery_mode(&self) -> Option<&str> {
        self.metadata.get("deliveryMode").and_then(|v| v.as_str())
    }

    /// Conversation key: the thread id, falling back to the message id for
    /// the first turn of a new thread.
    pub fn thread_key(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Agent,
    Project,
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Sync,
    Async,
    Memo,
    Response,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Claimed,
    Delivered,
    Failed,
}

/// Body for `POST /v1/messages`.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessage {
    pub target_type: TargetType,
    pub target_address: String,
    pub message_type: MessageType,
    pub content: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub action: String,
    /// "allowed" or "blocked:<reason>".
    pub result: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl AuditEntry {
    pub fn allowed(actor_id: &str, action: &str, duration_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            result: "allowed".to_string(),
            duration_ms: Some(duration_ms),
            detail: Value::Null,
        }
    }

    pub fn blocked(actor_id: &str, action: &str, reason: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            result: format!("blocked:{reason}"),
            duration_ms: None,
            detail: Value::Null,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.result.starts_with("blocked")
    }
}

// ---------------------------------------------------------------------------
// Stream envelope
// ---------------------------------------------------------------------------

/// What the bus wraps each inserted row in on the SSE stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    #[allow(dead_code)]
    pub id: Option<Value>,
    pub data: Value,
    #[allow(dead_code)]
    #[serde(default)]
    pub ts: Option<Value>,
}
