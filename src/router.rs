use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::bus::types::{AuditEntry, Message, MessageStatus, MessageType, SendMessage, TargetType};
use crate::bus::BusApi;
use crate::discovery::LocalSession;
use crate::security::SecurityPipeline;

const WORKER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const WORKER_BIN: &str = "claude";

// ---------------------------------------------------------------------------
// Worker spawning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub resume_session_id: String,
    pub fork_session: bool,
    pub system_prompt: String,
    pub prompt: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn run(&self, req: &WorkerRequest) -> Result<WorkerOutput>;
}

/// Spawns the `claude` CLI for one delivery turn.
pub struct ClaudeWorker {
    timeout: Duration,
}

impl ClaudeWorker {
    pub fn new() -> Self {
        Self { timeout: WORKER_TIMEOUT }
    }

    pub fn build_args(req: &WorkerRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--resume".to_string(),
            req.resume_session_id.clone(),
        ];
        if req.fork_session {
            args.push("--fork-session".to_string());
        }
        args.push("--append-system-prompt".to_string());
        args.push(req.system_prompt.clone());
        args.push("-".to_string()); // prompt from stdin
        args
    }
}

impl Default for ClaudeWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerSpawner for ClaudeWorker {
    async fn run(&self, req: &WorkerRequest) -> Result<WorkerOutput> {
        let args = Self::build_args(req);
        let mut child = Command::new(WORKER_BIN)
            .args(&args)
            .current_dir(&req.working_dir)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn worker process")?;

        // Write the prompt, then close stdin to signal EOF.
        {
            let mut stdin = child.stdin.take().context("worker stdin not piped")?;
            if let Err(e) = stdin.write_all(req.prompt.as_bytes()).await {
                let _ = child.kill().await;
                return Err(e).context("failed to write prompt to worker stdin");
            }
        }

        let stderr = child.stderr.take().context("worker stderr not piped")?;
        let stderr_handle = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(source = "worker-stderr", "{}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let stdout = child.stdout.take().context("worker stdout not piped")?;
        let stdout_handle = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(result) => result.context("failed to wait on worker")?,
            Err(_) => {
                tracing::error!(
                    "worker timed out after {}s, killing",
                    self.timeout.as_secs()
                );
                let _ = child.kill().await;
                stderr_handle.abort();
                stdout_handle.abort();
                anyhow::bail!("worker timed out after {}s", self.timeout.as_secs());
            }
        };

        let stderr = stderr_handle.await.unwrap_or_default();
        let stdout = stdout_handle.await.unwrap_or_default();

        Ok(WorkerOutput { success: status.success(), stdout, stderr })
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub ok: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub branch_session_id: Option<String>,
    pub message_id: String,
}

impl RouteOutcome {
    fn failure(message_id: &str, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            response: None,
            error: Some(error.into()),
            branch_session_id: None,
            message_id: message_id.to_string(),
        }
    }
}

/// Claims a message, runs a worker turn against the target session, posts
/// the response, and tracks the conversation's fork session.
pub struct MessageRouter {
    bus: Arc<dyn BusApi>,
    security: Option<Arc<SecurityPipeline>>,
    spawner: Arc<dyn WorkerSpawner>,
    machine_id: String,
    /// thread id → branch session id; one entry per thread, updated in
    /// place. First-writer-wins under concurrent deliveries.
    branch_map: Mutex<HashMap<String, String>>,
}

impl MessageRouter {
    pub fn new(
        bus: Arc<dyn BusApi>,
        security: Option<Arc<SecurityPipeline>>,
        spawner: Arc<dyn WorkerSpawner>,
        machine_id: &str,
    ) -> Self {
        Self {
            bus,
            security,
            spawner,
            machine_id: machine_id.to_string(),
            branch_map: Mutex::new(HashMap::new()),
        }
    }

    pub async fn route(&self, message: &Message, sessions: &[LocalSession]) -> RouteOutcome {
        let Some(session) = resolve_target(message, sessions) else {
            tracing::warn!(message_id = %message.id, "no matching session for message");
            return RouteOutcome::failure(&message.id, "no matching session");
        };

        // Security gauntlet: rate limit → sanitize → directory guard →
        // audit. A failure stops routing before the claim.
        let content = if let Some(security) = &self.security {
            let started = Instant::now();
            let checked = security
                .check_and_record(&message.sender_id, "message")
                .and_then(|_| security.validate_and_sanitize(&message.content))
                .and_then(|clean| {
                    security.enforce_directory(&clean)?;
                    Ok(clean)
                });
            match checked {
                Ok(clean) => {
                    security
                        .audit(AuditEntry::allowed(
                            &message.sender_id,
                            "message",
                            started.elapsed().as_millis() as u64,
                        ))
                        .await;
                    clean
                }
                Err(e) => {
                    security
                        .audit(AuditEntry::blocked(&message.sender_id, "message", e.reason()))
                        .await;
                    tracing::warn!(message_id = %message.id, error = %e, "security check failed");
                    return RouteOutcome::failure(
                        &message.id,
                        format!("Security check failed: {e}"),
                    );
                }
            }
        } else {
            message.content.clone()
        };

        // Claim before spawning; a lost race means another agent owns it.
        if message.status == MessageStatus::Pending {
            if let Some(agent_id) = &session.agent_id {
                if let Err(e) = self.bus.claim_message(&message.id, agent_id).await {
                    tracing::info!(message_id = %message.id, error = %e, "failed to claim message");
                    return RouteOutcome::failure(
                        &message.id,
                        format!("Failed to claim message: {e}"),
                    );
                }
            }
        }

        let thread_key = message.thread_key().to_string();
        let prior_branch = self.branch_map.lock().await.get(&thread_key).cloned();

        let request = WorkerRequest {
            resume_session_id: prior_branch.clone().unwrap_or_else(|| session.session_id.clone()),
            fork_session: prior_branch.is_none(),
            system_prompt: build_context_prompt(message),
            prompt: content,
            working_dir: session.project_path.clone(),
        };

        let output = match self.spawner.run(&request).await {
            Ok(out) => out,
            Err(e) => {
                self.mark_status(&message.id, MessageStatus::Failed).await;
                return RouteOutcome::failure(&message.id, format!("Worker failed: {e}"));
            }
        };

        if !output.success {
            self.mark_status(&message.id, MessageStatus::Failed).await;
            let stderr = output.stderr.trim();
            return RouteOutcome::failure(
                &message.id,
                format!("Worker exited with failure: {stderr}"),
            );
        }

        // A JSON result carries the response text and the fork's session id;
        // anything else is used verbatim and leaves the branch map alone.
        let trimmed = output.stdout.trim();
        let (response_text, new_branch) =
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(v) => {
                    let text = v
                        .get("result")
                        .and_then(|r| r.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| trimmed.to_string());
                    let branch = v
                        .get("session_id")
                        .and_then(|s| s.as_str())
                        .map(str::to_string);
                    (text, branch)
                }
                Err(_) => (trimmed.to_string(), None),
            };

        if let Some(branch) = &new_branch {
            self.branch_map
                .lock()
                .await
                .insert(thread_key.clone(), branch.clone());
        }
        let effective_branch = new_branch
            .or(prior_branch)
            .unwrap_or_else(|| session.session_id.clone());

        let reply = SendMessage {
            target_type: TargetType::Agent,
            target_address: message.sender_id.clone(),
            message_type: MessageType::Response,
            content: response_text.clone(),
            metadata: json!({
                "inReplyTo": message.id,
                "sessionBranch": {
                    "sessionId": effective_branch,
                    "machineId": self.machine_id,
                    "projectPath": session.project_path.to_string_lossy(),
                },
            }),
            thread_id: Some(thread_key),
            channel_id: message.channel_id.clone(),
        };
        if let Err(e) = self.bus.send_message(reply).await {
            tracing::warn!(message_id = %message.id, error = %e, "failed to post response");
        }

        self.mark_status(&message.id, MessageStatus::Delivered).await;

        RouteOutcome {
            ok: true,
            response: Some(response_text),
            error: None,
            branch_session_id: Some(effective_branch),
            message_id: message.id.clone(),
        }
    }

    async fn mark_status(&self, message_id: &str, status: MessageStatus) {
        if let Err(e) = self.bus.update_message_status(message_id, status).await {
            tracing::debug!(message_id, error = %e, "status update failed");
        }
    }

    #[cfg(test)]
    pub async fn branch_for(&self, thread_id: &str) -> Option<String> {
        self.branch_map.lock().await.get(thread_id).cloned()
    }
}

/// Pick the local session a message should be delivered to.
fn resolve_target<'a>(
    message: &Message,
    sessions: &'a [LocalSession],
) -> Option<&'a LocalSession> {
    let address = &message.target_address;

    let by_type = match message.target_type {
        TargetType::Agent => sessions.iter().find(|s| {
            s.agent_id
                .as_deref()
                .is_some_and(|id| address.contains(id))
                || address.contains(&s.session_id)
                || s.session_name
                    .as_deref()
                    .is_some_and(|name| !name.is_empty() && address.contains(name))
        }),
        TargetType::Project => sessions
            .iter()
            .find(|s| address.contains(s.project_path.to_string_lossy().as_ref())),
        TargetType::Broadcast => sessions.iter().min_by(|a, b| a.session_id.cmp(&b.session_id)),
    };
    if by_type.is_some() {
        return by_type;
    }

    // Cross-type fallback, then the single-session last resort.
    sessions
        .iter()
        .find(|s| address.contains(&s.session_id))
        .or_else(|| (sessions.len() == 1).then(|| &sessions[0]))
}

/// Bus context handed to the worker as an appended system prompt.
fn build_context_prompt(message: &Message) -> String {
    let message_type = serde_json::to_value(message.message_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let mut lines = vec![
        "You are handling a message delivered over the agent bus.".to_string(),
        format!("Sender: {}", message.sender_id),
        format!("Message type: {message_type}"),
    ];
    if let Some(channel) = &message.channel_id {
        lines.push(format!("Channel: {channel}"));
    }
    lines.push(format!("Thread: {}", message.thread_key()));
    if let Some(source) = message.metadata.get("source").and_then(|s| s.as_str()) {
        lines.push(format!("Source: {source}"));
    }
    lines.join("\n")
}
