//! In-memory bus and worker fakes shared by the module test suites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::types::{
    Agent, AgentStatus, AuditEntry, Message, MessageStatus, RegisterAgent, SendMessage,
};
use crate::bus::BusApi;
use crate::router::{WorkerOutput, WorkerRequest, WorkerSpawner};

/// Records every call and lets tests flip individual operations into
/// failure mode. Claim is claim-once: a second claim on the same message id
/// fails the way a lost race does.
#[derive(Default)]
pub struct RecordingBus {
    calls: Mutex<Vec<String>>,
    heartbeats: AtomicUsize,
    registered: Mutex<HashMap<(String, String), String>>,
    claimed: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SendMessage>>,
    status_updates: Mutex<Vec<(String, MessageStatus)>>,
    audit_batches: Mutex<Vec<Vec<AuditEntry>>>,
    next_agent: AtomicUsize,

    fail_register: AtomicBool,
    fail_deregister: AtomicBool,
    fail_heartbeat: AtomicBool,
    fail_claim: AtomicBool,
    fail_send: AtomicBool,
    fail_audit: AtomicBool,
    fail_status: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<SendMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn status_updates(&self) -> Vec<(String, MessageStatus)> {
        self.status_updates.lock().unwrap().clone()
    }

    pub fn audit_batches(&self) -> Vec<Vec<AuditEntry>> {
        self.audit_batches.lock().unwrap().clone()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit_batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn fail_register(&self) {
        self.fail_register.store(true, Ordering::SeqCst);
    }

    pub fn fail_deregister(&self) {
        self.fail_deregister.store(true, Ordering::SeqCst);
    }

    pub fn fail_heartbeat(&self) {
        self.fail_heartbeat.store(true, Ordering::SeqCst);
    }

    pub fn fail_claim(&self) {
        self.fail_claim.store(true, Ordering::SeqCst);
    }

    pub fn fail_send(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self) {
        self.fail_status.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusApi for RecordingBus {
    async fn list_agents(&self, limit: u32) -> Result<Vec<Agent>> {
        self.log(format!("list:{limit}"));
        Ok(Vec::new())
    }

    async fn register_agent(&self, req: RegisterAgent) -> Result<Agent> {
        self.log(format!("register:{}:{}", req.machine_id, req.session_id));
        if self.fail_register.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 500: register unavailable");
        }
        let key = (req.machine_id.clone(), req.session_id.clone());
        let mut known = self.registered.lock().unwrap();
        let id = known
            .entry(key)
            .or_insert_with(|| {
                format!("agent-{}", self.next_agent.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .clone();
        Ok(Agent {
            id,
            machine_id: req.machine_id,
            session_id: req.session_id,
            session_name: req.session_name,
            project_path: req.project_path,
            status: AgentStatus::Active,
            capabilities: req.capabilities,
            heartbeat_at: None,
            registered_at: None,
        })
    }

    async fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        self.log(format!("deregister:{agent_id}"));
        if self.fail_deregister.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 500: deregister unavailable");
        }
        Ok(())
    }

    async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.log(format!("heartbeat:{agent_id}"));
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 503: heartbeat unavailable");
        }
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.log(format!("get:{message_id}"));
        anyhow::bail!("bus API error 404: message not found");
    }

    async fn claim_message(&self, message_id: &str, agent_id: &str) -> Result<()> {
        self.log(format!("claim:{message_id}:{agent_id}"));
        if self.fail_claim.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 409: message already claimed");
        }
        let mut claimed = self.claimed.lock().unwrap();
        if !claimed.insert(message_id.to_string()) {
            anyhow::bail!("bus API error 409: message already claimed");
        }
        Ok(())
    }

    async fn update_message_status(&self, message_id: &str, status: MessageStatus) -> Result<()> {
        self.log(format!("status:{message_id}"));
        if self.fail_status.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 500: status update unavailable");
        }
        self.status_updates
            .lock()
            .unwrap()
            .push((message_id.to_string(), status));
        Ok(())
    }

    async fn send_message(&self, req: SendMessage) -> Result<Message> {
        self.log("send".to_string());
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 500: send unavailable");
        }
        let msg = Message {
            id: format!("sent-{}", self.sent.lock().unwrap().len() + 1),
            channel_id: req.channel_id.clone(),
            sender_id: "daemon".to_string(),
            target_type: req.target_type,
            target_address: req.target_address.clone(),
            message_type: req.message_type,
            content: req.content.clone(),
            metadata: req.metadata.clone(),
            status: MessageStatus::Pending,
            claimed_by: None,
            thread_id: req.thread_id.clone(),
            created_at: None,
            expires_at: None,
        };
        self.sent.lock().unwrap().push(req);
        Ok(msg)
    }

    async fn post_audit(&self, entries: &[AuditEntry]) -> Result<()> {
        self.log(format!("audit:{}", entries.len()));
        if self.fail_audit.load(Ordering::SeqCst) {
            anyhow::bail!("bus API error 500: audit unavailable");
        }
        self.audit_batches.lock().unwrap().push(entries.to_vec());
        Ok(())
    }
}

/// Worker fake: records every request and replies with a canned stdout.
pub struct RecordingWorker {
    requests: Mutex<Vec<WorkerRequest>>,
    stdout: String,
    stderr: String,
    success: bool,
    spawn_error: Option<String>,
}

impl RecordingWorker {
    /// Successful worker whose stdout is `stdout` (JSON or plain text).
    pub fn json(stdout: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            spawn_error: None,
        }
    }

    /// Worker that exits non-zero with `stderr`.
    pub fn failing(stderr: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
            spawn_error: None,
        }
    }

    /// Worker whose spawn itself errors (timeout, missing binary).
    pub fn erroring(error: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            stdout: String::new(),
            stderr: String::new(),
            success: false,
            spawn_error: Some(error.to_string()),
        }
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerSpawner for RecordingWorker {
    async fn run(&self, req: &WorkerRequest) -> Result<WorkerOutput> {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(error) = &self.spawn_error {
            anyhow::bail!("{error}");
        }
        Ok(WorkerOutput {
            success: self.success,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }
}
