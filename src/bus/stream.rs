use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::{Message, StreamEnvelope};
use super::{BusApi, HttpBusClient};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_MULTIPLIER: u32 = 2;
const BACKOFF_MAX_MS: u64 = 30_000;
const IDLE_THRESHOLD: Duration = Duration::from_secs(12);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Events & state
// ---------------------------------------------------------------------------

/// What the consumer emits to the daemon.
#[derive(Debug)]
pub enum StreamEvent {
    Insert(Message),
    /// Connected / disconnected edge.
    Status(bool),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Event type the bus uses for inserted rows.
    pub insert_event: String,
    pub backoff_base: Duration,
    pub backoff_multiplier: u32,
    pub backoff_max: Duration,
    pub idle_threshold: Duration,
    pub probe_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            insert_event: "insert".to_string(),
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
            idle_threshold: IDLE_THRESHOLD,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// SSE wire parser
// ---------------------------------------------------------------------------

/// One parsed SSE frame. `data` is the joined value of every `data:` line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
}

/// Incremental parser over the raw byte stream. Frames are separated by
/// blank lines; partial frames and split UTF-8 sequences carry over between
/// `feed` calls.
#[derive(Default)]
pub struct SseParser {
    bytes: Vec<u8>,
    text: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.bytes.extend_from_slice(chunk);

        // Move the valid UTF-8 prefix into the text buffer; an incomplete
        // trailing sequence waits for the next chunk.
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => {
                self.text.push_str(s);
                self.bytes.clear();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                let prefix = std::str::from_utf8(&self.bytes[..valid]).unwrap_or_default();
                self.text.push_str(prefix);
                self.bytes.drain(..valid);
            }
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.text.find("\n\n") {
            let block = self.text[..pos].to_string();
            self.text.drain(..pos + 2);
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Parse one frame block (the text between blank lines). Returns `None` for
/// comment-only or empty blocks.
fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;

    for line in block.split('\n') {
        if line.starts_with(':') || line.is_empty() {
            continue;
        }
        if let Some(value) = field_value(line, "id") {
            frame.id = Some(value.to_string());
            saw_field = true;
        } else if let Some(value) = field_value(line, "event") {
            frame.event = Some(value.to_string());
            saw_field = true;
        } else if let Some(value) = field_value(line, "data") {
            data_lines.push(value);
            saw_field = true;
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }
    saw_field.then_some(frame)
}

/// `"data: x"` → `"x"`; exactly one leading space after the colon is
/// stripped, further whitespace is part of the value.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// The last non-null `id` in a run of frames, if any.
fn latest_event_id(frames: &[SseFrame]) -> Option<&str> {
    frames.iter().rev().find_map(|f| f.id.as_deref())
}

/// Map a frame to a domain message. Only frames carrying the configured
/// insert event with an envelope-shaped payload pass; everything else is
/// dropped here with a debug log.
fn map_frame(frame: &SseFrame, insert_event: &str) -> Option<Message> {
    if frame.event.as_deref() != Some(insert_event) {
        return None;
    }
    let data = frame.data.as_deref()?;
    let envelope: StreamEnvelope = match serde_json::from_str(data) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(error = %e, "stream frame data is not an envelope, dropping");
            return None;
        }
    };
    match serde_json::from_value::<Message>(envelope.data) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(error = %e, "envelope payload is not a message, dropping");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

fn backoff_delay(attempt: u32, opts: &StreamOptions) -> Duration {
    let base = opts.backoff_base.as_millis() as u64;
    let factor = (opts.backoff_multiplier as u64)
        .checked_pow(attempt)
        .unwrap_or(u64::MAX);
    let ms = base.saturating_mul(factor).min(opts.backoff_max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Uniform jitter in `[0, delay/2]`. A failed entropy read degrades to zero
/// jitter rather than failing the reconnect path.
fn jitter_for(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    if half == 0 {
        return Duration::ZERO;
    }
    let mut buf = [0u8; 8];
    if getrandom::fill(&mut buf).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(buf) % (half + 1))
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct EventStream {
    client: Arc<HttpBusClient>,
    machine_id: String,
    opts: StreamOptions,
}

/// Control surface over the running consumer task.
pub struct StreamHandle {
    state: Arc<RwLock<StreamState>>,
    cursor: Arc<RwLock<Option<String>>>,
    shutdown: watch::Sender<bool>,
    kick: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        self.state.read().map(|s| *s).unwrap_or(StreamState::Stopped)
    }

    /// Last event id seen on the stream; the resume hint for reconnects.
    pub fn cursor(&self) -> Option<String> {
        self.cursor.read().ok().and_then(|c| c.clone())
    }

    /// Force a disconnect + reconnect cycle (the daemon's watchdog).
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Stop the consumer, aborting any in-flight read. Terminal.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.kick.notify_one();
        if self.task.await.is_err() {
            tracing::debug!("stream task ended abnormally on stop");
        }
    }
}

enum ReadEnd {
    Ended,
    Aborted,
    Shutdown,
}

impl EventStream {
    pub fn new(client: Arc<HttpBusClient>, machine_id: &str, opts: StreamOptions) -> Self {
        Self { client, machine_id: machine_id.to_string(), opts }
    }

    /// Spawn the read loop. Events arrive on the returned channel; the loop
    /// never blocks on the receiver.
    pub fn spawn(self) -> (StreamHandle, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(StreamState::Disconnected));
        let cursor = Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let kick = Arc::new(Notify::new());

        let task = tokio::spawn(run_loop(
            self.client,
            self.machine_id,
            self.opts,
            tx,
            state.clone(),
            cursor.clone(),
            shutdown_rx,
            kick.clone(),
        ));

        (
            StreamHandle { state, cursor, shutdown: shutdown_tx, kick, task },
            rx,
        )
    }
}

fn set_state(state: &Arc<RwLock<StreamState>>, next: StreamState) {
    if let Ok(mut s) = state.write() {
        if *s != next {
            tracing::debug!(from = ?*s, to = ?next, "stream state");
            *s = next;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    client: Arc<HttpBusClient>,
    machine_id: String,
    opts: StreamOptions,
    tx: mpsc::UnboundedSender<StreamEvent>,
    state: Arc<RwLock<StreamState>>,
    cursor: Arc<RwLock<Option<String>>>,
    mut shutdown: watch::Receiver<bool>,
    kick: Arc<Notify>,
) {
    let mut attempt: u32 = 0;
    let mut first = true;

    loop {
        if *shutdown.borrow() {
            break;
        }
        set_state(&state, if first { StreamState::Connecting } else { StreamState::Reconnecting });
        first = false;

        let resume = cursor.read().ok().and_then(|c| c.clone());
        let connect = tokio::select! {
            result = client.open_stream(&machine_id, resume.as_deref()) => result,
            _ = shutdown.changed() => break,
        };
        match connect {
            Ok(resp) => {
                attempt = 0;
                set_state(&state, StreamState::Connected);
                let _ = tx.send(StreamEvent::Status(true));
                tracing::info!(resume = resume.as_deref().unwrap_or("-"), "event stream connected");

                let end = read_frames(
                    resp,
                    client.as_ref(),
                    &opts,
                    &tx,
                    &cursor,
                    &mut shutdown,
                    &kick,
                )
                .await;

                let _ = tx.send(StreamEvent::Status(false));
                if matches!(end, ReadEnd::Shutdown) {
                    break;
                }
                if matches!(end, ReadEnd::Aborted) {
                    tracing::warn!("event stream read aborted, reconnecting");
                } else {
                    tracing::info!("event stream closed by server, reconnecting");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect event stream");
                let _ = tx.send(StreamEvent::Error(e.to_string()));
            }
        }

        if *shutdown.borrow() {
            break;
        }
        set_state(&state, StreamState::Reconnecting);

        let delay = backoff_delay(attempt, &opts) + jitter_for(backoff_delay(attempt, &opts));
        attempt = attempt.saturating_add(1);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
            _ = kick.notified() => {}
        }
    }

    set_state(&state, StreamState::Stopped);
}

async fn read_frames(
    resp: reqwest::Response,
    client: &HttpBusClient,
    opts: &StreamOptions,
    tx: &mpsc::UnboundedSender<StreamEvent>,
    cursor: &Arc<RwLock<Option<String>>>,
    shutdown: &mut watch::Receiver<bool>,
    kick: &Notify,
) -> ReadEnd {
    let mut body = resp.bytes_stream();
    let mut parser = SseParser::new();
    let mut idle_deadline = Instant::now() + opts.idle_threshold;

    loop {
        tokio::select! {
            chunk = body.next() => {
                let chunk = match chunk {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "event stream read error");
                        return ReadEnd::Aborted;
                    }
                    None => return ReadEnd::Ended,
                };
                idle_deadline = Instant::now() + opts.idle_threshold;

                let frames = parser.feed(&chunk);
                if let Some(id) = latest_event_id(&frames) {
                    if let Ok(mut c) = cursor.write() {
                        *c = Some(id.to_string());
                    }
                }
                for frame in &frames {
                    if let Some(msg) = map_frame(frame, &opts.insert_event) {
                        let _ = tx.send(StreamEvent::Insert(msg));
                    }
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                // No bytes for a while: the socket may be silently dead.
                // Probe the service with a cheap GET; on failure abort the
                // read so the reconnect path takes over.
                tracing::debug!("event stream idle, probing bus");
                let probe = tokio::time::timeout(
                    opts.probe_timeout,
                    client.list_agents(1),
                ).await;
                match probe {
                    Ok(Ok(_)) => {
                        idle_deadline = Instant::now() + opts.idle_threshold;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "keepalive probe failed, dropping stream");
                        return ReadEnd::Aborted;
                    }
                    Err(_) => {
                        tracing::warn!("keepalive probe timed out, dropping stream");
                        return ReadEnd::Aborted;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return ReadEnd::Shutdown;
                }
            }
            _ = kick.notified() => {
                tracing::info!("stream kicked, forcing reconnect");
                return ReadEnd::Aborted;
            }
        }
    }
}
