use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

/// Transcripts untouched for longer than this are not live sessions.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60 * 60);

const TRANSCRIPT_SUFFIX: &str = "jsonl";
const SESSION_INDEX_FILE: &str = "global-sessions.json";

/// One live session on this host. `agent_id` stays `None` until the registry
/// has registered it with the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSession {
    pub session_id: String,
    pub session_name: Option<String>,
    pub project_path: PathBuf,
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndexEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    project_path: Option<PathBuf>,
}

/// Scan the tool directory for sessions whose transcript was touched within
/// `active_window`. Pure with respect to fs state; mutates nothing.
///
/// Layout scanned: `<claude_dir>/projects/<encoded-project>/<uuid>.jsonl`.
/// Names and authoritative project paths come from the session index; when
/// the index is missing or malformed the project path is decoded from the
/// directory name.
pub fn discover_sessions(claude_dir: &Path, active_window: Duration) -> Vec<LocalSession> {
    let projects_dir = claude_dir.join("projects");
    let index = load_session_index(&claude_dir.join(SESSION_INDEX_FILE));

    let entries = match std::fs::read_dir(&projects_dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let decoded = decode_project_dir(&entry.file_name().to_string_lossy());

        let files = match std::fs::read_dir(&dir) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable project dir");
                continue;
            }
        };

        for file in files.flatten() {
            let path = file.path();
            let Some(session_id) = transcript_session_id(&path) else {
                continue;
            };
            if !modified_within(&path, active_window) {
                continue;
            }

            let indexed = index.get(&session_id);
            let session_name = indexed.and_then(|e| e.name.clone());
            let project_path = indexed
                .and_then(|e| e.project_path.clone())
                .unwrap_or_else(|| decoded.clone());

            sessions.push(LocalSession {
                session_id,
                session_name,
                project_path,
                agent_id: None,
            });
        }
    }
    sessions
}

/// File stem must be a version-4 UUID and the extension the transcript
/// suffix.
fn transcript_session_id(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != TRANSCRIPT_SUFFIX {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let uuid = Uuid::parse_str(stem).ok()?;
    (uuid.get_version_num() == 4).then(|| stem.to_string())
}

fn modified_within(path: &Path, window: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age < window)
        .unwrap_or(false)
}

/// `-work-proj` → `/work/proj`. Lossy (the encoding also folds dots), which
/// is why the index is consulted first.
fn decode_project_dir(name: &str) -> PathBuf {
    if let Some(rest) = name.strip_prefix('-') {
        PathBuf::from(format!("/{}", rest.replace('-', "/")))
    } else {
        PathBuf::from(name)
    }
}

fn load_session_index(path: &Path) -> HashMap<String, SessionIndexEntry> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str(&raw) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "malformed session index, ignoring");
            HashMap::new()
        }
    }
}
