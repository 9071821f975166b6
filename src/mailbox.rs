use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use crate::bus::types::Message;

/// Append one pull-mode message to the agent's inbox file at
/// `<claude_dir>/comms/inbox/<agent_id>.jsonl`. There is no read side here;
/// the session tooling consumes the file on its own schedule.
pub fn append(claude_dir: &Path, agent_id: &str, message: &Message) -> Result<PathBuf> {
    let inbox_dir = claude_dir.join("comms").join("inbox");
    std::fs::create_dir_all(&inbox_dir)
        .with_context(|| format!("failed to create inbox dir {}", inbox_dir.display()))?;

    let path = inbox_dir.join(format!("{agent_id}.jsonl"));
    let record = json!({
        "message_id": message.id,
        "sender_id": message.sender_id,
        "content": message.content,
        "message_type": message.message_type,
        "metadata": message.metadata,
        "thread_id": message.thread_id,
        "created_at": message.created_at,
        "received_at": Utc::now(),
    });

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open mailbox {}", path.display()))?;
    let mut line = serde_json::to_string(&record).context("failed to encode mailbox record")?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to mailbox {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::{MessageStatus, MessageType, TargetType};
    use tempfile::TempDir;

    fn message(id: &str) -> Message {
        Message {
            id: id.into(),
            channel_id: None,
            sender_id: "X".into(),
            target_type: TargetType::Agent,
            target_address: "A1".into(),
            message_type: MessageType::Async,
            content: "for later".into(),
            metadata: json!({"deliveryMode": "pull"}),
            status: MessageStatus::Pending,
            claimed_by: None,
            thread_id: Some("t1".into()),
            created_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn test_creates_directories_and_file_on_first_write() {
        let tmp = TempDir::new().unwrap();
        let path = append(tmp.path(), "A1", &message("m1")).unwrap();
        assert!(path.ends_with("comms/inbox/A1.jsonl"));
        assert!(path.exists());
    }

    #[test]
    fn test_appends_one_json_line_per_message() {
        let tmp = TempDir::new().unwrap();
        append(tmp.path(), "A1", &message("m1")).unwrap();
        let path = append(tmp.path(), "A1", &message("m2")).unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["message_id"], "m1");
        assert_eq!(first["sender_id"], "X");
        assert_eq!(first["thread_id"], "t1");
        assert_eq!(first["metadata"]["deliveryMode"], "pull");
        assert!(first["received_at"].is_string());
    }

    #[test]
    fn test_agents_get_separate_inboxes() {
        let tmp = TempDir::new().unwrap();
        let p1 = append(tmp.path(), "A1", &message("m1")).unwrap();
        let p2 = append(tmp.path(), "A2", &message("m2")).unwrap();
        assert_ne!(p1, p2);
    }
}
