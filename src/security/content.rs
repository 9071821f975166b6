use std::path::{Component, Path, PathBuf};

use super::SecurityError;

/// Hard cap on sanitized content length, in characters.
const MAX_CONTENT_CHARS: usize = 100_000;

/// Reject empty content, normalize line endings, strip control characters,
/// and truncate oversize payloads. Returns the sanitized form.
pub fn validate_and_sanitize(raw: &str) -> Result<String, SecurityError> {
    if raw.trim().is_empty() {
        return Err(SecurityError::InvalidContent(
            "content is empty or whitespace-only".to_string(),
        ));
    }

    let mut out = String::with_capacity(raw.len().min(MAX_CONTENT_CHARS));
    let mut kept = 0usize;
    for c in raw.replace("\r\n", "\n").trim().chars() {
        if c == '\n' || c == '\t' || !c.is_control() {
            out.push(c);
            kept += 1;
            if kept >= MAX_CONTENT_CHARS {
                break;
            }
        }
    }
    Ok(out)
}

/// Scan content for absolute filesystem references and reject any that fall
/// outside every allowed root. With no roots configured there is nothing to
/// enforce against and everything passes.
pub fn enforce_directories(content: &str, allowed: &[PathBuf]) -> Result<(), SecurityError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let roots: Vec<PathBuf> = allowed.iter().map(|p| normalize(p)).collect();

    for reference in extract_absolute_paths(content) {
        let resolved = normalize(Path::new(&reference));
        if !roots.iter().any(|root| resolved.starts_with(root)) {
            return Err(SecurityError::DirectoryDenied(
                resolved.to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(())
}

/// Pull out `/abs/path`-shaped tokens. A path starts at a `/` preceded by
/// nothing, whitespace, or a quote/bracket, which skips URLs (`://`) and
/// infix slashes in prose.
fn extract_absolute_paths(content: &str) -> Vec<String> {
    const OPENERS: &[char] = &['"', '\'', '`', '(', '[', '<', '=', ','];
    let mut paths = Vec::new();
    let mut prev: Option<char> = None;
    let mut chars = content.char_indices();

    while let Some((i, c)) = chars.next() {
        let starts = c == '/'
            && prev.map_or(true, |p| p.is_whitespace() || OPENERS.contains(&p));
        if starts {
            let rest = &content[i..];
            let len = rest
                .chars()
                .take_while(|&c| is_path_char(c))
                .map(|c| c.len_utf8())
                .sum::<usize>();
            let candidate = rest[..len].trim_end_matches(['.', ',', ')', ']']);
            // A lone slash is prose, not a reference.
            if candidate.len() > 1 {
                paths.push(candidate.to_string());
            }
            for _ in candidate.chars().skip(1) {
                chars.next();
            }
            prev = Some('/');
            continue;
        }
        prev = Some(c);
    }
    paths
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '~' | '+')
}

/// Lexical resolution of `.` and `..`; never touches the filesystem, so a
/// reference to a nonexistent path still resolves and still gets judged.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
