//! Filesystem tools: read, write, edit, list, search.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;

use super::{Tool, ToolContext, ToolDescriptor, ToolError, descriptors};

/// Cap on search hits returned by `search_files`.
const SEARCH_MATCH_CAP: usize = 200;
/// Cap on entries returned by `list_dir`.
const LIST_ENTRY_CAP: usize = 500;

/// All filesystem tools.
pub(super) fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFile),
        Arc::new(WriteFile),
        Arc::new(EditFile),
        Arc::new(ListDir),
        Arc::new(SearchFiles),
    ]
}

fn descriptor_for(name: &str) -> ToolDescriptor {
    descriptors()
        .into_iter()
        .find(|d| d.name == name)
        .expect("built-in descriptor exists")
}

fn resolve(ctx: &ToolContext, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        ctx.root.join(path)
    }
}

fn required_str<'a>(args: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput(format!("missing '{name}'")))
}

struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("read_file")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = resolve(ctx, required_str(args, "path")?);
        let bytes = fs::read(&path).await.map_err(|e| {
            ToolError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("write_file")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = resolve(ctx, required_str(args, "path")?);
        let content = required_str(args, "content")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
    }
}

struct EditFile;

#[async_trait]
impl Tool for EditFile {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("edit_file")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = resolve(ctx, required_str(args, "path")?);
        let find = required_str(args, "find")?;
        let replace = required_str(args, "replace")?;
        if find.is_empty() {
            return Err(ToolError::InvalidInput("'find' must not be empty".into()));
        }
        let content = fs::read_to_string(&path).await.map_err(|e| {
            ToolError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;
        let Some(at) = content.find(find) else {
            return Err(ToolError::InvalidInput(format!(
                "text not found in {}: {:?}",
                path.display(),
                truncate_for_error(find)
            )));
        };
        let occurrences = content.matches(find).count();
        let mut edited = String::with_capacity(content.len());
        edited.push_str(&content[..at]);
        edited.push_str(replace);
        edited.push_str(&content[at + find.len()..]);
        fs::write(&path, &edited).await?;
        let note = if occurrences > 1 {
            format!(" ({} further occurrence(s) left untouched)", occurrences - 1)
        } else {
            String::new()
        };
        Ok(format!("replaced first occurrence in {}{note}", path.display()))
    }
}

fn truncate_for_error(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{head}...")
    }
}

struct ListDir;

#[async_trait]
impl Tool for ListDir {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("list_dir")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = resolve(ctx, required_str(args, "path")?);
        let filter = args
            .get("glob")
            .and_then(Value::as_str)
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::InvalidInput(format!("bad glob: {e}")))?;

        let mut reader = fs::read_dir(&path).await.map_err(|e| {
            ToolError::InvalidInput(format!("cannot list {}: {e}", path.display()))
        })?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(pattern) = &filter {
                if !pattern.matches(&name) {
                    continue;
                }
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
            if entries.len() >= LIST_ENTRY_CAP {
                break;
            }
        }
        entries.sort();
        if entries.is_empty() {
            Ok("(empty)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

struct SearchFiles;

#[async_trait]
impl Tool for SearchFiles {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("search_files")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let pattern = required_str(args, "pattern")?.to_string();
        let path = resolve(ctx, required_str(args, "path")?);
        let is_regex = args.get("is_regex").and_then(Value::as_bool).unwrap_or(false);

        let matcher = if is_regex {
            Matcher::Regex(
                regex::Regex::new(&pattern)
                    .map_err(|e| ToolError::InvalidInput(format!("bad regex: {e}")))?,
            )
        } else {
            Matcher::Literal(pattern)
        };

        // The walk is synchronous; run it off the async workers.
        let hits = tokio::task::spawn_blocking(move || search_tree(&path, &matcher))
            .await
            .map_err(|e| ToolError::Subprocess(format!("search task: {e}")))??;

        if hits.is_empty() {
            Ok("no matches".to_string())
        } else {
            Ok(hits.join("\n"))
        }
    }
}

enum Matcher {
    Literal(String),
    Regex(regex::Regex),
}

impl Matcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            Self::Literal(text) => line.contains(text),
            Self::Regex(re) => re.is_match(line),
        }
    }
}

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__"];

fn search_tree(root: &Path, matcher: &Matcher) -> Result<Vec<String>, ToolError> {
    let mut hits = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let reader = match std::fs::read_dir(&dir) {
            Ok(r) => r,
            Err(_) => continue,
        };
        for entry in reader.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if !SKIP_DIRS.contains(&name.as_str()) {
                    stack.push(path);
                }
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue; // binary or unreadable
            };
            let display = path.strip_prefix(root).unwrap_or(&path).display().to_string();
            for (lineno, line) in content.lines().enumerate() {
                if matcher.matches(line) {
                    hits.push(format!("{display}:{}: {}", lineno + 1, line.trim_end()));
                    if hits.len() >= SEARCH_MATCH_CAP {
                        hits.push(format!("(stopped after {SEARCH_MATCH_CAP} matches)"));
                        return Ok(hits);
                    }
                }
            }
        }
    }
    Ok(hits)
}
