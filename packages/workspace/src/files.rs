// ABOUTME: File listing and change-watch helpers for workspace containers
// ABOUTME: Builds the in-container commands and parses their output into typed events

use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::runtime::{OutputStream, RuntimeError, StreamType, WORKSPACE_DIR};

/// Directories that are never listed or watched.
pub const IGNORED_DIRS: &[&str] = &[".git", "node_modules"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Path relative to the workspace directory
    pub path: String,
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub is_directory: bool,
}

/// `find` invocation printing a type letter and relative path per entry.
pub fn list_command() -> Vec<String> {
    let mut argv = vec![
        "find".to_string(),
        WORKSPACE_DIR.to_string(),
        "-mindepth".to_string(),
        "1".to_string(),
    ];
    for dir in IGNORED_DIRS {
        argv.extend([
            "-not".to_string(),
            "-path".to_string(),
            format!("*/{}", dir),
            "-not".to_string(),
            "-path".to_string(),
            format!("*/{}/*", dir),
        ]);
    }
    argv.extend(["-printf".to_string(), "%y\t%P\n".to_string()]);
    argv
}

/// Parse `list_command` output, sorted by path.
pub fn parse_listing(output: &str) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = output
        .lines()
        .filter_map(|line| {
            let (kind, path) = line.split_once('\t')?;
            if path.is_empty() {
                return None;
            }
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            Some(FileEntry {
                path: path.to_string(),
                name,
                is_directory: kind == "d",
            })
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Recursive inotify watcher emitting `EVENTS|PATH` lines.
pub fn watch_command() -> Vec<String> {
    let exclude = format!("(^|/)({})(/|$)", IGNORED_DIRS.join("|").replace('.', "\\."));
    vec![
        "inotifywait".to_string(),
        "-m".to_string(),
        "-r".to_string(),
        "-q".to_string(),
        "-e".to_string(),
        "create,modify,close_write,delete,moved_from,moved_to".to_string(),
        "--exclude".to_string(),
        exclude,
        "--format".to_string(),
        "%e|%w%f".to_string(),
        WORKSPACE_DIR.to_string(),
    ]
}

/// Parse one watcher line such as `CREATE,ISDIR|/workspace/src`.
pub fn parse_watch_line(line: &str) -> Option<FileChange> {
    let (events, full_path) = line.trim_end().split_once('|')?;
    let path = full_path
        .strip_prefix(WORKSPACE_DIR)
        .map(|p| p.trim_start_matches('/'))
        .filter(|p| !p.is_empty())?;

    if path
        .split('/')
        .any(|segment| IGNORED_DIRS.contains(&segment))
    {
        return None;
    }

    let mut kind = None;
    let mut is_directory = false;
    for event in events.split(',') {
        match event {
            "CREATE" | "MOVED_TO" => kind = Some(ChangeKind::Created),
            "DELETE" | "MOVED_FROM" => kind = Some(ChangeKind::Deleted),
            "MODIFY" | "CLOSE_WRITE" => {
                kind = kind.or(Some(ChangeKind::Modified));
            }
            "ISDIR" => is_directory = true,
            _ => {}
        }
    }

    Some(FileChange {
        path: path.to_string(),
        kind: kind?,
        is_directory,
    })
}

/// Turn raw watcher output into change events, splitting lines across chunks.
pub fn change_events(
    output: OutputStream,
) -> impl Stream<Item = Result<FileChange, RuntimeError>> + Send + 'static {
    let stdout = output.try_filter_map(|chunk| async move {
        Ok(match chunk.stream {
            StreamType::Stdout => Some(chunk.data),
            StreamType::Stderr => {
                debug!(
                    "watcher stderr: {}",
                    String::from_utf8_lossy(&chunk.data).trim_end()
                );
                None
            }
        })
    });
    let reader = StreamReader::new(stdout.map_err(|e| io::Error::other(e.to_string())));

    FramedRead::new(reader, LinesCodec::new())
        .map_err(|e| RuntimeError::Exec(format!("file watcher stream failed: {}", e)))
        .try_filter_map(|line| async move {
            let change = parse_watch_line(&line);
            if change.is_none() {
                debug!("Ignoring watcher line: {}", line);
            }
            Ok(change)
        })
        .boxed()
}
