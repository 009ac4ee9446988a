// ABOUTME: Sentinel protocol for detecting command completion in a reused shell
// ABOUTME: Appends an exit-code marker to each command and scans output incrementally

use uuid::Uuid;

use crate::runtime::{OutputChunk, StreamType};
use crate::shell::ExecOutput;

/// A marker that cannot collide with output produced by earlier commands.
pub fn unique_marker() -> String {
    format!("__SANDCASTLE_DONE_{}__", Uuid::new_v4().simple())
}

/// The line written to the shell: the command, then the marker and `$?`.
pub fn wrap_command(command: &str, marker: &str) -> String {
    format!("{}; echo {}$?\n", command.trim_end(), marker)
}

/// Accumulates shell output until the marker and its exit code have arrived.
#[derive(Debug)]
pub struct CompletionScanner {
    marker: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    searched: usize,
    marker_at: Option<usize>,
}

impl CompletionScanner {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().into_bytes(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            searched: 0,
            marker_at: None,
        }
    }

    /// Feed one chunk. Returns the finished output once the exit code is complete.
    pub fn push(&mut self, chunk: &OutputChunk) -> Option<ExecOutput> {
        match chunk.stream {
            StreamType::Stderr => {
                self.stderr.extend_from_slice(&chunk.data);
                None
            }
            StreamType::Stdout => {
                self.stdout.extend_from_slice(&chunk.data);
                self.poll()
            }
        }
    }

    /// Resolve with whatever arrived when the stream ends early.
    pub fn finish(self) -> ExecOutput {
        match self.marker_at {
            Some(at) => {
                let digits = self.digits_after(at);
                let exit_code = parse_exit_code(digits);
                self.into_output(at, exit_code)
            }
            None => {
                let end = self.stdout.len();
                self.into_output(end, None)
            }
        }
    }

    fn poll(&mut self) -> Option<ExecOutput> {
        let at = match self.marker_at {
            Some(at) => at,
            None => {
                let at = find(&self.stdout[self.searched..], &self.marker)
                    .map(|offset| offset + self.searched);
                match at {
                    Some(at) => {
                        self.marker_at = Some(at);
                        at
                    }
                    None => {
                        // Keep a marker-length tail so a split marker is still found
                        self.searched = self
                            .stdout
                            .len()
                            .saturating_sub(self.marker.len().saturating_sub(1));
                        return None;
                    }
                }
            }
        };

        let tail = &self.stdout[at + self.marker.len()..];
        // The exit code is only complete once a non-digit terminator follows it
        let terminator = tail.iter().position(|b| !b.is_ascii_digit())?;
        let exit_code = parse_exit_code(&tail[..terminator]);

        let done = std::mem::replace(self, CompletionScanner::new(String::new()));
        Some(done.into_output(at, exit_code))
    }

    fn digits_after(&self, at: usize) -> &[u8] {
        let tail = &self.stdout[at + self.marker.len()..];
        let end = tail
            .iter()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(tail.len());
        &tail[..end]
    }

    fn into_output(mut self, stdout_end: usize, exit_code: Option<i64>) -> ExecOutput {
        self.stdout.truncate(stdout_end);
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code,
        }
    }
}

fn parse_exit_code(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
