// ABOUTME: Persistent interactive shell bound to a workspace container
// ABOUTME: Writes wrapped commands to stdin and resolves them via the completion scanner

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::completion::{self, CompletionScanner};
use crate::demux::FrameCodec;
use crate::runtime::{OutputStream, Result, RuntimeError};

/// Captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct ShellSession {
    input: Pin<Box<dyn AsyncWrite + Send>>,
    output: OutputStream,
    closed: bool,
}

impl ShellSession {
    pub fn new(input: Pin<Box<dyn AsyncWrite + Send>>, output: OutputStream) -> Self {
        Self {
            input,
            output,
            closed: false,
        }
    }

    /// Session over a raw byte channel carrying multiplexed stdout/stderr frames.
    pub fn from_multiplexed<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let output = FramedRead::new(reader, FrameCodec)
            .map_err(RuntimeError::from)
            .boxed();
        Self::new(Box::pin(writer), output)
    }

    /// Submit `command` and wait for its completion marker.
    ///
    /// If the shell stream ends before the marker shows up, the output captured
    /// so far is returned without an exit code.
    pub async fn run(&mut self, command: &str) -> Result<ExecOutput> {
        if self.closed {
            return Err(RuntimeError::Exec("shell session is closed".to_string()));
        }

        let marker = completion::unique_marker();
        let line = completion::wrap_command(command, &marker);
        debug!("Submitting shell command: {}", command);

        self.input
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RuntimeError::Exec(format!("failed to write to shell: {}", e)))?;
        self.input
            .flush()
            .await
            .map_err(|e| RuntimeError::Exec(format!("failed to flush shell input: {}", e)))?;

        let mut scanner = CompletionScanner::new(marker);
        while let Some(chunk) = self.output.next().await {
            let chunk = chunk?;
            if let Some(done) = scanner.push(&chunk) {
                return Ok(done);
            }
        }

        warn!("Shell stream ended before command completed: {}", command);
        self.closed = true;
        Ok(scanner.finish())
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.input.shutdown().await {
            debug!("Shell input already closed: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::OutputChunk;
    use futures::SinkExt;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_util::codec::FramedWrite;

    /// Answers each submitted line with the given frames, splitting the
    /// marker from its exit code to mimic unaligned reads.
    fn scripted_shell(exit_code: &'static str, stdout: &'static str) -> ShellSession {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let mut frames = FramedWrite::new(server_write, FrameCodec);
            while let Ok(Some(line)) = lines.next_line().await {
                let marker = line
                    .rsplit_once("echo ")
                    .map(|(_, m)| m.trim_end_matches("$?").to_string())
                    .unwrap();
                frames.send(OutputChunk::stdout(stdout)).await.unwrap();
                frames.send(OutputChunk::stderr("note\n")).await.unwrap();
                frames.send(OutputChunk::stdout(marker)).await.unwrap();
                frames.send(OutputChunk::stdout(exit_code)).await.unwrap();
                frames.send(OutputChunk::stdout("\n")).await.unwrap();
            }
        });

        ShellSession::from_multiplexed(client_read, client_write)
    }

    #[tokio::test]
    async fn test_run_resolves_with_exit_code() {
        let mut shell = scripted_shell("0", "hi\n");

        let output = shell.run("echo hi").await.expect("Failed to run command");

        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "note\n");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_shell_is_reusable_across_commands() {
        let mut shell = scripted_shell("2", "");

        let first = shell.run("ls nope").await.expect("Failed to run first");
        let second = shell.run("ls nope").await.expect("Failed to run second");

        assert_eq!(first.exit_code, Some(2));
        assert_eq!(second.exit_code, Some(2));
        assert_eq!(second.stderr, "note\n");
    }

    #[tokio::test]
    async fn test_run_returns_partial_output_when_stream_ends() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);

        tokio::spawn(async move {
            let (server_read, server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            let mut frames = FramedWrite::new(server_write, FrameCodec);
            let _ = lines.next_line().await;
            frames.send(OutputChunk::stdout("half")).await.unwrap();
            // dropping both halves ends the stream without a marker
        });

        let mut shell = ShellSession::from_multiplexed(client_read, client_write);
        let output = shell.run("sleep 100").await.expect("Failed to run command");

        assert_eq!(output.stdout, "half");
        assert_eq!(output.exit_code, None);
        assert!(shell.is_closed());
    }

    #[tokio::test]
    async fn test_closed_shell_rejects_commands() {
        let mut shell = scripted_shell("0", "");
        shell.close().await;

        let result = shell.run("echo hi").await;

        assert!(matches!(result, Err(RuntimeError::Exec(_))));
    }
}
