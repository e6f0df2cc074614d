use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// An external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs external commands, streaming their combined output.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `command` to completion, handing each stdout/stderr chunk to
    /// `output` in arrival order. Returns the exit code (-1 when killed by a
    /// signal). An `Err` means the process could not be run at all.
    async fn execute(
        &self,
        command: &CommandSpec,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn execute(
        &self,
        command: &CommandSpec,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %command, "Spawning process");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", command))?;

        let stdout = child
            .stdout
            .take()
            .context("failed to capture stdout from child process")?;
        let stderr = child
            .stderr
            .take()
            .context("failed to capture stderr from child process")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(forward_lines(stdout, tx.clone()));
        let stderr_task = tokio::spawn(forward_lines(stderr, tx));

        while let Some(chunk) = rx.recv().await {
            output(&chunk);
        }
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for `{}`", command))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let runner = TokioProcessRunner;
        let cmd = CommandSpec::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let mut captured = String::new();
        let code = runner
            .execute(&cmd, &mut |chunk| captured.push_str(chunk))
            .await
            .unwrap();

        assert_eq!(code, 3);
        assert!(captured.contains("out\n"));
        assert!(captured.contains("err\n"));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CommandSpec::new("pwd").current_dir(dir.path());
        let mut captured = String::new();
        let code = TokioProcessRunner
            .execute(&cmd, &mut |chunk| captured.push_str(chunk))
            .await
            .unwrap();

        assert_eq!(code, 0);
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(captured.trim_end().ends_with(&name));
    }

    #[tokio::test]
    async fn streams_through_trait_object_into_local_buffer() {
        let runner: std::sync::Arc<dyn ProcessRunner> = std::sync::Arc::new(TokioProcessRunner);
        let cmd = CommandSpec::new("sh").args(["-c", "printf 'a\\nb\\n'"]);
        let mut lines = Vec::new();
        let mut collect = |chunk: &str| lines.push(chunk.to_string());
        let code = runner.execute(&cmd, &mut collect).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(lines, vec!["a\n".to_string(), "b\n".to_string()]);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let cmd = CommandSpec::new("definitely-not-a-real-binary-4711");
        assert!(TokioProcessRunner.execute(&cmd, &mut |_| {}).await.is_err());
    }

    #[test]
    fn display_joins_arguments() {
        let cmd = CommandSpec::new("docker").args(["rm", "-f", "pv-1"]);
        assert_eq!(cmd.to_string(), "docker rm -f pv-1");
    }
}
