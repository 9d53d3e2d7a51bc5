//! System command runner: executes a command on the node, forwards its
//! stderr as log entries, and optionally captures its stdout as file data.

use super::Runner;
use crate::run::{Arg, Feedback};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Run a system command. Exactly one of `command` (run via `sh -c`) or
/// `argv` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    /// Shell form, run via `sh -c`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Argv form, exec'd directly
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,

    /// Capture stdout as file data under this name; when unset, stdout is
    /// forwarded as log entries like stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Treat a non-zero exit status as success
    #[serde(default)]
    pub ignore_errors: bool,
}

impl System {
    pub fn command(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    pub fn argv(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn display(&self) -> String {
        match &self.command {
            Some(c) => c.clone(),
            None => self.argv.join(" "),
        }
    }
}

#[async_trait]
impl Runner for System {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let mut cmd = match (&self.command, self.argv.as_slice()) {
            (Some(c), []) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(c);
                cmd
            }
            (None, [prog, args @ ..]) => {
                let mut cmd = Command::new(prog);
                cmd.args(args);
                cmd
            }
            _ => return Err(anyhow!("system: exactly one of command or argv must be set")),
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        arg.rec.log("system", format!("run started: {}", self.display()));
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.display()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Forward stderr lines as they arrive.
        let stderr_task = {
            let rec = arg.rec.clone();
            tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        rec.log("system", line);
                    }
                }
            })
        };

        // Capture or forward stdout.
        let stdout_task = {
            let rec = arg.rec.clone();
            let capture = self.stdout.clone();
            tokio::spawn(async move {
                let Some(stdout) = stdout else { return };
                match capture {
                    Some(name) => {
                        let mut r = BufReader::new(stdout);
                        let mut buf = vec![0u8; 64 * 1024];
                        loop {
                            match r.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => rec.file(&name, buf[..n].to_vec()),
                            }
                        }
                    }
                    None => {
                        let mut lines = BufReader::new(stdout).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            rec.log("system", line);
                        }
                    }
                }
            })
        };

        let status = tokio::select! {
            status = child.wait() => status.with_context(|| format!("waiting for {}", self.display()))?,
            _ = arg.ctx.canceled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = stderr_task.await;
                let _ = stdout_task.await;
                return Err(anyhow!("context canceled"));
            }
        };
        let _ = stderr_task.await;
        let _ = stdout_task.await;

        if !status.success() && !self.ignore_errors {
            return Err(anyhow!("{} exited with {}", self.display(), status));
        }
        Ok(Feedback::new())
    }

    fn validate(&self) -> Result<()> {
        match (&self.command, self.argv.is_empty()) {
            (Some(_), true) => Ok(()),
            (None, false) => Ok(()),
            (None, true) => Err(anyhow!("system: one of command or argv must be set")),
            (Some(_), false) => Err(anyhow!("system: command and argv are mutually exclusive")),
        }
    }
}
