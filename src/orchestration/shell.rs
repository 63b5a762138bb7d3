//! Task body that runs an external command.
//!
//! The payload names the command to run:
//!
//! ```json
//! { "command": ["make", "docs"], "cwd": "site", "partial_exit_codes": [3] }
//! ```
//!
//! Every stdout line is published as a heartbeat note. Exit 0 is success,
//! an exit code listed in `partial_exit_codes` is partial, anything else is
//! a failure carrying the tail of stderr. The child is killed if the worker
//! drops it (timeout or cancellation).

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::orchestration::task::{TaskContext, TaskError, TaskHandler, TaskOutcome};

const TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
struct ShellPayload {
    command: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    partial_exit_codes: Vec<i32>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Runs `payload.command` with `STAGEHAND_ITEM_ID` and `STAGEHAND_ITEM_KIND`
/// set in its environment.
#[derive(Debug, Clone, Default)]
pub struct ShellHandler {
    base_dir: Option<PathBuf>,
}

impl ShellHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative `cwd` entries against `dir`.
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
        }
    }

    fn working_dir(&self, cwd: Option<PathBuf>) -> Option<PathBuf> {
        match (cwd, &self.base_dir) {
            (Some(cwd), Some(base)) if cwd.is_relative() => Some(base.join(cwd)),
            (Some(cwd), _) => Some(cwd),
            (None, base) => base.clone(),
        }
    }
}

/// Read `reader` line by line, keeping the last `TAIL_LINES`.
///
/// Output is not required to be UTF-8; invalid bytes are replaced.
async fn tail<R: AsyncRead + Unpin>(
    reader: R,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut kept = VecDeque::with_capacity(TAIL_LINES);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        on_line(&line);
        if kept.len() == TAIL_LINES {
            kept.pop_front();
        }
        kept.push_back(line);
    }
    Ok(kept.into())
}

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let payload: ShellPayload = serde_json::from_value(ctx.payload().clone())?;
        let Some((program, args)) = payload.command.split_first() else {
            return Err(TaskError::new("payload.command is empty"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&payload.env)
            .env("STAGEHAND_ITEM_ID", ctx.item().id().as_str())
            .env("STAGEHAND_ITEM_KIND", ctx.item().kind().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir(payload.cwd) {
            command.current_dir(dir);
        }

        tracing::debug!(item = %ctx.item().id(), program = %program, "spawning command");
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::new("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::new("child stderr not captured"))?;

        let (stdout_tail, stderr_tail, status) = tokio::try_join!(
            tail(stdout, |line| ctx.heartbeat(line)),
            tail(stderr, |_| {}),
            child.wait(),
        )?;

        let code = status.code();
        let output = serde_json::json!({
            "exit_code": code,
            "stdout_tail": stdout_tail,
        });

        match code {
            Some(0) => Ok(TaskOutcome::Success(output)),
            Some(code) if payload.partial_exit_codes.contains(&code) => Ok(TaskOutcome::Partial {
                output,
                detail: format!("exit code {}: {}", code, stderr_tail.join("\n")),
            }),
            _ => {
                let reason = match code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                };
                Err(TaskError::new(if stderr_tail.is_empty() {
                    reason
                } else {
                    format!("{}: {}", reason, stderr_tail.join("\n"))
                }))
            }
        }
    }
}
