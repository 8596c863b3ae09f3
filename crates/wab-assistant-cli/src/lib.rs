//! Assistant backed by an external completion command.
//!
//! Each call spawns the configured program, writes one JSON request to its
//! stdin and reads the answer from stdout. The answer is either plain text or
//! a JSON object `{ "text": ..., "thread_id": ... }`; a returned thread id is
//! remembered per conversation and passed back on the next call.

use std::{collections::VecDeque, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tracing::{debug, warn};

use wab_core::{
    assistant::{Assistant, AskRequest, ConversationState},
    errors::Error,
    utils::truncate_text,
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const THREAD_ID_KEY: &str = "thread_id";

#[derive(Clone, Debug)]
pub struct CommandAssistantConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct CommandAssistant {
    cfg: CommandAssistantConfig,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    assistant_id: &'a str,
    conversation_id: &'a str,
    prompt: &'a str,
    thread_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct CommandResponse {
    text: String,
    thread_id: Option<String>,
}

#[derive(Deserialize)]
struct JsonResponse {
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

impl CommandAssistant {
    pub fn new(cfg: CommandAssistantConfig) -> Self {
        Self { cfg }
    }

    async fn run(&self, payload: Vec<u8>, tail: Arc<Mutex<StderrTail>>) -> Result<String> {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::External(format!(
                "failed to start assistant command {}: {e}",
                self.cfg.program.display()
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("assistant stdin was not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("assistant stdout was not captured".to_string()))?;

        // Drain stderr in background to avoid blocking on a full pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            })
        });

        let write = async move {
            let res = async {
                stdin.write_all(&payload).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            }
            .await;
            match res {
                // The command may answer without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let read = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };
        let (written, output) = tokio::join!(write, read);
        let output = output?;
        written?;

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if !status.success() {
            return Err(Error::External(format!(
                "assistant command exited with status {status}"
            )));
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

#[async_trait]
impl Assistant for CommandAssistant {
    async fn ask(&self, req: AskRequest<'_>, state: &ConversationState) -> Result<String> {
        let thread_id = state
            .get(THREAD_ID_KEY)
            .await
            .and_then(|v| v.as_str().map(str::to_string));

        let payload = serde_json::to_vec(&CommandRequest {
            assistant_id: req.assistant_id,
            conversation_id: req.conversation.as_str(),
            prompt: req.prompt,
            thread_id,
        })?;

        debug!(conversation = %req.conversation, "running assistant command");

        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let outcome = tokio::time::timeout(self.cfg.timeout, self.run(payload, tail.clone())).await;
        let stdout = match outcome {
            Ok(Ok(stdout)) => stdout,
            Ok(Err(e)) => return Err(with_stderr(e, &tail).await),
            Err(_) => {
                let e = Error::External(format!(
                    "assistant command timed out after {}ms",
                    self.cfg.timeout.as_millis()
                ));
                return Err(with_stderr(e, &tail).await);
            }
        };

        let response = match parse_response(&stdout) {
            Ok(r) => r,
            Err(e) => return Err(with_stderr(e, &tail).await),
        };

        if let Some(id) = response.thread_id {
            state.set(THREAD_ID_KEY, serde_json::Value::String(id)).await;
        }
        Ok(response.text)
    }
}

async fn with_stderr(err: Error, tail: &Mutex<StderrTail>) -> Error {
    let stderr = tail.lock().await.snapshot();
    if stderr.trim().is_empty() {
        return err;
    }
    warn!(stderr = %truncate_text(&stderr, 500), "assistant command failed");
    match err {
        Error::External(msg) => Error::External(format!("{msg}\nstderr (tail):\n{stderr}")),
        other => Error::External(format!("{other}\nstderr (tail):\n{stderr}")),
    }
}

fn parse_response(stdout: &str) -> Result<CommandResponse> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(Error::External(
            "assistant command produced no output".to_string(),
        ));
    }

    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<JsonResponse>(trimmed) {
            if parsed.text.trim().is_empty() {
                return Err(Error::External(
                    "assistant command returned an empty answer".to_string(),
                ));
            }
            return Ok(CommandResponse {
                text: parsed.text,
                thread_id: parsed.thread_id.filter(|id| !id.is_empty()),
            });
        }
    }

    Ok(CommandResponse {
        text: trimmed.to_string(),
        thread_id: None,
    })
}
