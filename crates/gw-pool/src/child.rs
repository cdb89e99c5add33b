//! The subprocess contract: how a child's argv/env/stdin is built and how its
//! stdout is decoded. One line of newline-delimited JSON per event; exactly
//! one `result` line terminates a well-formed run.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use gw_types::Usage;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// One line of the child's newline-delimited JSON stdout stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildEvent {
    Token {
        content: String,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        name: String,
        #[serde(default)]
        output: Value,
    },
    AgentSpawn {
        agent: String,
    },
    SkillInvoke {
        skill: String,
    },
    Thinking {
        text: String,
    },
    Result {
        text: String,
        usage: Usage,
        model: String,
    },
    /// Forward-compatible catch-all: an event type this build doesn't know
    /// about yet is ignored rather than treated as a parse failure.
    #[serde(other)]
    Unknown,
}

pub struct ChildSpec {
    pub cli_command: String,
    pub prompt: String,
    pub model_alias: String,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub request_id: String,
}

/// Outcome of letting a child run to completion without being cancelled or
/// timed out by the caller: either a terminal `result` event, or a reason the
/// stream never produced one.
pub enum ChildRunOutcome {
    Result { text: String, usage: Usage, model: String },
    MalformedOutput,
    Exited { code: i32 },
}

/// Writes the prompt to a temp file and spawns the child with it wired to
/// stdin — never interpolates the prompt into a shell command line.
pub fn spawn(spec: &ChildSpec) -> std::io::Result<(Child, tempfile::NamedTempFile)> {
    let mut prompt_file = tempfile::NamedTempFile::new()?;
    prompt_file.write_all(spec.prompt.as_bytes())?;
    prompt_file.flush()?;

    let mut cmd = Command::new(&spec.cli_command);
    cmd.arg("-p").arg("--model").arg(&spec.model_alias);
    if let Some(tools) = &spec.allowed_tools {
        if !tools.is_empty() {
            cmd.arg("--allowed-tools").arg(tools.join(","));
        }
    }
    if let Some(dir) = &spec.working_directory {
        cmd.arg("--working-dir").arg(dir);
        cmd.current_dir(dir);
    }
    cmd.env("GATEWAY_REQUEST_ID", &spec.request_id);
    cmd.stdin(Stdio::from(prompt_file.reopen()?));
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let child = cmd.spawn()?;
    Ok((child, prompt_file))
}

/// Reads the child's stdout to completion, forwarding every decoded event to
/// `sink` (if given) and returning the terminal outcome. Does not enforce a
/// timeout or react to cancellation — the caller races this future against
/// those via `tokio::select!`.
pub async fn drive_to_completion(
    mut child: Child,
    sink: Option<mpsc::UnboundedSender<ChildEvent>>,
) -> std::io::Result<ChildRunOutcome> {
    let stdout = child.stdout.take().expect("stdout piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut result: Option<(String, Usage, String)> = None;
    let mut saw_malformed_line = false;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChildEvent>(&line) {
            Ok(ChildEvent::Result { text, usage, model }) => {
                result = Some((text.clone(), usage, model.clone()));
                if let Some(sink) = &sink {
                    let _ = sink.send(ChildEvent::Result { text, usage, model });
                }
            }
            Ok(event) => {
                if let Some(sink) = &sink {
                    let _ = sink.send(event);
                }
            }
            Err(_) => saw_malformed_line = true,
        }
    }

    let status = child.wait().await?;

    if let Some((text, usage, model)) = result {
        return Ok(ChildRunOutcome::Result { text, usage, model });
    }
    if saw_malformed_line || !status.success() {
        if !status.success() {
            return Ok(ChildRunOutcome::Exited {
                code: status.code().unwrap_or(-1),
            });
        }
        return Ok(ChildRunOutcome::MalformedOutput);
    }
    Ok(ChildRunOutcome::MalformedOutput)
}
