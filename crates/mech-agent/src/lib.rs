// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-agent
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The agent subprocess contract. The agent is a black box that receives
//! the composed prompt on stdin and its job identity through environment
//! variables, and emits one JSON record per stdout line. The transport
//! parses incrementally and keeps everything captured so far even when the
//! process exits abnormally or times out; stderr is forwarded through
//! `tracing`.

use mech_core::{AgentTelemetry, DeliveryStatus, ToolCall};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Job identity environment
// ---------------------------------------------------------------------------

/// Env var: request id being executed.
pub const ENV_REQUEST_ID: &str = "MECH_REQUEST_ID";
/// Env var: job definition id.
pub const ENV_JOB_DEFINITION_ID: &str = "MECH_JOB_DEFINITION_ID";
/// Env var: human-readable job name.
pub const ENV_JOB_NAME: &str = "MECH_JOB_NAME";
/// Env var: workstream id.
pub const ENV_WORKSTREAM_ID: &str = "MECH_WORKSTREAM_ID";
/// Env var: mech address the request was directed at.
pub const ENV_MECH_ADDRESS: &str = "MECH_MECH_ADDRESS";
/// Env var: base branch for coding jobs.
pub const ENV_BASE_BRANCH: &str = "MECH_BASE_BRANCH";
/// Env var: working branch for coding jobs.
pub const ENV_BRANCH_NAME: &str = "MECH_BRANCH_NAME";
/// Env var: JSON array of required tools.
pub const ENV_REQUIRED_TOOLS: &str = "MECH_REQUIRED_TOOLS";
/// Env var: JSON array of available tools.
pub const ENV_AVAILABLE_TOOLS: &str = "MECH_AVAILABLE_TOOLS";
/// Env var: JSON array of models the agent may use.
pub const ENV_ALLOWED_MODELS: &str = "MECH_ALLOWED_MODELS";
/// Env var: default model.
pub const ENV_DEFAULT_MODEL: &str = "MECH_DEFAULT_MODEL";

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One JSONL record on the agent's stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// A chunk of output text.
    Output {
        /// The text chunk.
        text: String,
    },
    /// A tool invocation record.
    ToolCall {
        /// The observed call.
        #[serde(flatten)]
        call: ToolCall,
    },
    /// A mid-run status update.
    StatusUpdate {
        /// Reported status.
        status: DeliveryStatus,
    },
    /// The final structured record; at most one per run.
    #[serde(rename_all = "camelCase")]
    Result {
        /// Full output text (authoritative over accumulated chunks).
        #[serde(default)]
        output: Option<String>,
        /// Structured summary.
        #[serde(default)]
        structured_summary: Option<serde_json::Value>,
        /// Agent-reported final status.
        #[serde(default)]
        job_instance_status_update: Option<DeliveryStatus>,
        /// Run telemetry.
        #[serde(default)]
        telemetry: Option<AgentTelemetry>,
    },
}

// ---------------------------------------------------------------------------
// Spec & outcome
// ---------------------------------------------------------------------------

/// How to spawn one agent run.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Executable.
    pub command: String,
    /// Fixed arguments.
    pub args: Vec<String>,
    /// Environment variables (job identity plus overrides).
    pub env: BTreeMap<String, String>,
    /// Working directory; read-only workspace for the agent.
    pub cwd: Option<PathBuf>,
    /// Wall-clock timeout for the whole run.
    pub timeout: Duration,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Clean exit after (or without) a final record.
    Completed,
    /// The wall-clock timeout expired; the process was killed.
    TimedOut,
    /// The process exited non-zero or was killed externally.
    Crashed(Option<i32>),
}

/// Everything captured from one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Output text: the final record's when present, otherwise the
    /// concatenated stream chunks.
    pub output: String,
    /// Structured summary from the final record.
    pub structured_summary: Option<serde_json::Value>,
    /// Agent-reported status, from the final record or the last update.
    pub reported_status: Option<DeliveryStatus>,
    /// Merged telemetry.
    pub telemetry: AgentTelemetry,
    /// How the process ended.
    pub exit: AgentExit,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl AgentOutcome {
    /// `true` when the run hit its wall-clock timeout.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.exit == AgentExit::TimedOut
    }
}

/// Transport-level failures (the run itself never "fails": partial capture
/// is always returned).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The process could not be spawned.
    #[error("agent spawn: {0}")]
    Spawn(std::io::Error),
    /// Writing the prompt to stdin failed.
    #[error("agent stdin: {0}")]
    Stdin(std::io::Error),
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Spawn the agent, feed it the prompt, and consume its frame stream until
/// exit or timeout.
pub async fn run(spec: &AgentSpec, prompt: &str) -> Result<AgentOutcome, AgentError> {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(AgentError::Spawn)?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    stdin
        .write_all(prompt.as_bytes())
        .await
        .map_err(AgentError::Stdin)?;
    stdin.flush().await.map_err(AgentError::Stdin)?;
    drop(stdin);

    // Forward stderr through tracing.
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    warn!(target: "mech.agent.stderr", "{line}");
                }
            }
        });
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let mut collector = Collector::default();

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    let mut lines = BufReader::new(stdout).lines();
    let exit = loop {
        tokio::select! {
            () = &mut deadline => {
                warn!(target: "mech.agent", timeout_secs = spec.timeout.as_secs(), "agent timed out; killing");
                let _ = child.kill().await;
                break AgentExit::TimedOut;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => collector.ingest(&line),
                Ok(None) => {
                    // stdout closed; collect the exit status.
                    let status = child.wait().await;
                    break match status {
                        Ok(status) if status.success() => AgentExit::Completed,
                        Ok(status) => AgentExit::Crashed(status.code()),
                        Err(_) => AgentExit::Crashed(None),
                    };
                }
                Err(err) => {
                    warn!(target: "mech.agent", error = %err, "stdout read failed");
                    let _ = child.kill().await;
                    break AgentExit::Crashed(None);
                }
            }
        }
    };

    Ok(collector.finish(exit, started.elapsed()))
}

/// Incremental frame accumulator.
#[derive(Debug, Default)]
struct Collector {
    chunks: String,
    final_output: Option<String>,
    structured_summary: Option<serde_json::Value>,
    reported_status: Option<DeliveryStatus>,
    streamed_calls: Vec<ToolCall>,
    final_telemetry: Option<AgentTelemetry>,
}

impl Collector {
    fn ingest(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<AgentFrame>(line) {
            Ok(AgentFrame::Output { text }) => self.chunks.push_str(&text),
            Ok(AgentFrame::ToolCall { call }) => {
                debug!(target: "mech.agent", tool = %call.tool, success = call.success, "tool call");
                self.streamed_calls.push(call);
            }
            Ok(AgentFrame::StatusUpdate { status }) => {
                self.reported_status = Some(status);
            }
            Ok(AgentFrame::Result {
                output,
                structured_summary,
                job_instance_status_update,
                telemetry,
            }) => {
                self.final_output = output;
                self.structured_summary = structured_summary;
                if job_instance_status_update.is_some() {
                    self.reported_status = job_instance_status_update;
                }
                self.final_telemetry = telemetry;
            }
            Err(err) => {
                // Agents interleave free-form logging; tolerate it.
                debug!(target: "mech.agent", error = %err, "unparseable line ignored");
            }
        }
    }

    fn finish(self, exit: AgentExit, duration: Duration) -> AgentOutcome {
        let mut telemetry = self.final_telemetry.unwrap_or_default();
        if telemetry.tool_calls.is_empty() {
            telemetry.tool_calls = self.streamed_calls;
        }
        AgentOutcome {
            output: self.final_output.unwrap_or(self.chunks),
            structured_summary: self.structured_summary,
            reported_status: self.reported_status,
            telemetry,
            exit,
            duration,
        }
    }
}
