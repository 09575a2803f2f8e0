//! The job manager (§4.6) — the core of the server.
//!
//! Per project, runs at most one agent subprocess, parses its
//! newline-delimited JSON stdout into deltas, fans them out to subscribed
//! connections, accumulates a durable turn, and persists it on any terminal
//! transition. Mirrors the teacher's `hub/agent_handle.rs::PtyHandle`
//! combination of a live fan-out primitive plus an authoritative replay
//! buffer, generalized from raw terminal bytes to structured JSON deltas,
//! and its `process.rs` two-phase (SIGTERM, grace period, SIGKILL)
//! subprocess teardown, generalized from "scan for orphaned grandchildren by
//! cwd" to "terminate the one child this job owns directly."

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::constants::{CHUNK_LEAD_INS, SUBSCRIBER_CHANNEL_CAPACITY, TERMINATE_GRACE_PERIOD, WATCHDOG_TIMEOUT};
use crate::conversation::{ConversationStore, Message, Role, TurnStatus};
use crate::error::AppError;
use crate::notifications::push::PushDispatcher;
use crate::ws::ServerMessage;

/// A segmented span of the agent's text stream (§4.6 Chunk segmentation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub after_tool: Option<String>,
}

/// Snapshot of a running job's accumulated state, used both for
/// `GetReplay`/`streaming_restore` and as the source for final persistence.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub thinking: String,
    pub text: String,
    pub chunks: Vec<Chunk>,
    pub activity: Vec<serde_json::Value>,
}

/// The authoritative in-flight buffer for one `ActiveJob`. Never truncated
/// until the job reaches a terminal state.
#[derive(Debug, Default, Clone)]
struct JobBuffer {
    thinking: String,
    text: String,
    chunks: Vec<Chunk>,
    activity: Vec<serde_json::Value>,
    session_id: Option<String>,
    last_was_tool_use: bool,
    pending_tool_name: Option<String>,
}

impl JobBuffer {
    fn push_thinking(&mut self, delta: &str) {
        self.thinking.push_str(delta);
        self.last_was_tool_use = false;
    }

    fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
        let starts_new_chunk =
            self.chunks.is_empty() || self.last_was_tool_use || delta.starts_with("\n\n") || starts_with_lead_in(delta);

        if starts_new_chunk {
            let after_tool = if self.last_was_tool_use { self.pending_tool_name.take() } else { None };
            self.chunks.push(Chunk { text: delta.to_string(), after_tool });
        } else if let Some(last) = self.chunks.last_mut() {
            last.text.push_str(delta);
        }
        self.last_was_tool_use = false;
    }

    fn push_tool_use(&mut self, tool_name: String, payload: serde_json::Value) {
        self.activity.push(payload);
        self.pending_tool_name = Some(tool_name);
        self.last_was_tool_use = true;
    }

    fn push_tool_result(&mut self, payload: serde_json::Value) {
        self.activity.push(payload);
        self.last_was_tool_use = false;
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            thinking: self.thinking.clone(),
            text: self.text.clone(),
            chunks: self.chunks.clone(),
            activity: self.activity.clone(),
        }
    }
}

/// Case-insensitive lead-in check per §4.6: "the incoming text (trimmed)
/// begins with a lead-in word from {Now, Next, Let me, I'll, First, Finally,
/// Done}". Kept verbatim per SPEC_FULL.md §9 open question (b).
fn starts_with_lead_in(text: &str) -> bool {
    let trimmed = text.trim_start().to_lowercase();
    CHUNK_LEAD_INS.iter().any(|word| trimmed.starts_with(word))
}

/// One parsed element of the agent's stdout stream.
enum Delta {
    Thinking(String),
    Text(String),
    ToolUse { name: String, value: serde_json::Value },
    ToolResult(serde_json::Value),
}

/// What a single parsed stdout line yields.
enum LineOutcome {
    SessionId(String),
    Deltas(Vec<Delta>),
    Result,
    Ignored,
}

/// Parse one newline-delimited JSON line per the subprocess protocol
/// (§4.6). Returns `None` for malformed JSON — the caller logs and drops it
/// without terminating the job.
fn parse_agent_line(line: &str) -> Option<LineOutcome> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let ty = value.get("type").and_then(serde_json::Value::as_str).unwrap_or_default();

    match ty {
        "system" => {
            if value.get("subtype").and_then(serde_json::Value::as_str) == Some("init") {
                if let Some(sid) = value.get("session_id").and_then(serde_json::Value::as_str) {
                    return Some(LineOutcome::SessionId(sid.to_string()));
                }
            }
            Some(LineOutcome::Ignored)
        }
        "assistant" => {
            let mut deltas = Vec::new();
            if let Some(content) = value.pointer("/message/content").and_then(serde_json::Value::as_array) {
                for block in content {
                    match block.get("type").and_then(serde_json::Value::as_str) {
                        Some("thinking") => {
                            if let Some(t) = block.get("thinking").and_then(serde_json::Value::as_str) {
                                deltas.push(Delta::Thinking(t.to_string()));
                            }
                        }
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(serde_json::Value::as_str) {
                                deltas.push(Delta::Text(t.to_string()));
                            }
                        }
                        Some("tool_use") => {
                            let name = block
                                .get("name")
                                .and_then(serde_json::Value::as_str)
                                .unwrap_or("tool")
                                .to_string();
                            deltas.push(Delta::ToolUse { name, value: block.clone() });
                        }
                        _ => {}
                    }
                }
            }
            Some(LineOutcome::Deltas(deltas))
        }
        "user" => {
            let mut deltas = Vec::new();
            if let Some(content) = value.pointer("/message/content").and_then(serde_json::Value::as_array) {
                for block in content {
                    if block.get("type").and_then(serde_json::Value::as_str) == Some("tool_result") {
                        deltas.push(Delta::ToolResult(block.clone()));
                    }
                }
            }
            Some(LineOutcome::Deltas(deltas))
        }
        "tool_result" => Some(LineOutcome::Deltas(vec![Delta::ToolResult(value)])),
        "result" => Some(LineOutcome::Result),
        _ => Some(LineOutcome::Ignored),
    }
}

/// Outcome of a terminal transition (§4.6 State machine).
#[derive(Debug, Clone)]
enum Outcome {
    Done,
    Errored(String),
    Cancelled,
}

struct JobState {
    buffer: JobBuffer,
    subscribers: HashMap<u64, mpsc::Sender<ServerMessage>>,
}

/// Per-project coordination handle. Held by the `JobManager`'s registry;
/// mutated only from the job's own `run_job` task (buffer/terminal state)
/// or from `subscribe`/`unsubscribe`/`cancel` callers (subscriber set,
/// cancel notification) — never both at once, since the lock covers both.
struct JobHandle {
    state: StdMutex<JobState>,
    cancel: tokio::sync::Notify,
}

fn broadcast(state: &JobState, msg: ServerMessage) {
    for tx in state.subscribers.values() {
        let _ = tx.try_send(msg.clone());
    }
}

/// A project's ActiveJob registry, the agent invocation command, and a
/// monotonic counter for subscriber ids.
pub struct JobManager {
    jobs: StdMutex<HashMap<String, Arc<JobHandle>>>,
    next_conn_id: AtomicU64,
    agent_command: String,
    agent_args: Vec<String>,
}

impl JobManager {
    #[must_use]
    pub fn new(agent_command: String, agent_args: Vec<String>) -> Self {
        Self { jobs: StdMutex::new(HashMap::new()), next_conn_id: AtomicU64::new(1), agent_command, agent_args }
    }

    /// A fresh id to identify one connection's subscription across projects.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_project_ids(&self) -> Vec<String> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    #[must_use]
    pub fn is_busy(&self, project_id: &str) -> bool {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).contains_key(project_id)
    }

    /// `Subscribe(projectId, client)` plus an atomic `GetReplay` snapshot:
    /// the subscriber-set insertion and buffer read happen under the same
    /// lock the job's `run_job` task uses for every mutation-plus-broadcast,
    /// so no delta is either duplicated or missed regardless of interleaving.
    pub fn subscribe(&self, project_id: &str, conn_id: u64) -> Option<(JobSnapshot, mpsc::Receiver<ServerMessage>)> {
        let handle = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get(project_id)?.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.insert(conn_id, tx);
        Some((state.buffer.snapshot(), rx))
    }

    pub fn unsubscribe(&self, project_id: &str, conn_id: u64) {
        if let Some(handle) = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get(project_id) {
            handle.state.lock().unwrap_or_else(PoisonError::into_inner).subscribers.remove(&conn_id);
        }
    }

    /// `Cancel(projectId)`: no-op if idle (idempotent).
    pub fn cancel(&self, project_id: &str) {
        if let Some(handle) = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get(project_id) {
            handle.cancel.notify_one();
        }
    }

    /// `Submit(projectId, prompt, clients)`. Fails with `BusyProject` if a
    /// job is already active; otherwise spawns the coordinator task and
    /// returns immediately — deltas flow only via `subscribe`.
    pub fn submit(
        self: &Arc<Self>,
        project_id: String,
        prompt: String,
        project_path: PathBuf,
        resume_session_id: Option<String>,
        conversations: Arc<ConversationStore>,
        push: Arc<PushDispatcher>,
    ) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&project_id) {
            return Err(AppError::BusyProject);
        }
        let handle = Arc::new(JobHandle {
            state: StdMutex::new(JobState { buffer: JobBuffer::default(), subscribers: HashMap::new() }),
            cancel: tokio::sync::Notify::new(),
        });
        jobs.insert(project_id.clone(), handle.clone());
        drop(jobs);

        let manager = Arc::clone(self);
        let agent_command = self.agent_command.clone();
        let agent_args = self.agent_args.clone();
        tokio::spawn(async move {
            run_job(manager, project_id, prompt, project_path, resume_session_id, handle, conversations, push, agent_command, agent_args)
                .await;
        });
        Ok(())
    }
}

fn apply_and_broadcast(handle: &JobHandle, project_id: &str, delta: Delta) {
    let mut state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
    let msg = match delta {
        Delta::Thinking(t) => {
            state.buffer.push_thinking(&t);
            ServerMessage::Thinking { project_id: project_id.to_string(), text: t }
        }
        Delta::Text(t) => {
            state.buffer.push_text(&t);
            ServerMessage::Text { project_id: project_id.to_string(), text: t }
        }
        Delta::ToolUse { name, value } => {
            state.buffer.push_tool_use(name, value.clone());
            ServerMessage::ToolUse { project_id: project_id.to_string(), tool_use: value }
        }
        Delta::ToolResult(value) => {
            state.buffer.push_tool_result(value.clone());
            ServerMessage::ToolResult { project_id: project_id.to_string(), tool_result: value }
        }
    };
    broadcast(&state, msg);
}

/// Send SIGTERM and return immediately; the caller polls for exit.
fn send_sigterm(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is this child's own process id as reported by the
        // kernel via tokio; sending SIGTERM to it is the documented,
        // non-destructive way to request graceful shutdown.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

enum LineEvent {
    Out(String),
    Err(String),
}

#[allow(clippy::too_many_arguments, reason = "internal coordinator, not a public API")]
async fn run_job(
    manager: Arc<JobManager>,
    project_id: String,
    prompt: String,
    project_path: PathBuf,
    resume_session_id: Option<String>,
    handle: Arc<JobHandle>,
    conversations: Arc<ConversationStore>,
    push: Arc<PushDispatcher>,
    agent_command: String,
    agent_args: Vec<String>,
) {
    let started_at = Utc::now();

    let mut command = tokio::process::Command::new(&agent_command);
    command.args(&agent_args).arg("--print").arg(&prompt);
    if let Some(sid) = &resume_session_id {
        command.arg("--resume").arg(sid);
    }
    command
        .current_dir(&project_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let reason = format!("failed to spawn agent subprocess: {e}");
            log::error!("[job {project_id}] {reason}");
            let outcome = Outcome::Errored(reason.clone());
            persist_turn(&project_id, &prompt, &conversations, &handle, started_at, &outcome).await;
            {
                let state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
                broadcast(&state, ServerMessage::Error { project_id: project_id.clone(), error: reason.clone() });
                broadcast(&state, ServerMessage::Done { project_id: project_id.clone() });
            }
            finish(&manager, &project_id, &prompt, &push, outcome).await;
            return;
        }
    };

    log::info!("[job {project_id}] spawned agent pid={:?}", child.id());

    let stdout = child.stdout.take().expect("stdout piped at spawn");
    let stderr = child.stderr.take().expect("stderr piped at spawn");

    let (line_tx, mut line_rx) = mpsc::channel::<LineEvent>(64);

    let out_tx = line_tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if out_tx.send(LineEvent::Out(line)).await.is_err() {
                break;
            }
        }
    });
    let err_tx = line_tx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if err_tx.send(LineEvent::Err(line)).await.is_err() {
                break;
            }
        }
    });
    drop(line_tx);

    let watchdog = tokio::time::sleep(WATCHDOG_TIMEOUT);
    tokio::pin!(watchdog);
    let mut watchdog_active = true;

    let mut cancel_requested = false;
    let mut grace_timer: Option<Pin<Box<tokio::time::Sleep>>> = None;

    let mut outcome: Option<Outcome> = None;

    loop {
        tokio::select! {
            () = &mut watchdog, if watchdog_active => {
                log::warn!("[job {project_id}] watchdog fired, no output within {WATCHDOG_TIMEOUT:?}");
                let _ = child.start_kill();
                outcome = Some(Outcome::Errored("no output".to_string()));
                break;
            }
            () = handle.cancel.notified(), if !cancel_requested => {
                log::info!("[job {project_id}] cancel requested");
                cancel_requested = true;
                send_sigterm(&child);
                grace_timer = Some(Box::pin(tokio::time::sleep(TERMINATE_GRACE_PERIOD)));
            }
            () = async {
                match grace_timer.as_mut() {
                    Some(timer) => timer.await,
                    None => std::future::pending().await,
                }
            }, if grace_timer.is_some() => {
                log::warn!("[job {project_id}] grace period elapsed, force-killing");
                let _ = child.start_kill();
                grace_timer = None;
            }
            event = line_rx.recv() => {
                match event {
                    Some(LineEvent::Out(line)) => {
                        watchdog_active = false;
                        match parse_agent_line(&line) {
                            Some(LineOutcome::SessionId(sid)) => {
                                handle.state.lock().unwrap_or_else(PoisonError::into_inner).buffer.session_id = Some(sid);
                            }
                            Some(LineOutcome::Deltas(deltas)) => {
                                for delta in deltas {
                                    apply_and_broadcast(&handle, &project_id, delta);
                                }
                            }
                            Some(LineOutcome::Result) => {
                                outcome = Some(Outcome::Done);
                            }
                            Some(LineOutcome::Ignored) => {}
                            None => {
                                log::debug!("[job {project_id}] dropping malformed agent line: {line}");
                            }
                        }
                        if outcome.is_some() {
                            break;
                        }
                    }
                    Some(LineEvent::Err(line)) => {
                        watchdog_active = false;
                        let state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
                        broadcast(&state, ServerMessage::Error { project_id: project_id.clone(), error: line });
                    }
                    None => break,
                }
            }
        }
    }

    stdout_task.abort();
    stderr_task.abort();

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => {
            let status = match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };
            if cancel_requested {
                Outcome::Cancelled
            } else {
                match status {
                    Some(s) if s.success() => Outcome::Done,
                    Some(s) => Outcome::Errored(format!("agent exited with {s}")),
                    None => Outcome::Errored("agent exit status unavailable".to_string()),
                }
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;

    persist_turn(&project_id, &prompt, &conversations, &handle, started_at, &outcome).await;

    {
        let state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &outcome {
            Outcome::Errored(reason) => {
                broadcast(&state, ServerMessage::Error { project_id: project_id.clone(), error: reason.clone() });
                broadcast(&state, ServerMessage::Done { project_id: project_id.clone() });
            }
            Outcome::Done | Outcome::Cancelled => {
                broadcast(&state, ServerMessage::Done { project_id: project_id.clone() });
            }
        }
    }

    finish(&manager, &project_id, &prompt, &push, outcome).await;
}

/// Persist the completed turn. Awaited to completion *before* the terminal
/// `done`/`error` frame is broadcast on every call site, so persistence
/// happens-before delivery (§5, testable property #11).
async fn persist_turn(
    project_id: &str,
    prompt: &str,
    conversations: &Arc<ConversationStore>,
    handle: &Arc<JobHandle>,
    started_at: DateTime<Utc>,
    outcome: &Outcome,
) {
    let (buffer, session_id) = {
        let state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.buffer.clone(), state.buffer.session_id.clone())
    };

    let (status, error) = match outcome {
        Outcome::Done => (TurnStatus::Completed, None),
        Outcome::Errored(reason) => (TurnStatus::Errored, Some(reason.clone())),
        Outcome::Cancelled => (TurnStatus::Cancelled, None),
    };

    let turn = Message {
        role: Role::Assistant,
        text: buffer.text,
        task: Some(prompt.to_string()),
        chunks: buffer.chunks,
        thinking: if buffer.thinking.is_empty() { None } else { Some(buffer.thinking) },
        activity: buffer.activity,
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
        error,
        status: Some(status),
    };

    if let Err(e) = conversations.append_assistant_turn(project_id, turn, session_id).await {
        log::error!("[job {project_id}] failed to persist conversation turn: {e}");
    }
}

/// Dispatch a push notification and remove the `ActiveJob` — the last two of
/// the five steps in §4.6's terminal transition sequence (watchdog-stop,
/// partial-line-flush, and persistence happen earlier, the latter in
/// `persist_turn` above).
async fn finish(manager: &Arc<JobManager>, project_id: &str, prompt: &str, push: &Arc<PushDispatcher>, outcome: Outcome) {
    match &outcome {
        Outcome::Done => push.notify_completion(project_id, "Task completed", prompt).await,
        Outcome::Errored(reason) => push.notify_failure(project_id, "Task failed", reason).await,
        Outcome::Cancelled => {}
    }

    manager.jobs.lock().unwrap_or_else(PoisonError::into_inner).remove(project_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_starts_on_tool_use_boundary() {
        let mut buffer = JobBuffer::default();
        buffer.push_tool_use("Bash".to_string(), serde_json::json!({"tool": "Bash"}));
        buffer.push_text("Now listing");
        assert_eq!(buffer.chunks.len(), 1);
        assert_eq!(buffer.chunks[0].after_tool.as_deref(), Some("Bash"));
    }

    #[test]
    fn chunk_continues_after_tool_result_without_lead_in() {
        let mut buffer = JobBuffer::default();
        buffer.push_tool_use("Bash".to_string(), serde_json::json!({"tool": "Bash"}));
        buffer.push_text("Now listing");
        buffer.push_tool_result(serde_json::json!({"ok": true}));
        buffer.push_text(" files");

        assert_eq!(buffer.chunks.len(), 1, "text after a tool_result with no lead-in merges into the open chunk");
        assert_eq!(buffer.chunks[0].text, "Now listing files");
        assert_eq!(buffer.activity.len(), 2, "tool_use then tool_result, in order");
    }

    #[test]
    fn chunk_starts_on_double_newline() {
        let mut buffer = JobBuffer::default();
        buffer.push_text("first");
        buffer.push_text("\n\nsecond");
        assert_eq!(buffer.chunks.len(), 2);
        assert_eq!(buffer.chunks[1].text, "\n\nsecond");
    }

    #[test]
    fn chunk_starts_on_lead_in_word_case_insensitive() {
        let mut buffer = JobBuffer::default();
        buffer.push_text("working on it");
        buffer.push_text("NOW let's check");
        assert_eq!(buffer.chunks.len(), 2);
    }

    #[test]
    fn chunk_without_lead_in_or_tool_use_appends() {
        let mut buffer = JobBuffer::default();
        buffer.push_text("hello");
        buffer.push_text(" world");
        assert_eq!(buffer.chunks.len(), 1);
        assert_eq!(buffer.chunks[0].text, "hello world");
    }

    #[test]
    fn segmentation_is_deterministic() {
        let run = || {
            let mut buffer = JobBuffer::default();
            buffer.push_text("Let me check");
            buffer.push_tool_use("Bash".to_string(), serde_json::json!({}));
            buffer.push_text("done");
            buffer.snapshot().chunks
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn parses_assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        match parse_agent_line(line) {
            Some(LineOutcome::Deltas(deltas)) => {
                assert_eq!(deltas.len(), 1);
                assert!(matches!(&deltas[0], Delta::Text(t) if t == "hello"));
            }
            _ => panic!("expected deltas"),
        }
    }

    #[test]
    fn parses_top_level_tool_result() {
        let line = r#"{"type":"tool_result","ok":true}"#;
        match parse_agent_line(line) {
            Some(LineOutcome::Deltas(deltas)) => assert_eq!(deltas.len(), 1),
            _ => panic!("expected deltas"),
        }
    }

    #[test]
    fn parses_result_as_terminal() {
        assert!(matches!(parse_agent_line(r#"{"type":"result"}"#), Some(LineOutcome::Result)));
    }

    #[test]
    fn parses_system_init_session_id() {
        let line = r#"{"type":"system","subtype":"init","session_id":"s1"}"#;
        match parse_agent_line(line) {
            Some(LineOutcome::SessionId(sid)) => assert_eq!(sid, "s1"),
            _ => panic!("expected session id"),
        }
    }

    #[test]
    fn malformed_json_returns_none() {
        assert!(parse_agent_line("not json").is_none());
    }

    #[tokio::test]
    async fn submit_rejects_second_job_for_same_project() {
        let manager = Arc::new(JobManager::new("sleep".to_string(), vec!["15".to_string()]));
        let conversations = Arc::new(ConversationStore::new());
        let push = Arc::new(PushDispatcher::new_for_test());

        manager
            .clone()
            .submit("demo-busy".to_string(), "hi".to_string(), PathBuf::from("."), None, conversations.clone(), push.clone())
            .unwrap();

        let second = manager.clone().submit(
            "demo-busy".to_string(),
            "hi again".to_string(),
            PathBuf::from("."),
            None,
            conversations,
            push,
        );
        assert!(matches!(second, Err(AppError::BusyProject)));

        manager.cancel("demo-busy");
    }

    #[tokio::test]
    async fn cancel_on_idle_project_is_noop() {
        let manager = JobManager::new("true".to_string(), vec![]);
        manager.cancel("no-such-project");
    }
}
