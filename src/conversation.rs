//! Per-project conversation history (§3 Conversation/Message, §4.5).
//!
//! One JSON file per project under `projects/{id}/conversation.json`,
//! rewritten atomically on every append. Serialization is per-project: a
//! small process-wide map of `tokio::sync::Mutex` keyed by project id, the
//! same per-resource locking granularity the teacher uses for per-agent
//! state rather than one global store-wide lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{atomic_write, config_dir};
use crate::job::Chunk;

/// `role` of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Terminal status of an assistant turn (§3, §4.6 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Completed,
    Errored,
    Cancelled,
}

/// One user prompt or one completed assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activity: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<TurnStatus>,
}

impl Message {
    /// A plain user prompt, as appended the moment a `message` command is
    /// accepted (before the agent has produced anything).
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            task: None,
            chunks: Vec::new(),
            thinking: None,
            activity: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
            status: None,
        }
    }
}

/// `{projectId, messages[], agentSessionId, updatedAt}` on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub project_id: String,
    pub messages: Vec<Message>,
    pub agent_session_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    fn empty(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            messages: Vec::new(),
            agent_session_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Disk-backed, per-project-serialized conversation log.
#[derive(Debug, Default)]
pub struct ConversationStore {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path(project_id: &str) -> Result<PathBuf> {
        Ok(config_dir()?.join("projects").join(project_id).join("conversation.json"))
    }

    fn read(project_id: &str) -> Result<Conversation> {
        let path = Self::path(project_id)?;
        if !path.exists() {
            return Ok(Conversation::empty(project_id));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(conversation: &Conversation) -> Result<()> {
        let path = Self::path(&conversation.project_id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&path, &serde_json::to_string_pretty(conversation)?)
    }

    /// `GET /api/projects/{id}/conversation`.
    pub async fn load(&self, project_id: &str) -> Result<Conversation> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        Self::read(project_id)
    }

    /// Append a user prompt, called synchronously with accepting a `message`
    /// command, before the agent has produced any output.
    pub async fn append_user_message(&self, project_id: &str, text: &str) -> Result<()> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let mut conversation = Self::read(project_id)?;
        conversation.messages.push(Message::user(text));
        conversation.updated_at = Utc::now();
        Self::write(&conversation)
    }

    /// Append a completed (or errored/cancelled) assistant turn and update
    /// `agentSessionId` if the agent reported one. Called on every terminal
    /// job transition, happens-before the terminal WS frame per §5.
    pub async fn append_assistant_turn(
        &self,
        project_id: &str,
        turn: Message,
        session_id: Option<String>,
    ) -> Result<()> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        let mut conversation = Self::read(project_id)?;
        conversation.messages.push(turn);
        if let Some(sid) = session_id {
            conversation.agent_session_id = Some(sid);
        }
        conversation.updated_at = Utc::now();
        Self::write(&conversation)
    }

    /// Explicit clear, resetting both messages and the agent session id.
    pub async fn clear(&self, project_id: &str) -> Result<()> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;
        Self::write(&Conversation::empty(project_id))
    }
}
