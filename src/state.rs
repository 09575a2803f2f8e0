//! Composition root: `ServerConfig` (CLI-derived runtime settings) and
//! `AppState` (the shared handles every HTTP/WS handler closes over).
//!
//! Mirrors the teacher's `app.rs`-style single struct of `Arc`-wrapped
//! collaborators built once at startup and cloned cheaply into every
//! connection task.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::PinHash;
use crate::conversation::ConversationStore;
use crate::device::DeviceStore;
use crate::identity::ServerIdentity;
use crate::job::JobManager;
use crate::notifications::push::PushDispatcher;
use crate::project::ProjectRegistry;

/// Runtime settings resolved from CLI flags and environment overrides
/// (§6 CLI).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub projects_base: PathBuf,
    pub bind: String,
    pub public_url: String,
    pub agent_command: String,
    pub agent_args: Vec<String>,
}

impl ServerConfig {
    /// Apply `CLAUDE_REMOTE_PROJECTS_BASE` / `CLAUDE_REMOTE_BIND` /
    /// `CLAUDE_REMOTE_PUBLIC_URL` env var overrides on top of parsed CLI
    /// flags, env taking precedence (§6).
    #[must_use]
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CLAUDE_REMOTE_PROJECTS_BASE") {
            self.projects_base = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CLAUDE_REMOTE_BIND") {
            self.bind = v;
        }
        if let Ok(v) = std::env::var("CLAUDE_REMOTE_PUBLIC_URL") {
            self.public_url = v;
        }
        self
    }
}

/// Every collaborator an HTTP handler or WS connection task needs, shared
/// behind one `Arc` per server process.
pub struct AppState {
    pub config: ServerConfig,
    pub identity: Mutex<ServerIdentity>,
    pub devices: Mutex<DeviceStore>,
    pub pin: Mutex<PinHash>,
    pub projects: ProjectRegistry,
    pub conversations: Arc<ConversationStore>,
    pub jobs: Arc<JobManager>,
    pub push: Arc<PushDispatcher>,
}

impl AppState {
    /// Assemble the composition root from already-loaded stores.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        identity: ServerIdentity,
        devices: DeviceStore,
        pin: PinHash,
        push_store: crate::notifications::push::PushSubscriptionStore,
        vapid: crate::notifications::vapid::VapidKeys,
    ) -> Self {
        let projects = ProjectRegistry::new(config.projects_base.clone());
        let jobs = Arc::new(JobManager::new(config.agent_command.clone(), config.agent_args.clone()));
        let push = Arc::new(PushDispatcher::new(push_store, vapid, config.public_url.clone()));
        Self {
            config,
            identity: Mutex::new(identity),
            devices: Mutex::new(devices),
            pin: Mutex::new(pin),
            projects,
            conversations: Arc::new(ConversationStore::new()),
            jobs,
            push,
        }
    }
}
