//! Shared scaffolding for scenario tests (SPEC_FULL.md §8).
//!
//! Every store this crate persists (`ServerIdentity`, `DeviceStore`,
//! `PinHash`, push subscriptions, VAPID keys) resolves its directory through
//! `config::config_dir()`, which honors `CLAUDE_REMOTE_CONFIG_DIR`. Each test
//! points that env var at its own `TempDir` so tests never share state, and
//! holds `ENV_LOCK` for the duration since the env var itself is process-wide.

use std::sync::{Arc, Mutex, MutexGuard};

use claude_remote::config::PinHash;
use claude_remote::device::DeviceStore;
use claude_remote::identity::ServerIdentity;
use claude_remote::notifications::push::PushSubscriptionStore;
use claude_remote::notifications::vapid::VapidKeys;
use claude_remote::state::{AppState, ServerConfig};
use tempfile::TempDir;

pub static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A fresh server plus the temp directories backing it, kept alive for the
/// lifetime of the test so paths stay valid.
pub struct TestServer {
    pub state: Arc<AppState>,
    pub config_dir: TempDir,
    pub projects_dir: TempDir,
}

/// Build an `AppState` backed by scratch directories, with one discoverable
/// project named `demo`. Caller must be holding `lock_env()`.
pub fn build_test_state(agent_command: &str, agent_args: &[&str]) -> TestServer {
    let config_dir = TempDir::new().expect("config tempdir");
    std::env::set_var("CLAUDE_REMOTE_CONFIG_DIR", config_dir.path());

    let projects_dir = TempDir::new().expect("projects tempdir");
    let demo = projects_dir.path().join("demo");
    std::fs::create_dir_all(&demo).expect("create demo project dir");
    std::fs::write(demo.join("Cargo.toml"), "[package]\nname = \"demo\"\n").expect("write manifest");

    let config = ServerConfig {
        projects_base: projects_dir.path().to_path_buf(),
        bind: "127.0.0.1:0".to_string(),
        public_url: "http://localhost:0".to_string(),
        agent_command: agent_command.to_string(),
        agent_args: agent_args.iter().map(|s| (*s).to_string()).collect(),
    };

    let identity = ServerIdentity::load_or_create().expect("load identity");
    let devices = DeviceStore::load().expect("load devices");
    let pin = PinHash::load().expect("load pin");
    let push_store = PushSubscriptionStore::load().expect("load push store");
    let vapid = VapidKeys::load_or_create().expect("load vapid keys");

    let state = Arc::new(AppState::new(config, identity, devices, pin, push_store, vapid));
    TestServer { state, config_dir, projects_dir }
}

/// Pair a brand-new client against `state` and return its device id plus the
/// derived 32-byte shared secret, mirroring the client half of §4.1/§4.2.
pub async fn pair_device(state: &Arc<AppState>) -> (String, [u8; 32]) {
    let token = state.identity.lock().await.pairing_token.clone().expect("fresh server mints a token");

    let (client_secret, client_public_b64) = {
        let pair = claude_remote::crypto::generate_key_pair();
        (pair.private_key, pair.public_key)
    };

    let router = claude_remote::http::router(Arc::clone(state));
    let body = serde_json::json!({ "clientPublicKey": client_public_b64 }).to_string();

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/pair/{token}"))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "pairing must succeed against a freshly minted token");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let server_public_key = parsed["serverPublicKey"].as_str().unwrap().to_string();
    let device_id = parsed["deviceId"].as_str().unwrap().to_string();

    let shared_secret = claude_remote::crypto::derive_shared_secret(&client_secret, &server_public_key).unwrap();
    (device_id, shared_secret)
}
