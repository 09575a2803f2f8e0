//! Encrypted WebSocket transport (§4.3).
//!
//! One connection task per socket, reading encrypted envelope frames,
//! decrypting them against a paired device's shared secret, and dispatching
//! the decoded command to the project registry, conversation store, job
//! manager, or push dispatcher. Generalizes the teacher's outbound
//! `tokio-tungstenite` client wrapper into an inbound axum server handler:
//! same "encrypted envelope over text frames" framing, opposite direction.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{MAX_AUTH_ATTEMPTS, SUBSCRIBER_CHANNEL_CAPACITY};
use crate::crypto::{self, Envelope};
use crate::error::AppError;
use crate::notifications::push::PushSubscription;
use crate::state::AppState;

/// `keys` object inside a `push-subscribe` command.
#[derive(Debug, Clone, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Decoded client → server command (§4.3).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        pin: String,
    },
    Message {
        text: String,
        #[serde(rename = "projectId", default)]
        project_id: Option<String>,
    },
    Cancel {
        #[serde(rename = "projectId", default)]
        project_id: Option<String>,
    },
    #[serde(rename = "push-subscribe")]
    PushSubscribe {
        endpoint: String,
        keys: PushKeys,
    },
}

/// Server → client frame payload (§4.3).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        #[serde(rename = "activeProjectIds")]
        active_project_ids: Vec<String>,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    AuthError {
        error: String,
    },
    Thinking {
        #[serde(rename = "projectId")]
        project_id: String,
        text: String,
    },
    Text {
        #[serde(rename = "projectId")]
        project_id: String,
        text: String,
    },
    ToolUse {
        #[serde(rename = "projectId")]
        project_id: String,
        #[serde(rename = "toolUse")]
        tool_use: serde_json::Value,
    },
    ToolResult {
        #[serde(rename = "projectId")]
        project_id: String,
        #[serde(rename = "toolResult")]
        tool_result: serde_json::Value,
    },
    Done {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    Error {
        #[serde(rename = "projectId")]
        project_id: String,
        error: String,
    },
    StreamingRestore {
        #[serde(rename = "projectId")]
        project_id: String,
        thinking: String,
        text: String,
        activity: Vec<serde_json::Value>,
    },
    #[allow(dead_code, reason = "dev-only refresh hint, never emitted by this server yet")]
    Reload,
}

/// Encrypt and frame one outbound message as `{iv,ct,tag}` JSON.
pub fn encode_frame(key: &[u8; 32], message: &ServerMessage) -> Result<String, AppError> {
    let plaintext = serde_json::to_vec(message).map_err(|_| AppError::MalformedFrame)?;
    let envelope = crypto::encrypt(key, &plaintext).map_err(|_| AppError::MalformedFrame)?;
    serde_json::to_string(&envelope).map_err(|_| AppError::MalformedFrame)
}

/// Decrypt and parse one inbound `{iv,ct,tag}` JSON frame.
pub fn decode_frame(key: &[u8; 32], raw: &str) -> Result<ClientMessage, AppError> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(|_| AppError::MalformedFrame)?;
    let plaintext = crypto::decrypt(key, &envelope).map_err(|_| AppError::DecryptionFailure)?;
    serde_json::from_slice(&plaintext).map_err(|_| AppError::MalformedFrame)
}

async fn send_encrypted(
    ws_tx: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
    key: &[u8; 32],
    message: &ServerMessage,
) -> bool {
    match encode_frame(key, message) {
        Ok(frame) => ws_tx.send(WsMessage::Text(frame.into())).await.is_ok(),
        Err(e) => {
            log::error!("failed to encode outbound frame: {e}");
            true
        }
    }
}

fn spawn_forwarder(mut rx: mpsc::Receiver<ServerMessage>, out_tx: mpsc::Sender<ServerMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if out_tx.send(msg).await.is_err() {
                break;
            }
        }
    })
}

/// Drive one accepted WebSocket: unauthenticated handshake, then the
/// authenticated command loop, until the client disconnects or a silent
/// error closes the connection.
pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let conn_id = state.jobs.next_conn_id();

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(SUBSCRIBER_CHANNEL_CAPACITY);
    let mut forward_tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut subscribed_projects: Vec<String> = Vec::new();

    let mut device_key: Option<[u8; 32]> = None;
    let mut device_id: Option<String> = None;
    let mut auth_attempts: u32 = 0;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let Some(Ok(incoming)) = incoming else { break };
                let WsMessage::Text(raw) = incoming else {
                    if matches!(incoming, WsMessage::Close(_)) { break; }
                    continue;
                };

                if device_key.is_none() {
                    let Some((found_id, key)) = find_device_key(&state, &raw).await else {
                        log::warn!("[ws {conn_id}] undecryptable frame before pairing, closing");
                        break;
                    };

                    let Ok(ClientMessage::Auth { pin }) = decode_frame(&key, &raw) else {
                        send_encrypted(&mut ws_tx, &key, &ServerMessage::AuthError {
                            error: AppError::Unauthenticated.to_string(),
                        }).await;
                        continue;
                    };

                    let auth_ok = {
                        let mut stored_pin = state.pin.lock().await;
                        if stored_pin.pin_hash.is_none() {
                            // First auth on a freshly paired device bootstraps the PIN (§3:
                            // "set on first auth-ok flow"), rather than requiring an
                            // out-of-band config step before the client can ever connect.
                            stored_pin.set_pin(&pin).is_ok()
                        } else {
                            stored_pin.verify(&pin)
                        }
                    };
                    if !auth_ok {
                        auth_attempts += 1;
                        send_encrypted(&mut ws_tx, &key, &ServerMessage::AuthError {
                            error: AppError::AuthFailure.to_string(),
                        }).await;
                        if auth_attempts >= MAX_AUTH_ATTEMPTS {
                            log::warn!("[ws {conn_id}] too many failed auth attempts, closing");
                            break;
                        }
                        continue;
                    }

                    device_key = Some(key);
                    device_id = Some(found_id);

                    let active = state.jobs.active_project_ids();
                    if !send_encrypted(&mut ws_tx, &key, &ServerMessage::AuthOk {
                        active_project_ids: active.clone(),
                        session_id: None,
                    }).await {
                        break;
                    }

                    for project_id in active {
                        if let Some((snapshot, rx)) = state.jobs.subscribe(&project_id, conn_id) {
                            subscribed_projects.push(project_id.clone());
                            let restore = ServerMessage::StreamingRestore {
                                project_id,
                                thinking: snapshot.thinking,
                                text: snapshot.text,
                                activity: snapshot.activity,
                            };
                            let _ = out_tx.send(restore).await;
                            forward_tasks.push(spawn_forwarder(rx, out_tx.clone()));
                        }
                    }
                    continue;
                }

                let key = device_key.expect("checked above");
                let msg = match decode_frame(&key, &raw) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("[ws {conn_id}] {e}, closing");
                        break;
                    }
                };

                match msg {
                    ClientMessage::Auth { .. } => {
                        send_encrypted(&mut ws_tx, &key, &ServerMessage::AuthOk {
                            active_project_ids: state.jobs.active_project_ids(),
                            session_id: None,
                        }).await;
                    }
                    ClientMessage::Message { text, project_id } => {
                        let Some(project_id) = project_id else { continue };
                        if let Err(e) = submit_message(&state, conn_id, &project_id, text, &out_tx, &mut subscribed_projects, &mut forward_tasks).await {
                            log::warn!("[ws {conn_id}] message command failed: {e}");
                            send_encrypted(&mut ws_tx, &key, &ServerMessage::Error {
                                project_id,
                                error: e.to_string(),
                            }).await;
                        }
                    }
                    ClientMessage::Cancel { project_id } => {
                        if let Some(project_id) = project_id {
                            state.jobs.cancel(&project_id);
                        }
                    }
                    ClientMessage::PushSubscribe { endpoint, keys } => {
                        if let Some(device_id) = &device_id {
                            let subscription = PushSubscription { endpoint, p256dh: keys.p256dh, auth: keys.auth };
                            if let Err(e) = state.push.register(device_id.clone(), subscription) {
                                log::warn!("[ws {conn_id}] failed to persist push subscription: {e}");
                            }
                        }
                    }
                }
            }
            Some(msg) = out_rx.recv() => {
                let Some(key) = device_key else { continue };
                if !send_encrypted(&mut ws_tx, &key, &msg).await {
                    break;
                }
            }
        }
    }

    for task in forward_tasks {
        task.abort();
    }
    for project_id in subscribed_projects {
        state.jobs.unsubscribe(&project_id, conn_id);
    }
}

/// Find the paired device whose shared secret successfully decrypts `raw`,
/// trying each known device in turn — the connection does not otherwise
/// identify which device it belongs to until a frame decrypts.
async fn find_device_key(state: &Arc<AppState>, raw: &str) -> Option<(String, [u8; 32])> {
    let devices = state.devices.lock().await;
    devices.all().iter().find_map(|d| {
        let key = d.shared_secret().ok()?;
        decode_frame(&key, raw).ok()?;
        Some((d.id.clone(), key))
    })
}

#[allow(clippy::too_many_arguments, reason = "internal dispatch helper, not a public API")]
async fn submit_message(
    state: &Arc<AppState>,
    conn_id: u64,
    project_id: &str,
    text: String,
    out_tx: &mpsc::Sender<ServerMessage>,
    subscribed_projects: &mut Vec<String>,
    forward_tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(), AppError> {
    let project = state.projects.get(project_id)?;

    state
        .conversations
        .append_user_message(project_id, &text)
        .await
        .map_err(|e| AppError::StoreIoFailure(e.to_string()))?;

    let resume_session_id =
        state.conversations.load(project_id).await.ok().and_then(|c| c.agent_session_id);

    state.jobs.submit(
        project_id.to_string(),
        text,
        project.path,
        resume_session_id,
        Arc::clone(&state.conversations),
        Arc::clone(&state.push),
    )?;

    if !subscribed_projects.iter().any(|p| p == project_id) {
        if let Some((_snapshot, rx)) = state.jobs.subscribe(project_id, conn_id) {
            subscribed_projects.push(project_id.to_string());
            forward_tasks.push(spawn_forwarder(rx, out_tx.clone()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_parses_message_command() {
        let json = r#"{"type":"message","text":"hi","projectId":"demo"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, ClientMessage::Message { text, project_id: Some(p) } if text == "hi" && p == "demo"));
    }

    #[test]
    fn client_message_parses_push_subscribe() {
        let json = r#"{"type":"push-subscribe","endpoint":"https://p","keys":{"p256dh":"a","auth":"b"}}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, ClientMessage::PushSubscribe { .. }));
    }

    #[test]
    fn server_message_serializes_with_camel_case_fields() {
        let msg = ServerMessage::AuthOk { active_project_ids: vec!["demo".to_string()], session_id: None };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth_ok");
        assert_eq!(json["activeProjectIds"][0], "demo");
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn encode_then_decrypt_roundtrips() {
        let key = [7u8; 32];
        let msg = ServerMessage::Text { project_id: "demo".to_string(), text: "hello".to_string() };
        let frame = encode_frame(&key, &msg).unwrap();

        // The decrypted payload is a ServerMessage shape, not a
        // ClientMessage one, so assert on the raw JSON rather than going
        // through decode_frame.
        let envelope: Envelope = serde_json::from_str(&frame).unwrap();
        let plaintext = crypto::decrypt(&key, &envelope).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "hello");
    }

    #[test]
    fn decode_frame_rejects_malformed_json() {
        let key = [1u8; 32];
        assert!(matches!(decode_frame(&key, "not json"), Err(AppError::MalformedFrame)));
    }

    #[test]
    fn decode_frame_rejects_wrong_key() {
        let key = [1u8; 32];
        let wrong = [2u8; 32];
        let envelope = crypto::encrypt(&key, br#"{"type":"auth","pin":"1234"}"#).unwrap();
        let raw = serde_json::to_string(&envelope).unwrap();
        assert!(matches!(decode_frame(&wrong, &raw), Err(AppError::DecryptionFailure)));
    }
}
