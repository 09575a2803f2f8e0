//! Web push message sending and subscription management.
//!
//! Stores per-device push subscriptions and sends encrypted web push
//! messages (RFC 8030) using VAPID authentication (RFC 8292).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use crate::config::{atomic_write, config_dir};
use crate::constants::PUSH_REQUEST_TIMEOUT;
use crate::notifications::vapid::VapidKeys;

/// A device's push subscription, registered via `push-subscribe` (§6).
///
/// Contains everything the server needs to send a web push message to this
/// device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Client's P-256 ECDH public key (base64url).
    pub p256dh: String,
    /// Shared auth secret (base64url).
    pub auth: String,
}

/// Stores push subscriptions per device id. One active subscription per
/// device; a re-registration replaces the previous one (§4.7).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PushSubscriptionStore {
    /// Maps device id → push subscription.
    subscriptions: HashMap<String, PushSubscription>,
}

impl PushSubscriptionStore {
    fn path() -> Result<std::path::PathBuf> {
        Ok(config_dir()?.join("push-subscriptions.json"))
    }

    /// Load the persisted store, or an empty one if it has never been
    /// written.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self) -> Result<()> {
        atomic_write(&Self::path()?, &serde_json::to_string_pretty(self)?)
    }

    /// Register or replace a device's subscription (§4.7 `push-subscribe`).
    pub fn upsert(&mut self, device_id: String, subscription: PushSubscription) -> Result<()> {
        self.subscriptions.insert(device_id, subscription);
        self.save()
    }

    /// Remove a device's subscription, e.g. after 404/410 from the push
    /// service.
    pub fn remove(&mut self, device_id: &str) -> Result<()> {
        self.subscriptions.remove(device_id);
        self.save()
    }

    /// Get all active subscriptions.
    pub fn all(&self) -> impl Iterator<Item = (&str, &PushSubscription)> {
        self.subscriptions.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of stored subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Check if a subscription exists for a given device id.
    #[must_use]
    pub fn contains(&self, device_id: &str) -> bool {
        self.subscriptions.contains_key(device_id)
    }
}

/// Outcome of one `send_push_direct` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Delivered (or accepted for delivery).
    Delivered,
    /// Push service reports the subscription no longer exists (404 or 410);
    /// the caller should remove it.
    Stale,
}

/// Send a declarative web push notification using VAPID authentication.
///
/// Uses the `web-push` crate for RFC 8291 payload encryption and VAPID
/// signing, then sends the HTTP request via reqwest with
/// `Content-Type: application/notification+json` for Safari 18.4+
/// Declarative Web Push support.
///
/// The caller should reuse a single `reqwest::Client` across multiple calls
/// for connection pooling.
pub async fn send_push_direct(
    client: &reqwest::Client,
    vapid_private_b64: &str,
    subscription: &PushSubscription,
    payload: &[u8],
) -> Result<PushOutcome> {
    use web_push::{ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder};

    let sub_info = SubscriptionInfo::new(&subscription.endpoint, &subscription.p256dh, &subscription.auth);

    let mut sig_builder =
        VapidSignatureBuilder::from_base64(vapid_private_b64, &sub_info).context("failed to build VAPID signature")?;
    sig_builder.add_claim("sub", "https://claude-remote.example.com");
    let sig = sig_builder.build().context("failed to sign VAPID JWT")?;

    let mut builder = WebPushMessageBuilder::new(&sub_info);
    builder.set_payload(ContentEncoding::Aes128Gcm, payload);
    builder.set_vapid_signature(sig);
    builder.set_ttl(86400);

    let message = builder.build().context("failed to build web push message")?;

    // Build the HTTP request manually to set Content-Type:
    // application/notification+json (the web-push crate hardcodes
    // application/octet-stream).
    let mut request = client.post(message.endpoint.to_string()).header("TTL", message.ttl.to_string());

    if let Some(urgency) = message.urgency {
        request = request.header("Urgency", urgency.to_string());
    }
    if let Some(topic) = message.topic {
        request = request.header("Topic", topic);
    }
    if let Some(push_payload) = message.payload {
        request = request
            .header("Content-Encoding", push_payload.content_encoding.to_str())
            .header("Content-Type", "application/notification+json");
        for (key, value) in &push_payload.crypto_headers {
            request = request.header(*key, value.as_str());
        }
        request = request.body(push_payload.content);
    }

    let response = request.send().await.context("web push HTTP request failed")?;
    let status = response.status().as_u16();

    match status {
        200..=299 => Ok(PushOutcome::Delivered),
        404 | 410 => {
            log::info!("push subscription is gone (HTTP {status})");
            Ok(PushOutcome::Stale)
        }
        429 => {
            log::warn!("push service rate limited us (429)");
            Ok(PushOutcome::Delivered)
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("web push send failed (HTTP {status}): {body}"))
        }
    }
}

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    title: &'a str,
    body: &'a str,
    url: &'a str,
}

/// Composition-root wrapper binding a subscription store, VAPID keys, and
/// HTTP client for completion/failure notifications (§4.7).
pub struct PushDispatcher {
    store: StdMutex<PushSubscriptionStore>,
    vapid: VapidKeys,
    client: reqwest::Client,
    public_url: String,
}

impl PushDispatcher {
    #[must_use]
    pub fn new(store: PushSubscriptionStore, vapid: VapidKeys, public_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PUSH_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { store: StdMutex::new(store), vapid, client, public_url }
    }

    /// A dispatcher with freshly generated, unpersisted keys and an empty
    /// store, for tests that never touch disk.
    #[cfg(test)]
    #[must_use]
    pub fn new_for_test() -> Self {
        Self::new(
            PushSubscriptionStore::default(),
            VapidKeys::generate().expect("generate VAPID keys"),
            "http://localhost:8787".to_string(),
        )
    }

    #[must_use]
    pub fn vapid_public_key(&self) -> String {
        self.vapid.public_key_base64url().to_string()
    }

    pub fn register(&self, device_id: String, subscription: PushSubscription) -> Result<()> {
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner).upsert(device_id, subscription)
    }

    async fn broadcast(&self, project_id: &str, title: &str, body: &str) {
        let url = format!("{}/?projectId={project_id}", self.public_url);
        let payload = NotificationPayload { title, body, url: &url };
        let Ok(payload) = serde_json::to_vec(&payload) else {
            log::error!("failed to serialize push payload");
            return;
        };

        let subscriptions: Vec<(String, PushSubscription)> = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .all()
            .map(|(id, sub)| (id.to_string(), sub.clone()))
            .collect();

        let mut stale = Vec::new();
        for (device_id, subscription) in subscriptions {
            match send_push_direct(&self.client, self.vapid.private_key_base64url(), &subscription, &payload).await {
                Ok(PushOutcome::Delivered) => {}
                Ok(PushOutcome::Stale) => stale.push(device_id),
                Err(e) => log::warn!("push delivery failed for device {device_id}: {e}"),
            }
        }

        if !stale.is_empty() {
            let mut store = self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for device_id in stale {
                if let Err(e) = store.remove(&device_id) {
                    log::warn!("failed to persist stale subscription removal: {e}");
                }
            }
        }
    }

    /// Notify all registered devices that a project's job finished
    /// successfully.
    pub async fn notify_completion(&self, project_id: &str, title: &str, body: &str) {
        self.broadcast(project_id, title, body).await;
    }

    /// Notify all registered devices that a project's job errored.
    pub async fn notify_failure(&self, project_id: &str, title: &str, body: &str) {
        self.broadcast(project_id, title, body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_remove_without_touching_disk() {
        // These exercise the in-memory map only; persistence is covered by
        // the config module's atomic_write tests and by load() against a
        // redirected test config dir.
        let mut store = PushSubscriptionStore::default();
        store.subscriptions.insert(
            "device-1".to_string(),
            PushSubscription {
                endpoint: "https://push.example.com/1".to_string(),
                p256dh: "key1".to_string(),
                auth: "auth1".to_string(),
            },
        );
        assert_eq!(store.len(), 1);
        assert!(store.contains("device-1"));

        store.subscriptions.remove("device-1");
        assert!(store.is_empty());
    }

    #[test]
    fn serde_roundtrip() {
        let mut store = PushSubscriptionStore::default();
        store.subscriptions.insert(
            "device-1".to_string(),
            PushSubscription {
                endpoint: "https://push.example.com/1".to_string(),
                p256dh: "key1".to_string(),
                auth: "auth1".to_string(),
            },
        );

        let json = serde_json::to_string(&store).expect("serialize");
        let loaded: PushSubscriptionStore = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn notify_with_empty_store_is_a_noop() {
        let dispatcher = PushDispatcher::new_for_test();
        dispatcher.notify_completion("proj", "done", "ok").await;
    }
}
