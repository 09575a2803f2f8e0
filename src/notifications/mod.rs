//! Web push notification infrastructure (§4.7).
//!
//! Manages the server's VAPID keypair and per-device push subscriptions,
//! and fans out best-effort completion/failure notifications to a client's
//! registered push endpoint.

pub mod push;
pub mod vapid;
