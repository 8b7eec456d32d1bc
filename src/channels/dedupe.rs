//! Short-window duplicate suppression for outbound messages.
//!
//! Absorbs accidental re-entrancy — a slow durable write causing a handler
//! retry, a double-tapped button — by refusing to re-send an identical
//! message to the same conversation within a short window. This is a
//! best-effort safety net: exactly-once behavior for payment-affecting
//! events lives in the webhook idempotency guard, not here.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tracks (conversation, message-fingerprint) → last-sent time.
pub struct DuplicateSuppressor {
    window: Duration,
    recent: Mutex<HashMap<(i64, u64), Instant>>,
}

impl DuplicateSuppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Stable fingerprint of a message body. Only the digest is retained,
    /// so the map never holds message content.
    pub fn fingerprint(text: &str) -> u64 {
        let digest = Sha256::digest(text.as_bytes());
        u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ])
    }

    /// Returns false when the same (conversation, fingerprint) was sent
    /// within the window. Records the send time before returning true, so
    /// two racing callers cannot both pass.
    pub async fn should_send(&self, conversation: i64, fingerprint: u64) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().await;
        match recent.get(&(conversation, fingerprint)) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                recent.insert((conversation, fingerprint), now);
                true
            }
        }
    }

    /// Drop entries older than twice the window; returns the eviction count.
    /// Called from the runtime's background sweep to keep the map bounded.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let horizon = self.window * 2;
        let mut recent = self.recent.lock().await;
        let before = recent.len();
        recent.retain(|_, last| now.duration_since(*last) < horizon);
        before - recent.len()
    }
}
