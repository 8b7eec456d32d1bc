//! The outbound pipeline: duplicate suppressor → rate governor → transport.
//!
//! Session state is always committed before anything reaches this pipeline,
//! so failures here fail open: a reply may be delayed or (for duplicates)
//! dropped, but conversation state is never touched.

use std::sync::Arc;

use crate::channels::dedupe::DuplicateSuppressor;
use crate::channels::limits::RateGovernor;
use crate::channels::{ChannelSender, OutgoingReply};
use crate::error::ChannelError;

/// Composed outbound send path, built once at startup and shared by handle.
pub struct Outbound {
    governor: RateGovernor,
    suppressor: DuplicateSuppressor,
    sender: Arc<dyn ChannelSender>,
}

impl Outbound {
    pub fn new(
        governor: RateGovernor,
        suppressor: DuplicateSuppressor,
        sender: Arc<dyn ChannelSender>,
    ) -> Self {
        Self {
            governor,
            suppressor,
            sender,
        }
    }

    /// Send one reply. Returns `Ok(false)` when the duplicate suppressor
    /// swallowed it, `Ok(true)` on delivery.
    pub async fn send(&self, reply: OutgoingReply) -> Result<bool, ChannelError> {
        let fingerprint = DuplicateSuppressor::fingerprint(&reply.text);
        if !self
            .suppressor
            .should_send(reply.conversation_id, fingerprint)
            .await
        {
            tracing::debug!(
                conversation_id = reply.conversation_id,
                "suppressed duplicate outbound message"
            );
            return Ok(false);
        }

        let conversation = reply.conversation_id;
        self.governor
            .send_with_backoff(Some(conversation), || {
                let sender = Arc::clone(&self.sender);
                let reply = reply.clone();
                async move { sender.deliver(&reply).await }
            })
            .await?;
        Ok(true)
    }

    /// Send, logging instead of propagating. For notification paths where
    /// the durable state is already settled and a lost message must not
    /// bubble into the caller.
    pub async fn send_best_effort(&self, reply: OutgoingReply) {
        let conversation_id = reply.conversation_id;
        if let Err(e) = self.send(reply).await {
            tracing::warn!(conversation_id, error = %e, "outbound notification failed");
        }
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    pub fn suppressor(&self) -> &DuplicateSuppressor {
        &self.suppressor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingSender {
        delivered: StdMutex<Vec<OutgoingReply>>,
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        async fn deliver(&self, reply: &OutgoingReply) -> Result<(), ChannelError> {
            self.delivered.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    fn test_outbound(sender: Arc<RecordingSender>) -> Outbound {
        let limits = LimitsConfig {
            global_per_sec: 25,
            global_per_min: 1500,
            per_chat_per_min: 60,
            per_chat_concurrency: 2,
            dedupe_window: Duration::from_secs(3),
            max_send_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_ceiling: Duration::from_secs(5),
        };
        Outbound::new(
            RateGovernor::new(&limits),
            DuplicateSuppressor::new(limits.dedupe_window),
            sender,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_reply_is_swallowed() {
        let sender = Arc::new(RecordingSender {
            delivered: StdMutex::new(Vec::new()),
        });
        let outbound = test_outbound(Arc::clone(&sender));

        let reply = OutgoingReply::text(5, "Sender ZIP code?");
        assert!(outbound.send(reply.clone()).await.unwrap());
        assert!(!outbound.send(reply).await.unwrap());
        assert_eq!(sender.delivered.lock().unwrap().len(), 1);
    }
}
