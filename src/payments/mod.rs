//! Payment records and the webhook idempotency guard.
//!
//! Payment processors deliver status webhooks at-least-once; this module
//! makes the terminal transition and its side effect happen exactly once.
//! The ordering is deliberate: the durable status commit (a guarded
//! single-statement UPDATE) happens first, and only the caller whose update
//! changed the row runs the downstream effect. A crash between commit and
//! effect leaves the payment correctly marked terminal, needing at worst a
//! manual re-trigger, never a double credit.

pub mod gateway;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channels::outbound::Outbound;
use crate::channels::OutgoingReply;
use crate::db::{Database, TerminalMark};
use crate::error::{PaymentError, Result};

/// Lifecycle of a payment intent. Transitions only pending→paid or
/// pending→failed, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> std::result::Result<Self, PaymentError> {
        match value {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            other => Err(PaymentError::UnknownStatus(other.to_string())),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed)
    }
}

/// What a payment intent pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Order,
    BalanceTopup,
}

impl PaymentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::BalanceTopup => "balance_topup",
        }
    }

    pub fn parse(value: &str) -> std::result::Result<Self, PaymentError> {
        match value {
            "order" => Ok(Self::Order),
            "balance_topup" => Ok(Self::BalanceTopup),
            other => Err(PaymentError::UnknownStatus(format!("kind: {other}"))),
        }
    }
}

/// Durable record of an in-flight payment awaiting a terminal webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPayment {
    /// Processor correlation id; unique across all payments.
    pub track_id: String,
    pub user_id: String,
    pub conversation_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub kind: PaymentKind,
    pub created_at: DateTime<Utc>,
}

impl PendingPayment {
    pub fn new(
        track_id: impl Into<String>,
        user_id: impl Into<String>,
        conversation_id: i64,
        amount: Decimal,
        currency: impl Into<String>,
        kind: PaymentKind,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            user_id: user_id.into(),
            conversation_id,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Pending,
            kind,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of applying one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// This delivery performed the terminal transition and its side effect.
    Applied { current_status: PaymentStatus },
    /// The payment was already terminal; nothing re-ran.
    AlreadyProcessed { current_status: PaymentStatus },
    /// No payment with that track_id; expected for stale or foreign events.
    NoMatch,
    /// The reported status was not terminal; acknowledged without effect.
    Ignored,
}

/// Applies payment-status events to durable state exactly once.
pub struct PaymentLedger {
    store: Arc<dyn Database>,
    outbound: Arc<Outbound>,
}

impl PaymentLedger {
    pub fn new(store: Arc<dyn Database>, outbound: Arc<Outbound>) -> Self {
        Self { store, outbound }
    }

    /// Apply one delivery of a payment-status event.
    ///
    /// Safe to call any number of times for the same track_id: only the call
    /// whose guarded UPDATE changes the row triggers the downstream effect
    /// (balance credit, or order completion + user notification).
    pub async fn apply(
        &self,
        track_id: &str,
        reported_status: PaymentStatus,
        payload: &Value,
    ) -> Result<WebhookOutcome> {
        if !reported_status.is_terminal() {
            tracing::debug!(track_id, status = reported_status.as_str(), "ignoring non-terminal webhook");
            return Ok(WebhookOutcome::Ignored);
        }

        match self.store.mark_terminal(track_id, reported_status).await? {
            TerminalMark::NotFound => {
                tracing::info!(track_id, "webhook for unknown track_id, no-op");
                Ok(WebhookOutcome::NoMatch)
            }
            TerminalMark::AlreadyTerminal(payment) => {
                tracing::info!(
                    track_id,
                    status = payment.status.as_str(),
                    "duplicate webhook delivery, already processed"
                );
                Ok(WebhookOutcome::AlreadyProcessed {
                    current_status: payment.status,
                })
            }
            TerminalMark::Applied(payment) => {
                // Status is durably terminal from here on; the effect below
                // runs at most once even under concurrent deliveries.
                self.run_side_effect(&payment, payload).await?;
                Ok(WebhookOutcome::Applied {
                    current_status: payment.status,
                })
            }
        }
    }

    async fn run_side_effect(&self, payment: &PendingPayment, payload: &Value) -> Result<()> {
        match (payment.kind, payment.status) {
            (PaymentKind::BalanceTopup, PaymentStatus::Paid) => {
                self.store
                    .credit_balance(&payment.user_id, payment.amount)
                    .await?;
                tracing::info!(
                    user_id = %payment.user_id,
                    amount = %payment.amount,
                    "balance credited"
                );
                self.outbound
                    .send_best_effort(OutgoingReply::text(
                        payment.conversation_id,
                        format!(
                            "Payment received. {} {} added to your balance.",
                            payment.amount, payment.currency
                        ),
                    ))
                    .await;
            }
            (PaymentKind::Order, PaymentStatus::Paid) => {
                self.complete_order(payment, payload).await?;
            }
            (_, PaymentStatus::Failed) => {
                tracing::warn!(
                    track_id = %payment.track_id,
                    user_id = %payment.user_id,
                    "payment failed"
                );
                self.outbound
                    .send_best_effort(OutgoingReply::text(
                        payment.conversation_id,
                        "Your payment didn't go through. Send /start to try again.",
                    ))
                    .await;
            }
            (_, PaymentStatus::Pending) => {
                // Unreachable: apply() filters non-terminal statuses.
            }
        }
        Ok(())
    }

    /// Archive the finished flow, drop the session, and tell the user.
    async fn complete_order(&self, payment: &PendingPayment, payload: &Value) -> Result<()> {
        let session = self.store.get(&payment.user_id).await?;
        let order_snapshot = json!({
            "track_id": payment.track_id,
            "amount": payment.amount.to_string(),
            "currency": payment.currency,
            "order": session.as_ref().map(|s| Value::Object(s.temp_data.clone())),
            "webhook_payload": payload,
        });

        let existed = self
            .store
            .complete(&payment.user_id, order_snapshot)
            .await?;
        if !existed {
            tracing::warn!(
                user_id = %payment.user_id,
                track_id = %payment.track_id,
                "paid order had no live session, archived without one"
            );
        }

        self.outbound
            .send_best_effort(OutgoingReply::text(
                payment.conversation_id,
                "Payment received. Your shipping label is being issued and will arrive here shortly.",
            ))
            .await;
        Ok(())
    }
}
