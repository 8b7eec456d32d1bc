//! The conversation engine: drives a user through the order-intake steps.
//!
//! Every transition is a single atomic store update, so a double-tapped
//! button or a retried handler always observes the previous event's
//! persisted write. External calls (rate fetch, invoice creation) happen
//! only after the step transition is durably committed; their failure walks
//! the flow back via the static predecessor table.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::channels::{IncomingEvent, OutgoingReply};
use crate::db::{Database, Session, SessionOrigin};
use crate::error::{FlowError, Result};
use crate::flow::step::{
    self, OrderStep, StepOutcome, CONFIRM, RATE_QUOTES_KEY, RESUME_STEP_KEY,
};
use crate::payments::gateway::PaymentGateway;
use crate::payments::{PaymentKind, PendingPayment};
use crate::rates::{RateProvider, Shipment};

const EXPIRED_NOTICE: &str =
    "Your previous order sat idle too long and was discarded. Starting fresh.\n\n";

/// Conversation state machine. Owns no mutable state of its own; everything
/// durable lives in the store, so any number of events can be in flight
/// across users.
pub struct FlowEngine {
    store: Arc<dyn Database>,
    rates: Arc<dyn RateProvider>,
    gateway: Arc<dyn PaymentGateway>,
    session_ttl: Duration,
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn Database>,
        rates: Arc<dyn RateProvider>,
        gateway: Arc<dyn PaymentGateway>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            rates,
            gateway,
            session_ttl,
        }
    }

    /// Process one inbound event and produce the reply to send.
    ///
    /// A `None` from the store's guarded update means the session vanished
    /// under us (a concurrent complete/clear won); the attempt is retried
    /// against a fresh session rather than dropped.
    pub async fn handle(&self, event: &IncomingEvent) -> Result<OutgoingReply> {
        for _ in 0..2 {
            if let Some(reply) = self.try_handle(event).await? {
                return Ok(reply);
            }
            tracing::debug!(user_id = %event.user_id, "session changed mid-event, retrying");
        }
        // Two consecutive losses means the user is hammering terminal
        // actions; start them over cleanly.
        Ok(OutgoingReply::text(
            event.conversation_id,
            OrderStep::Start.prompt(),
        ))
    }

    async fn try_handle(&self, event: &IncomingEvent) -> Result<Option<OutgoingReply>> {
        let (session, origin) = self
            .store
            .get_or_create(&event.user_id, Map::new(), self.session_ttl)
            .await?;

        let notice = if origin == SessionOrigin::RecreatedExpired {
            EXPIRED_NOTICE
        } else {
            ""
        };

        let payload = event.payload.trim();

        // Global commands outrank whatever step is in flight.
        if payload == "/start" {
            let session = self.reset(&event.user_id).await?;
            return Ok(session.map(|s| {
                OutgoingReply::text(
                    event.conversation_id,
                    format!("{notice}{}", s.current_step.prompt()),
                )
            }));
        }
        if payload == "/cancel" || payload.eq_ignore_ascii_case("cancel") {
            return self.begin_cancel(event, &session, notice).await;
        }

        let reply = match session.current_step {
            OrderStep::Start => {
                let next = OrderStep::FromName;
                let updated = self
                    .store
                    .update_atomic(
                        &event.user_id,
                        Some(next),
                        Map::new(),
                        Some("start -> from_name"),
                    )
                    .await?;
                match updated {
                    Some(_) => Some(prompt_reply(event.conversation_id, notice, next)),
                    None => None,
                }
            }
            OrderStep::ConfirmCancel => self.handle_confirm_cancel(event, &session).await?,
            OrderStep::Confirm => self.handle_confirm(event, &session, payload).await?,
            OrderStep::AwaitPayment => Some(OutgoingReply::text(
                event.conversation_id,
                OrderStep::AwaitPayment.prompt(),
            )),
            OrderStep::RateSelect if payload == "retry" => {
                Some(self.enter_rate_select(event, Map::new()).await?)
            }
            current => self.handle_collection(event, &session, current, payload, notice).await?,
        };
        Ok(reply)
    }

    /// Validate-and-collect path for the linear data steps.
    async fn handle_collection(
        &self,
        event: &IncomingEvent,
        session: &Session,
        current: OrderStep,
        payload: &str,
        notice: &str,
    ) -> Result<Option<OutgoingReply>> {
        let outcome = match step::validate(current, payload, &session.temp_data) {
            Ok(outcome) => outcome,
            Err(FlowError::Validation { message, .. }) => {
                // Re-prompt; current_step is untouched.
                return Ok(Some(OutgoingReply::with_buttons(
                    event.conversation_id,
                    format!("{message}\n\n{}", current.prompt()),
                    current.buttons(),
                )));
            }
            Err(_) => {
                return Ok(Some(OutgoingReply::with_buttons(
                    event.conversation_id,
                    current.prompt().to_string(),
                    current.buttons(),
                )));
            }
        };

        let mut data = Map::new();
        let mut merged = session.temp_data.clone();
        if let StepOutcome::Collect { key, value } = outcome {
            merged.insert(key.to_string(), value.clone());
            data.insert(key.to_string(), value);
        }

        let next = step::next_step(current, &merged);
        if next == OrderStep::RateSelect {
            return Ok(Some(self.enter_rate_select(event, data).await?));
        }

        let note = format!("{} -> {}", current.as_str(), next.as_str());
        let updated = self
            .store
            .update_atomic(&event.user_id, Some(next), data, Some(&note))
            .await?;
        let Some(updated) = updated else {
            return Ok(None);
        };

        let text = if next == OrderStep::Confirm {
            format!("{notice}{}\n\n{}", order_summary(&updated), next.prompt())
        } else {
            format!("{notice}{}", next.prompt())
        };
        Ok(Some(OutgoingReply::with_buttons(
            event.conversation_id,
            text,
            next.buttons(),
        )))
    }

    /// Move to RateSelect, commit any collected data, then fetch quotes.
    /// The transition is durable before the external call; failure reverts
    /// to the predecessor step.
    async fn enter_rate_select(
        &self,
        event: &IncomingEvent,
        data: Map<String, Value>,
    ) -> Result<OutgoingReply> {
        let note = "-> rate_select";
        let updated = self
            .store
            .update_atomic(&event.user_id, Some(OrderStep::RateSelect), data, Some(note))
            .await?;
        let Some(session) = updated else {
            return Ok(OutgoingReply::text(
                event.conversation_id,
                OrderStep::Start.prompt(),
            ));
        };

        let shipment = Shipment {
            from_zip: session.field("from_zip").unwrap_or_default().to_string(),
            to_zip: session.field("to_zip").unwrap_or_default().to_string(),
            weight_kg: session.field("weight_kg").unwrap_or_default().to_string(),
            dimensions_cm: session.field("dimensions_cm").unwrap_or_default().to_string(),
        };

        match self.rates.fetch_rates(&shipment).await {
            Ok(quotes) => {
                let mut data = Map::new();
                data.insert(
                    RATE_QUOTES_KEY.to_string(),
                    serde_json::to_value(&quotes)
                        .map_err(|e| crate::error::DatabaseError::Serialization(e.to_string()))?,
                );
                self.store
                    .update_atomic(&event.user_id, None, data, None)
                    .await?;

                let mut text = String::from("Pick a shipping rate:\n");
                let mut buttons = Vec::new();
                for quote in &quotes {
                    text.push_str(&format!(
                        "\n{} {}: {} {} (~{} days)",
                        quote.carrier, quote.service, quote.price, quote.currency, quote.eta_days
                    ));
                    buttons.push(format!("{}{}", step::RATE_PREFIX, quote.id));
                }
                Ok(OutgoingReply {
                    conversation_id: event.conversation_id,
                    text,
                    buttons,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                let reverted = self
                    .revert_on_external_failure(&event.user_id, OrderStep::RateSelect, &reason)
                    .await?;
                let back_at = reverted.unwrap_or(OrderStep::Start);
                Ok(OutgoingReply::with_buttons(
                    event.conversation_id,
                    format!(
                        "Couldn't fetch shipping rates right now. We went back one step.\n\n{}",
                        back_at.prompt()
                    ),
                    &["retry", "cancel"],
                ))
            }
        }
    }

    /// Confirm step: a confirmation creates the invoice and parks the flow
    /// at AwaitPayment; anything else re-shows the summary.
    async fn handle_confirm(
        &self,
        event: &IncomingEvent,
        session: &Session,
        payload: &str,
    ) -> Result<Option<OutgoingReply>> {
        if payload != CONFIRM {
            return Ok(Some(OutgoingReply::with_buttons(
                event.conversation_id,
                format!("{}\n\n{}", order_summary(session), OrderStep::Confirm.prompt()),
                OrderStep::Confirm.buttons(),
            )));
        }

        let (amount, currency) = selected_rate_price(session)?;
        match self
            .gateway
            .create_invoice(&event.user_id, amount, &currency, PaymentKind::Order)
            .await
        {
            Ok(invoice) => {
                let payment = PendingPayment::new(
                    invoice.track_id.clone(),
                    event.user_id.clone(),
                    event.conversation_id,
                    amount,
                    currency.clone(),
                    PaymentKind::Order,
                );
                self.store.create_pending(&payment).await?;

                let mut data = Map::new();
                data.insert("track_id".to_string(), Value::String(invoice.track_id));
                let updated = self
                    .store
                    .update_atomic(
                        &event.user_id,
                        Some(OrderStep::AwaitPayment),
                        data,
                        Some("confirm -> await_payment"),
                    )
                    .await?;
                Ok(updated.map(|_| {
                    OutgoingReply::text(
                        event.conversation_id,
                        format!(
                            "Invoice for {amount} {currency} created. Pay here: {}\n\nI'll confirm as soon as the payment lands.",
                            invoice.pay_url
                        ),
                    )
                }))
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(user_id = %event.user_id, error = %reason, "invoice creation failed");
                let reverted = self
                    .revert_on_external_failure(&event.user_id, OrderStep::Confirm, &reason)
                    .await?;
                let back_at = reverted.unwrap_or(OrderStep::Start);
                Ok(Some(OutgoingReply::with_buttons(
                    event.conversation_id,
                    format!(
                        "The payment service is unavailable right now. We went back one step.\n\n{}",
                        back_at.prompt()
                    ),
                    &["retry", "cancel"],
                )))
            }
        }
    }

    /// ConfirmCancel step: confirming wipes the session, declining restores
    /// the exact step captured when cancellation began.
    async fn handle_confirm_cancel(
        &self,
        event: &IncomingEvent,
        session: &Session,
    ) -> Result<Option<OutgoingReply>> {
        match event.payload.trim() {
            "yes" => {
                self.store.clear(&event.user_id).await?;
                Ok(Some(OutgoingReply::text(
                    event.conversation_id,
                    "Order cancelled. Send /start whenever you want to ship something.",
                )))
            }
            "no" => {
                let resume = session
                    .field(RESUME_STEP_KEY)
                    .and_then(|s| OrderStep::parse(s).ok())
                    .unwrap_or(OrderStep::Start);
                let mut data = Map::new();
                // null deletes the key in the merge.
                data.insert(RESUME_STEP_KEY.to_string(), Value::Null);
                let updated = self
                    .store
                    .update_atomic(
                        &event.user_id,
                        Some(resume),
                        data,
                        Some("confirm_cancel -> resume"),
                    )
                    .await?;
                Ok(updated.map(|_| prompt_reply(event.conversation_id, "", resume)))
            }
            _ => Ok(Some(OutgoingReply::with_buttons(
                event.conversation_id,
                OrderStep::ConfirmCancel.prompt().to_string(),
                OrderStep::ConfirmCancel.buttons(),
            ))),
        }
    }

    async fn begin_cancel(
        &self,
        event: &IncomingEvent,
        session: &Session,
        notice: &str,
    ) -> Result<Option<OutgoingReply>> {
        match session.current_step {
            OrderStep::ConfirmCancel => Ok(Some(OutgoingReply::with_buttons(
                event.conversation_id,
                OrderStep::ConfirmCancel.prompt().to_string(),
                OrderStep::ConfirmCancel.buttons(),
            ))),
            OrderStep::Start => Ok(Some(OutgoingReply::text(
                event.conversation_id,
                format!("{notice}Nothing to cancel. {}", OrderStep::Start.prompt()),
            ))),
            current => {
                let mut data = Map::new();
                data.insert(
                    RESUME_STEP_KEY.to_string(),
                    Value::String(current.as_str().to_string()),
                );
                let updated = self
                    .store
                    .update_atomic(
                        &event.user_id,
                        Some(OrderStep::ConfirmCancel),
                        data,
                        Some("-> confirm_cancel"),
                    )
                    .await?;
                Ok(updated.map(|_| {
                    OutgoingReply::with_buttons(
                        event.conversation_id,
                        OrderStep::ConfirmCancel.prompt().to_string(),
                        OrderStep::ConfirmCancel.buttons(),
                    )
                }))
            }
        }
    }

    /// Clear collected data and force the flow back to Start.
    ///
    /// Modeled as an explicit terminal transition so it wins over any
    /// in-flight step; returns `None` only if the session vanished and could
    /// not be reset (the caller retries).
    pub async fn reset(&self, user_id: &str) -> Result<Option<Session>> {
        match self.store.reset(user_id).await? {
            Some(session) => Ok(Some(session)),
            None => {
                // No session at all: create one already at Start.
                let (session, _) = self
                    .store
                    .get_or_create(user_id, Map::new(), self.session_ttl)
                    .await?;
                Ok(Some(session))
            }
        }
    }

    /// Walk the flow back to `failed_step`'s static predecessor after an
    /// external call failed, recording the failure for diagnostics.
    pub async fn revert_on_external_failure(
        &self,
        user_id: &str,
        failed_step: OrderStep,
        reason: &str,
    ) -> Result<Option<OrderStep>> {
        let reverted = self
            .store
            .revert_to_previous(user_id, failed_step, reason)
            .await?;
        if let Some(step) = reverted {
            tracing::info!(
                user_id,
                failed_step = failed_step.as_str(),
                back_to = step.as_str(),
                "reverted after external failure"
            );
        }
        Ok(reverted)
    }
}

fn prompt_reply(conversation_id: i64, notice: &str, step: OrderStep) -> OutgoingReply {
    OutgoingReply::with_buttons(
        conversation_id,
        format!("{notice}{}", step.prompt()),
        step.buttons(),
    )
}

/// Human-readable summary of everything collected so far.
fn order_summary(session: &Session) -> String {
    let field = |key: &str| session.field(key).unwrap_or("(missing)").to_string();
    let rate = session
        .temp_data
        .get("selected_rate")
        .map(|rate| {
            format!(
                "{} {}: {} {}",
                rate.get("carrier").and_then(Value::as_str).unwrap_or("?"),
                rate.get("service").and_then(Value::as_str).unwrap_or("?"),
                rate.get("price").and_then(Value::as_str).unwrap_or("?"),
                rate.get("currency").and_then(Value::as_str).unwrap_or(""),
            )
        })
        .unwrap_or_else(|| "(none)".to_string());

    format!(
        "From: {} ({}), {}\nTo: {} ({}), {}\nParcel: {} kg, {} cm\nRate: {}",
        field("from_name"),
        field("from_zip"),
        field("from_street"),
        field("to_name"),
        field("to_zip"),
        field("to_street"),
        field("weight_kg"),
        field("dimensions_cm"),
        rate,
    )
}

/// Extract the price of the chosen rate quote.
fn selected_rate_price(session: &Session) -> Result<(rust_decimal::Decimal, String)> {
    let rate = session
        .temp_data
        .get("selected_rate")
        .ok_or_else(|| FlowError::Validation {
            step: OrderStep::Confirm.as_str().to_string(),
            message: "no rate selected".to_string(),
        })?;
    let price = rate
        .get("price")
        .and_then(Value::as_str)
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| FlowError::Validation {
            step: OrderStep::Confirm.as_str().to_string(),
            message: "selected rate has no price".to_string(),
        })?;
    let currency = rate
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or("USD")
        .to_string();
    Ok((price, currency))
}
