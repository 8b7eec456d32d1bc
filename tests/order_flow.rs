//! End-to-end conversation tests against an in-memory backend.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use serde_json::Map;

use parcelflow::channels::{EventKind, IncomingEvent};
use parcelflow::db::libsql::LibSqlBackend;
use parcelflow::db::{Database, PaymentStore, SessionStore};
use parcelflow::error::{FlowError, PaymentError};
use parcelflow::flow::{FlowEngine, OrderStep};
use parcelflow::payments::gateway::{Invoice, PaymentGateway};
use parcelflow::payments::PaymentKind;
use parcelflow::rates::{RateProvider, RateQuote, Shipment};
use rust_decimal::Decimal;

const TTL: Duration = Duration::from_secs(3600);

struct StubRates {
    fail: AtomicBool,
}

#[async_trait]
impl RateProvider for StubRates {
    async fn fetch_rates(&self, _shipment: &Shipment) -> Result<Vec<RateQuote>, FlowError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FlowError::External {
                step: "rate_select".to_string(),
                reason: "rate API timed out".to_string(),
            });
        }
        Ok(vec![
            RateQuote {
                id: "std".to_string(),
                carrier: "USPS".to_string(),
                service: "Ground".to_string(),
                price: dec!(8.40),
                currency: "USD".to_string(),
                eta_days: 5,
            },
            RateQuote {
                id: "exp".to_string(),
                carrier: "UPS".to_string(),
                service: "Express".to_string(),
                price: dec!(21.10),
                currency: "USD".to_string(),
                eta_days: 1,
            },
        ])
    }
}

struct StubGateway {
    invoices: AtomicU32,
    fail: AtomicBool,
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_invoice(
        &self,
        _user_id: &str,
        _amount: Decimal,
        _currency: &str,
        _kind: PaymentKind,
    ) -> Result<Invoice, PaymentError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaymentError::InvoiceFailed {
                reason: "gateway 503".to_string(),
            });
        }
        let n = self.invoices.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Invoice {
            track_id: format!("TRACK-{n}"),
            pay_url: format!("https://pay.example/inv/{n}"),
        })
    }
}

struct Harness {
    store: Arc<LibSqlBackend>,
    engine: FlowEngine,
    rates: Arc<StubRates>,
    gateway: Arc<StubGateway>,
}

async fn harness() -> Harness {
    harness_with_ttl(TTL).await
}

async fn harness_with_ttl(ttl: Duration) -> Harness {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store.run_migrations().await.unwrap();
    let rates = Arc::new(StubRates {
        fail: AtomicBool::new(false),
    });
    let gateway = Arc::new(StubGateway {
        invoices: AtomicU32::new(0),
        fail: AtomicBool::new(false),
    });
    let engine = FlowEngine::new(
        Arc::clone(&store) as Arc<dyn Database>,
        Arc::clone(&rates) as Arc<dyn RateProvider>,
        Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
        ttl,
    );
    Harness {
        store,
        engine,
        rates,
        gateway,
    }
}

fn event(payload: &str) -> IncomingEvent {
    IncomingEvent {
        conversation_id: 7,
        user_id: "u1".to_string(),
        kind: EventKind::Text,
        payload: payload.to_string(),
    }
}

/// The full happy-path input sequence, first touch through rate selection
/// and confirmation.
fn happy_path() -> Vec<&'static str> {
    vec![
        "hi",
        "John Doe",
        "94107",
        "1 Market Street",
        "skip",
        "skip",
        "Jane Roe",
        "10001",
        "5 Broadway Avenue",
        "skip",
        "skip",
        "2.5",
        "30x20x10",
        "rate:std",
        "confirm",
    ]
}

#[tokio::test]
async fn full_flow_reaches_await_payment_with_one_invoice() {
    let h = harness().await;

    let mut last = None;
    for payload in happy_path() {
        last = Some(h.engine.handle(&event(payload)).await.unwrap());
    }

    let reply = last.unwrap();
    assert!(reply.text.contains("Pay here"), "got: {}", reply.text);
    assert_eq!(h.gateway.invoices.load(Ordering::SeqCst), 1);

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::AwaitPayment);
    assert_eq!(session.field("from_name"), Some("John Doe"));
    assert_eq!(session.field("to_zip"), Some("10001"));
    assert_eq!(session.field("track_id"), Some("TRACK-1"));

    let pending = h.store.get_by_track_id("TRACK-1").await.unwrap().unwrap();
    assert_eq!(pending.amount, dec!(8.40));
    assert_eq!(pending.user_id, "u1");
}

#[tokio::test]
async fn replaying_the_sequence_leaves_state_unchanged() {
    let h = harness().await;

    for payload in happy_path() {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let after_first = h.store.get("u1").await.unwrap().unwrap();

    // A retried handler delivers the whole sequence again; the parked flow
    // must absorb it without moving or re-invoicing.
    for payload in happy_path() {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let after_second = h.store.get("u1").await.unwrap().unwrap();

    assert_eq!(after_first.current_step, after_second.current_step);
    assert_eq!(after_first.temp_data, after_second.temp_data);
    assert_eq!(h.gateway.invoices.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_command_resets_mid_flow() {
    let h = harness().await;

    // Walk to FromZip with a name on file.
    for payload in ["hi", "John"] {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::FromZip);
    assert_eq!(session.field("from_name"), Some("John"));

    h.engine.handle(&event("/start")).await.unwrap();

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::Start);
    assert!(session.temp_data.is_empty());
}

#[tokio::test]
async fn invalid_input_reprompts_without_advancing() {
    let h = harness().await;

    for payload in ["hi", "John Doe"] {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let reply = h.engine.handle(&event("not-a-zip")).await.unwrap();
    assert!(reply.text.contains("ZIP"), "got: {}", reply.text);

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::FromZip);
    assert!(!session.temp_data.contains_key("from_zip"));
}

#[tokio::test]
async fn declined_cancel_restores_the_exact_step() {
    let h = harness().await;

    for payload in ["hi", "John Doe", "94107"] {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    assert_eq!(
        h.store.get("u1").await.unwrap().unwrap().current_step,
        OrderStep::FromStreet
    );

    h.engine.handle(&event("/cancel")).await.unwrap();
    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::ConfirmCancel);
    assert_eq!(session.field("resume_step"), Some("from_street"));

    let reply = h.engine.handle(&event("no")).await.unwrap();
    assert!(reply.text.contains("street"), "got: {}", reply.text);

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::FromStreet);
    assert!(!session.temp_data.contains_key("resume_step"));
    // Collected data survives a declined cancel.
    assert_eq!(session.field("from_zip"), Some("94107"));
}

#[tokio::test]
async fn confirmed_cancel_clears_the_session() {
    let h = harness().await;

    for payload in ["hi", "John Doe", "/cancel"] {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let reply = h.engine.handle(&event("yes")).await.unwrap();
    assert!(reply.text.contains("cancelled"), "got: {}", reply.text);
    assert!(h.store.get("u1").await.unwrap().is_none());

    // The next touch starts over cleanly.
    h.engine.handle(&event("hello again")).await.unwrap();
    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::FromName);
}

#[tokio::test]
async fn rate_fetch_failure_reverts_to_parcel_size() {
    let h = harness().await;
    h.rates.fail.store(true, Ordering::SeqCst);

    for &payload in &happy_path()[..12] {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let reply = h.engine.handle(&event("30x20x10")).await.unwrap();
    assert!(
        reply.text.contains("went back one step"),
        "got: {}",
        reply.text
    );

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.current_step, OrderStep::ParcelSize);
    assert!(session.last_error.is_some());

    // Recovery: the provider comes back and the same input proceeds.
    h.rates.fail.store(false, Ordering::SeqCst);
    let reply = h.engine.handle(&event("30x20x10")).await.unwrap();
    assert!(reply.text.contains("Pick a shipping rate"), "got: {}", reply.text);
    assert_eq!(
        h.store.get("u1").await.unwrap().unwrap().current_step,
        OrderStep::RateSelect
    );
}

#[tokio::test]
async fn invoice_failure_reverts_to_rate_select() {
    let h = harness().await;
    h.gateway.fail.store(true, Ordering::SeqCst);

    for &payload in &happy_path()[..14] {
        h.engine.handle(&event(payload)).await.unwrap();
    }
    let reply = h.engine.handle(&event("confirm")).await.unwrap();
    assert!(
        reply.text.contains("payment service is unavailable"),
        "got: {}",
        reply.text
    );
    assert_eq!(
        h.store.get("u1").await.unwrap().unwrap().current_step,
        OrderStep::RateSelect
    );

    // Selecting a rate again and confirming succeeds once the gateway heals.
    h.gateway.fail.store(false, Ordering::SeqCst);
    h.engine.handle(&event("rate:std")).await.unwrap();
    let reply = h.engine.handle(&event("confirm")).await.unwrap();
    assert!(reply.text.contains("Pay here"), "got: {}", reply.text);
}

#[tokio::test]
async fn expired_session_restarts_with_notice() {
    let h = harness().await;
    for payload in ["hi", "John Doe", "94107"] {
        h.engine.handle(&event(payload)).await.unwrap();
    }

    // Same store, but an engine whose TTL treats everything as stale.
    let expired = FlowEngine::new(
        Arc::clone(&h.store) as Arc<dyn Database>,
        Arc::clone(&h.rates) as Arc<dyn RateProvider>,
        Arc::clone(&h.gateway) as Arc<dyn PaymentGateway>,
        Duration::ZERO,
    );
    let reply = expired.handle(&event("anything")).await.unwrap();
    assert!(reply.text.contains("sat idle too long"), "got: {}", reply.text);

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert!(!session.temp_data.contains_key("from_name"));
}

#[tokio::test]
async fn concurrent_double_tap_observes_persisted_write() {
    let h = harness().await;
    h.engine.handle(&event("hi")).await.unwrap();

    // Two copies of the same message race; whichever lands second validates
    // against the step the first one persisted.
    let e1 = event("John Doe");
    let e2 = event("John Doe");
    let (r1, r2) = tokio::join!(h.engine.handle(&e1), h.engine.handle(&e2));
    r1.unwrap();
    r2.unwrap();

    let session = h.store.get("u1").await.unwrap().unwrap();
    assert_eq!(session.field("from_name"), Some("John Doe"));
    // "John Doe" is not a valid ZIP, so the loser cannot have advanced past
    // FromZip or corrupted the name.
    assert_eq!(session.current_step, OrderStep::FromZip);
}

#[tokio::test]
async fn sessions_store_get_or_create_respects_ttl_scenario() {
    let h = harness_with_ttl(TTL).await;
    for payload in ["hi", "John Doe"] {
        h.engine.handle(&event(payload)).await.unwrap();
    }

    // Simulate idle-beyond-TTL with a zero-TTL lookup: the stale session is
    // replaced by a fresh one at Start.
    let (session, _) = h
        .store
        .get_or_create("u1", Map::new(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(session.current_step, OrderStep::Start);
    assert!(session.temp_data.is_empty());
}
