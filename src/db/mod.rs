//! Durable storage traits and the session data model.
//!
//! Storage is split per concern (`SessionStore`, `PaymentStore`,
//! `CompletedOrderStore`) with a `Database` supertrait for backends that
//! implement all of them. The only backend today is libSQL; the traits keep
//! the engine and ledger testable against `:memory:` databases and leave room
//! for a server-backed store later.

pub mod libsql;
pub mod libsql_migrations;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::flow::step::OrderStep;
use crate::payments::{PendingPayment, PaymentStatus};

/// Durable per-user conversation state.
///
/// `temp_data` accumulates collected values monotonically within one attempt
/// and is wiped on completion or cancellation. `step_history` is an ordered
/// diagnostic log; the engine never reads it to decide transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub current_step: OrderStep,
    pub temp_data: Map<String, Value>,
    pub step_history: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Session {
    /// Fetch a collected string value from temp_data.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.temp_data.get(key).and_then(Value::as_str)
    }
}

/// How `get_or_create` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// An unexpired session already existed; returned unchanged.
    Existing,
    /// No session existed; a fresh one was created.
    Created,
    /// A session existed but sat idle beyond the TTL; it was dropped and a
    /// fresh one created in its place.
    RecreatedExpired,
}

/// Archived snapshot of a finished flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedOrder {
    pub id: Uuid,
    pub user_id: String,
    pub payload: Value,
    pub completed_at: DateTime<Utc>,
}

/// Result of the guarded terminal-status update on a pending payment.
#[derive(Debug, Clone)]
pub enum TerminalMark {
    /// This caller's update changed the row; side effects belong to it.
    Applied(PendingPayment),
    /// The row was already terminal; the recorded payment is returned.
    AlreadyTerminal(PendingPayment),
    /// No payment with that track_id exists.
    NotFound,
}

/// Durable per-user session state with atomic partial updates and TTL expiry.
///
/// Every mutation is a native single-record atomic operation keyed by
/// `user_id`; concurrent writers for the same user serialize on the database,
/// never on an in-process read-then-write pair.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the existing unexpired session unchanged (`initial_data`
    /// ignored on hit), or create one at [`OrderStep::Start`] seeded with
    /// `initial_data`. An idle session older than `ttl` is treated as
    /// absent and replaced.
    async fn get_or_create(
        &self,
        user_id: &str,
        initial_data: Map<String, Value>,
        ttl: Duration,
    ) -> Result<(Session, SessionOrigin), DatabaseError>;

    /// Load a session without creating one.
    async fn get(&self, user_id: &str) -> Result<Option<Session>, DatabaseError>;

    /// Single atomic merge: set `step` if given, shallow-merge `data` into
    /// temp_data (last-write-wins per key, `null` values delete their key,
    /// untouched keys preserved), append `history_note` to step_history,
    /// clear last_error, bump last_updated. Merge and read-back are one
    /// statement; returns `None` when no session exists for the user.
    async fn update_atomic(
        &self,
        user_id: &str,
        step: Option<OrderStep>,
        data: Map<String, Value>,
        history_note: Option<&str>,
    ) -> Result<Option<Session>, DatabaseError>;

    /// Wipe temp_data and force `current_step` back to [`OrderStep::Start`]
    /// in one statement, regardless of the step in flight. Returns `None`
    /// when no session exists.
    async fn reset(&self, user_id: &str) -> Result<Option<Session>, DatabaseError>;

    /// Atomically move `current_step` back to its static predecessor and
    /// record `error_message`. Returns `None` when the step has no
    /// predecessor, or when the stored step no longer equals `current_step`
    /// (a concurrent transition won; nothing is reverted).
    async fn revert_to_previous(
        &self,
        user_id: &str,
        current_step: OrderStep,
        error_message: &str,
    ) -> Result<Option<OrderStep>, DatabaseError>;

    /// Delete the session; returns whether one existed.
    async fn clear(&self, user_id: &str) -> Result<bool, DatabaseError>;

    /// Atomically archive `result_payload` into the completed-orders log and
    /// delete the session, in one transaction. Returns whether a session
    /// existed.
    async fn complete(&self, user_id: &str, result_payload: Value) -> Result<bool, DatabaseError>;

    /// Drop sessions idle beyond `ttl`; returns the eviction count.
    async fn expire_idle_sessions(&self, ttl: Duration) -> Result<u64, DatabaseError>;
}

/// Durable pending-payment records and the atomic credit contract.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a new pending payment. A duplicate track_id is a constraint
    /// violation.
    async fn create_pending(&self, payment: &PendingPayment) -> Result<(), DatabaseError>;

    async fn get_by_track_id(
        &self,
        track_id: &str,
    ) -> Result<Option<PendingPayment>, DatabaseError>;

    /// Guarded terminal transition: the UPDATE only fires while status is
    /// still `pending`, so exactly one caller ever observes
    /// [`TerminalMark::Applied`] for a given track_id.
    async fn mark_terminal(
        &self,
        track_id: &str,
        status: PaymentStatus,
    ) -> Result<TerminalMark, DatabaseError>;

    /// Atomically add `amount` to the user's balance (upsert).
    async fn credit_balance(&self, user_id: &str, amount: Decimal) -> Result<(), DatabaseError>;

    async fn get_balance(&self, user_id: &str) -> Result<Decimal, DatabaseError>;
}

/// Append-only archive of finished flows.
#[async_trait]
pub trait CompletedOrderStore: Send + Sync {
    async fn list_completed(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<CompletedOrder>, DatabaseError>;
}

/// Unified backend surface.
#[async_trait]
pub trait Database: SessionStore + PaymentStore + CompletedOrderStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
