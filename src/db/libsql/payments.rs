//! PaymentStore and CompletedOrderStore implementations.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::libsql::{fmt_ts, get_i64, get_text, get_ts, LibSqlBackend, PAYMENT_COLUMNS};
use crate::db::{CompletedOrder, CompletedOrderStore, PaymentStore, TerminalMark};
use crate::error::DatabaseError;
use crate::payments::{PaymentKind, PaymentStatus, PendingPayment};

/// Balances are stored in minor units (two decimal places) so the credit can
/// be a single integer addition inside the database.
fn to_minor_units(amount: Decimal) -> Result<i64, DatabaseError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| DatabaseError::Serialization(format!("amount out of range: {amount}")))
}

pub(crate) fn row_to_payment(row: &libsql::Row) -> Result<PendingPayment, DatabaseError> {
    let amount: Decimal = get_text(row, 3)
        .parse()
        .map_err(|_| DatabaseError::Serialization(format!("bad amount: {}", get_text(row, 3))))?;
    let status = PaymentStatus::parse(&get_text(row, 5))
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let kind = PaymentKind::parse(&get_text(row, 6))
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(PendingPayment {
        track_id: get_text(row, 0),
        user_id: get_text(row, 1),
        conversation_id: get_i64(row, 2),
        amount,
        currency: get_text(row, 4),
        status,
        kind,
        created_at: get_ts(row, 7),
    })
}

#[async_trait]
impl PaymentStore for LibSqlBackend {
    async fn create_pending(&self, payment: &PendingPayment) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO pending_payments (track_id, user_id, conversation_id, amount, currency, status, kind, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            libsql::params![
                payment.track_id.as_str(),
                payment.user_id.as_str(),
                payment.conversation_id,
                payment.amount.to_string(),
                payment.currency.as_str(),
                payment.status.as_str(),
                payment.kind.as_str(),
                fmt_ts(&payment.created_at),
            ],
        )
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                DatabaseError::Constraint(format!("duplicate track_id {}", payment.track_id))
            } else {
                DatabaseError::LibSql(e)
            }
        })?;
        Ok(())
    }

    async fn get_by_track_id(
        &self,
        track_id: &str,
    ) -> Result<Option<PendingPayment>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {PAYMENT_COLUMNS} FROM pending_payments WHERE track_id = ?1"),
                libsql::params![track_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_payment(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_terminal(
        &self,
        track_id: &str,
        status: PaymentStatus,
    ) -> Result<TerminalMark, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Constraint(
                "mark_terminal requires a terminal status".to_string(),
            ));
        }

        let conn = self.connect().await?;
        // The guard on status='pending' is the whole idempotency story:
        // exactly one concurrent caller sees a changed row.
        let changed = conn
            .execute(
                "UPDATE pending_payments SET status = ?2 WHERE track_id = ?1 AND status = 'pending'",
                libsql::params![track_id, status.as_str()],
            )
            .await?;

        let mut rows = conn
            .query(
                &format!("SELECT {PAYMENT_COLUMNS} FROM pending_payments WHERE track_id = ?1"),
                libsql::params![track_id],
            )
            .await?;
        match rows.next().await? {
            None => Ok(TerminalMark::NotFound),
            Some(row) => {
                let payment = row_to_payment(&row)?;
                if changed > 0 {
                    Ok(TerminalMark::Applied(payment))
                } else {
                    Ok(TerminalMark::AlreadyTerminal(payment))
                }
            }
        }
    }

    async fn credit_balance(&self, user_id: &str, amount: Decimal) -> Result<(), DatabaseError> {
        let minor = to_minor_units(amount)?;
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO balances (user_id, amount_minor) VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET amount_minor = amount_minor + excluded.amount_minor
            "#,
            libsql::params![user_id, minor],
        )
        .await?;
        Ok(())
    }

    async fn get_balance(&self, user_id: &str) -> Result<Decimal, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT amount_minor FROM balances WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Decimal::new(get_i64(&row, 0), 2)),
            None => Ok(Decimal::ZERO),
        }
    }
}

#[async_trait]
impl CompletedOrderStore for LibSqlBackend {
    async fn list_completed(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<CompletedOrder>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, user_id, payload, completed_at
                FROM completed_orders
                WHERE user_id = ?1
                ORDER BY completed_at DESC
                LIMIT ?2
                "#,
                libsql::params![user_id, limit],
            )
            .await?;

        let mut orders = Vec::new();
        while let Some(row) = rows.next().await? {
            let id = Uuid::parse_str(&get_text(&row, 0))
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            let payload = serde_json::from_str(&get_text(&row, 2))
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            orders.push(CompletedOrder {
                id,
                user_id: get_text(&row, 1),
                payload,
                completed_at: get_ts(&row, 3),
            });
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    async fn backend() -> LibSqlBackend {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();
        backend
    }

    fn payment(track_id: &str) -> PendingPayment {
        PendingPayment::new(track_id, "u1", 77, dec!(10.00), "USD", PaymentKind::Order)
    }

    #[tokio::test]
    async fn duplicate_track_id_is_a_constraint_violation() {
        let store = backend().await;
        store.create_pending(&payment("T1")).await.unwrap();
        let err = store.create_pending(&payment("T1")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn first_terminal_mark_applies_rest_are_noops() {
        let store = backend().await;
        store.create_pending(&payment("T1")).await.unwrap();

        match store.mark_terminal("T1", PaymentStatus::Paid).await.unwrap() {
            TerminalMark::Applied(p) => assert_eq!(p.status, PaymentStatus::Paid),
            other => panic!("expected Applied, got {other:?}"),
        }
        match store.mark_terminal("T1", PaymentStatus::Paid).await.unwrap() {
            TerminalMark::AlreadyTerminal(p) => assert_eq!(p.status, PaymentStatus::Paid),
            other => panic!("expected AlreadyTerminal, got {other:?}"),
        }
        // A late contradictory report cannot rewrite the recorded outcome.
        match store.mark_terminal("T1", PaymentStatus::Failed).await.unwrap() {
            TerminalMark::AlreadyTerminal(p) => assert_eq!(p.status, PaymentStatus::Paid),
            other => panic!("expected AlreadyTerminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_track_id_is_not_found() {
        let store = backend().await;
        assert!(matches!(
            store.mark_terminal("ghost", PaymentStatus::Paid).await.unwrap(),
            TerminalMark::NotFound
        ));
    }

    #[tokio::test]
    async fn non_terminal_mark_is_rejected() {
        let store = backend().await;
        store.create_pending(&payment("T1")).await.unwrap();
        assert!(store.mark_terminal("T1", PaymentStatus::Pending).await.is_err());
    }

    #[tokio::test]
    async fn balance_credits_accumulate() {
        let store = backend().await;
        assert_eq!(store.get_balance("u1").await.unwrap(), Decimal::ZERO);

        store.credit_balance("u1", dec!(10.00)).await.unwrap();
        store.credit_balance("u1", dec!(2.50)).await.unwrap();
        assert_eq!(store.get_balance("u1").await.unwrap(), dec!(12.50));
    }

    #[tokio::test]
    async fn concurrent_marks_apply_exactly_once() {
        let store = std::sync::Arc::new(backend().await);
        store.create_pending(&payment("T1")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = std::sync::Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.mark_terminal("T1", PaymentStatus::Paid).await
            }));
        }

        let mut applied = 0;
        for task in tasks {
            if let TerminalMark::Applied(_) = task.await.unwrap().unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1, "exactly one delivery may win the transition");
    }
}
