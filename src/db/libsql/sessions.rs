//! SessionStore implementation: guarded single-statement session mutations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::db::libsql::{fmt_ts, get_opt_text, get_text, get_ts, opt_text, LibSqlBackend, SESSION_COLUMNS};
use crate::db::{Session, SessionOrigin, SessionStore};
use crate::error::DatabaseError;
use crate::flow::step::OrderStep;

pub(crate) fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let step_name = get_text(row, 1);
    let current_step = OrderStep::parse(&step_name)
        .map_err(|_| DatabaseError::Serialization(format!("unknown step in row: {step_name}")))?;

    let temp_data: Map<String, Value> = serde_json::from_str(&get_text(row, 2))
        .map_err(|e| DatabaseError::Serialization(format!("bad temp_data: {e}")))?;
    let step_history: Vec<String> = serde_json::from_str(&get_text(row, 3))
        .map_err(|e| DatabaseError::Serialization(format!("bad step_history: {e}")))?;

    Ok(Session {
        user_id: get_text(row, 0),
        current_step,
        temp_data,
        step_history,
        last_error: get_opt_text(row, 4),
        created_at: get_ts(row, 5),
        last_updated: get_ts(row, 6),
    })
}

fn encode_data(data: &Map<String, Value>) -> Result<String, DatabaseError> {
    serde_json::to_string(data).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn get_or_create(
        &self,
        user_id: &str,
        initial_data: Map<String, Value>,
        ttl: Duration,
    ) -> Result<(Session, SessionOrigin), DatabaseError> {
        let conn = self.connect().await?;
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(ttl)
                .map_err(|e| DatabaseError::Query(format!("ttl out of range: {e}")))?;

        // An idle-beyond-TTL row is treated as absent. The guarded DELETE and
        // the DO NOTHING insert are each atomic; a concurrent live update
        // bumps last_updated and escapes the cutoff.
        let stale_dropped = conn
            .execute(
                "DELETE FROM sessions WHERE user_id = ?1 AND last_updated < ?2",
                libsql::params![user_id, fmt_ts(&cutoff)],
            )
            .await?
            > 0;

        let created = conn
            .execute(
                r#"
                INSERT INTO sessions (user_id, current_step, temp_data, step_history, last_error, created_at, last_updated)
                VALUES (?1, ?2, ?3, '[]', NULL, ?4, ?4)
                ON CONFLICT(user_id) DO NOTHING
                "#,
                libsql::params![
                    user_id,
                    OrderStep::Start.as_str(),
                    encode_data(&initial_data)?,
                    fmt_ts(&now),
                ],
            )
            .await?
            > 0;

        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1"),
                libsql::params![user_id],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "session".to_string(),
                id: user_id.to_string(),
            })?;

        let origin = match (created, stale_dropped) {
            (true, true) => SessionOrigin::RecreatedExpired,
            (true, false) => SessionOrigin::Created,
            (false, _) => SessionOrigin::Existing,
        };
        Ok((row_to_session(&row)?, origin))
    }

    async fn get(&self, user_id: &str) -> Result<Option<Session>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1"),
                libsql::params![user_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_atomic(
        &self,
        user_id: &str,
        step: Option<OrderStep>,
        data: Map<String, Value>,
        history_note: Option<&str>,
    ) -> Result<Option<Session>, DatabaseError> {
        let conn = self.connect().await?;

        // One statement does the merge and the read-back: json_patch gives
        // per-key last-write-wins (null deletes a key), RETURNING hands back
        // the post-merge row without a second read racing other writers.
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    UPDATE sessions SET
                        current_step = COALESCE(?2, current_step),
                        temp_data    = json_patch(temp_data, ?3),
                        step_history = CASE WHEN ?4 IS NULL THEN step_history
                                            ELSE json_insert(step_history, '$[#]', ?4) END,
                        last_error   = NULL,
                        last_updated = ?5
                    WHERE user_id = ?1
                    RETURNING {SESSION_COLUMNS}
                    "#
                ),
                libsql::params![
                    user_id,
                    opt_text(step.map(OrderStep::as_str)),
                    encode_data(&data)?,
                    opt_text(history_note),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn reset(&self, user_id: &str) -> Result<Option<Session>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    UPDATE sessions SET
                        current_step = ?2,
                        temp_data    = '{{}}',
                        step_history = json_insert(step_history, '$[#]', 'reset'),
                        last_error   = NULL,
                        last_updated = ?3
                    WHERE user_id = ?1
                    RETURNING {SESSION_COLUMNS}
                    "#
                ),
                libsql::params![user_id, OrderStep::Start.as_str(), fmt_ts(&Utc::now())],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn revert_to_previous(
        &self,
        user_id: &str,
        current_step: OrderStep,
        error_message: &str,
    ) -> Result<Option<OrderStep>, DatabaseError> {
        let Some(previous) = current_step.predecessor() else {
            return Ok(None);
        };

        let conn = self.connect().await?;
        let note = format!("revert {} -> {}", current_step.as_str(), previous.as_str());
        // Guarded on the expected current step: if a concurrent transition
        // already moved the session, zero rows change and nothing reverts.
        let changed = conn
            .execute(
                r#"
                UPDATE sessions SET
                    current_step = ?3,
                    last_error   = ?4,
                    step_history = json_insert(step_history, '$[#]', ?5),
                    last_updated = ?6
                WHERE user_id = ?1 AND current_step = ?2
                "#,
                libsql::params![
                    user_id,
                    current_step.as_str(),
                    previous.as_str(),
                    error_message,
                    note,
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;

        Ok(if changed > 0 { Some(previous) } else { None })
    }

    async fn clear(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM sessions WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn complete(&self, user_id: &str, result_payload: Value) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let payload = serde_json::to_string(&result_payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        // Archive and delete under one transaction so a concurrent
        // get_or_create can never observe the half-finished pair.
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin failed: {e}")))?;
        tx.execute(
            "INSERT INTO completed_orders (id, user_id, payload, completed_at) VALUES (?1, ?2, ?3, ?4)",
            libsql::params![
                Uuid::new_v4().to_string(),
                user_id,
                payload,
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;
        let deleted = tx
            .execute(
                "DELETE FROM sessions WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit failed: {e}")))?;

        Ok(deleted > 0)
    }

    async fn expire_idle_sessions(&self, ttl: Duration) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| DatabaseError::Query(format!("ttl out of range: {e}")))?;
        let evicted = conn
            .execute(
                "DELETE FROM sessions WHERE last_updated < ?1",
                libsql::params![fmt_ts(&cutoff)],
            )
            .await?;
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(3600);

    async fn backend() -> LibSqlBackend {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        use crate::db::Database;
        backend.run_migrations().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn get_or_create_ignores_initial_data_on_hit() {
        let store = backend().await;

        let mut initial = Map::new();
        initial.insert("from_name".to_string(), json!("John"));
        let (first, origin) = store.get_or_create("u1", initial, TTL).await.unwrap();
        assert_eq!(origin, SessionOrigin::Created);
        assert_eq!(first.field("from_name"), Some("John"));
        assert_eq!(first.current_step, OrderStep::Start);

        // A second call with different seed data must not reset anything.
        let mut other = Map::new();
        other.insert("from_name".to_string(), json!("Mallory"));
        let (second, origin) = store.get_or_create("u1", other, TTL).await.unwrap();
        assert_eq!(origin, SessionOrigin::Existing);
        assert_eq!(second.field("from_name"), Some("John"));
    }

    #[tokio::test]
    async fn update_atomic_merges_per_key_and_preserves_others() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();

        let mut first = Map::new();
        first.insert("from_name".to_string(), json!("John"));
        first.insert("from_zip".to_string(), json!("94107"));
        store
            .update_atomic("u1", Some(OrderStep::FromStreet), first, Some("a"))
            .await
            .unwrap()
            .unwrap();

        let mut second = Map::new();
        second.insert("from_zip".to_string(), json!("10001"));
        let session = store
            .update_atomic("u1", None, second, Some("b"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.current_step, OrderStep::FromStreet);
        assert_eq!(session.field("from_name"), Some("John"));
        assert_eq!(session.field("from_zip"), Some("10001"));
        assert_eq!(session.step_history, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn update_atomic_null_deletes_key() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();

        let mut data = Map::new();
        data.insert("resume_step".to_string(), json!("from_zip"));
        store.update_atomic("u1", None, data, None).await.unwrap();

        let mut removal = Map::new();
        removal.insert("resume_step".to_string(), Value::Null);
        let session = store
            .update_atomic("u1", None, removal, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.temp_data.contains_key("resume_step"));
    }

    #[tokio::test]
    async fn update_atomic_returns_none_without_session() {
        let store = backend().await;
        let result = store
            .update_atomic("ghost", Some(OrderStep::FromName), Map::new(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn reset_wipes_data_and_forces_start() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();
        let mut data = Map::new();
        data.insert("from_name".to_string(), json!("John"));
        store
            .update_atomic("u1", Some(OrderStep::FromZip), data, None)
            .await
            .unwrap();

        let session = store.reset("u1").await.unwrap().unwrap();
        assert_eq!(session.current_step, OrderStep::Start);
        assert!(session.temp_data.is_empty());
    }

    #[tokio::test]
    async fn revert_walks_back_one_step_and_records_error() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();
        store
            .update_atomic("u1", Some(OrderStep::RateSelect), Map::new(), None)
            .await
            .unwrap();

        let previous = store
            .revert_to_previous("u1", OrderStep::RateSelect, "rate API timed out")
            .await
            .unwrap();
        assert_eq!(previous, Some(OrderStep::ParcelSize));

        let session = store.get("u1").await.unwrap().unwrap();
        assert_eq!(session.current_step, OrderStep::ParcelSize);
        assert_eq!(session.last_error.as_deref(), Some("rate API timed out"));
    }

    #[tokio::test]
    async fn revert_at_start_is_a_no_op() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();

        let previous = store
            .revert_to_previous("u1", OrderStep::Start, "boom")
            .await
            .unwrap();
        assert_eq!(previous, None);

        let session = store.get("u1").await.unwrap().unwrap();
        assert_eq!(session.current_step, OrderStep::Start);
    }

    #[tokio::test]
    async fn revert_loses_to_concurrent_transition() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();
        store
            .update_atomic("u1", Some(OrderStep::Confirm), Map::new(), None)
            .await
            .unwrap();

        // The stored step is Confirm, not RateSelect: the guard must refuse.
        let previous = store
            .revert_to_previous("u1", OrderStep::RateSelect, "late failure")
            .await
            .unwrap();
        assert_eq!(previous, None);
        let session = store.get("u1").await.unwrap().unwrap();
        assert_eq!(session.current_step, OrderStep::Confirm);
    }

    #[tokio::test]
    async fn clear_reports_whether_a_session_existed() {
        let store = backend().await;
        assert!(!store.clear("u1").await.unwrap());
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();
        assert!(store.clear("u1").await.unwrap());
    }

    #[tokio::test]
    async fn complete_archives_and_deletes_atomically() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();

        let existed = store
            .complete("u1", json!({"track_id": "T1"}))
            .await
            .unwrap();
        assert!(existed);
        assert!(store.get("u1").await.unwrap().is_none());

        use crate::db::CompletedOrderStore;
        let archived = store.list_completed("u1", 10).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].payload["track_id"], json!("T1"));
    }

    #[tokio::test]
    async fn expired_session_is_replaced_with_fresh_one() {
        let store = backend().await;
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();
        let mut data = Map::new();
        data.insert("from_name".to_string(), json!("John"));
        store
            .update_atomic("u1", Some(OrderStep::FromZip), data, None)
            .await
            .unwrap();

        // A zero TTL makes any existing row stale immediately.
        let (session, origin) = store
            .get_or_create("u1", Map::new(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(origin, SessionOrigin::RecreatedExpired);
        assert_eq!(session.current_step, OrderStep::Start);
        assert!(session.temp_data.is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_sessions() {
        let store = backend().await;
        store.get_or_create("idle", Map::new(), TTL).await.unwrap();
        store.get_or_create("live", Map::new(), TTL).await.unwrap();

        // Both rows were written "now": a 1-hour sweep keeps them.
        assert_eq!(store.expire_idle_sessions(TTL).await.unwrap(), 0);
        // A zero-TTL sweep evicts everything idle for longer than 0s.
        assert_eq!(store.expire_idle_sessions(Duration::ZERO).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_updates_for_same_user_both_land() {
        let store = std::sync::Arc::new(backend().await);
        store.get_or_create("u1", Map::new(), TTL).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = std::sync::Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let mut data = Map::new();
                data.insert(format!("k{i}"), json!(i));
                store.update_atomic("u1", None, data, None).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let session = store.get("u1").await.unwrap().unwrap();
        // Every key survives: merges are per-key, not whole-map overwrites.
        for i in 0..10 {
            assert!(session.temp_data.contains_key(&format!("k{i}")), "missing k{i}");
        }
    }
}
