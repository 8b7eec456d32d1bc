//! Schema for the libSQL backend.
//!
//! Applied as one batch on startup; every statement is idempotent so the
//! batch can run against an existing database.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    user_id TEXT PRIMARY KEY,
    current_step TEXT NOT NULL,
    temp_data TEXT NOT NULL DEFAULT '{}',
    step_history TEXT NOT NULL DEFAULT '[]',
    last_error TEXT,
    created_at TEXT NOT NULL,
    last_updated TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_last_updated ON sessions(last_updated);

CREATE TABLE IF NOT EXISTS pending_payments (
    track_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    conversation_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_payments_user ON pending_payments(user_id);

CREATE TABLE IF NOT EXISTS completed_orders (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    completed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_completed_orders_user ON completed_orders(user_id);

CREATE TABLE IF NOT EXISTS balances (
    user_id TEXT PRIMARY KEY,
    amount_minor INTEGER NOT NULL DEFAULT 0
);
"#;
