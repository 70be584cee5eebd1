//! Schema for the embedded libSQL database.
//!
//! Applied as a single idempotent batch on startup (`run_migrations`).
//! Timestamps are stored as RFC 3339 text; JSON payloads as text columns the
//! store never interprets.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS registration_plans (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    session_ref TEXT NOT NULL,
    manual_open_at TEXT,
    detection_url TEXT,
    strategy TEXT NOT NULL DEFAULT 'auto',
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_plans_status ON registration_plans(status, strategy);

CREATE TABLE IF NOT EXISTS detection_log (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    signal TEXT NOT NULL,
    evidence TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_detection_log_plan ON detection_log(plan_id, observed_at DESC);

CREATE TABLE IF NOT EXISTS challenge_tickets (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    token_digest TEXT NOT NULL,
    magic_url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    last_notified_at TEXT,
    notified_via TEXT,
    resolution_note TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_token ON challenge_tickets(token_digest);
CREATE INDEX IF NOT EXISTS idx_tickets_status ON challenge_tickets(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_tickets_user ON challenge_tickets(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    step_name TEXT NOT NULL,
    browser_state TEXT NOT NULL DEFAULT '{}',
    workflow_state TEXT NOT NULL DEFAULT '{}',
    provider_context TEXT NOT NULL DEFAULT '{}',
    success INTEGER NOT NULL DEFAULT 1,
    metadata TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id, created_at DESC);

CREATE TABLE IF NOT EXISTS reservations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    plan_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    charge_ref TEXT NOT NULL,
    provider_response TEXT,
    settled_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reservations_status ON reservations(status);

CREATE TABLE IF NOT EXISTS consent_ledger (
    phone TEXT PRIMARY KEY,
    opted_in INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscribers (
    user_id TEXT PRIMARY KEY,
    phone TEXT,
    phone_verified INTEGER NOT NULL DEFAULT 0,
    email TEXT
);
CREATE INDEX IF NOT EXISTS idx_subscribers_phone ON subscribers(phone);
"#;
