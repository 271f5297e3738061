//! SQL schema for the Covenant SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE ... IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- The event log. Strictly append-only; the triggers below reject any
-- UPDATE or DELETE.
CREATE TABLE IF NOT EXISTS events (
    sequence        INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id        TEXT NOT NULL UNIQUE,
    stream_type     TEXT NOT NULL,   -- 'subscription' | 'wallet' | 'membership'
    stream_id       TEXT NOT NULL,
    stream_version  INTEGER NOT NULL CHECK (stream_version >= 1),
    event_type      TEXT NOT NULL,   -- discriminant of DomainEvent
    schema_version  INTEGER NOT NULL,
    payload_json    TEXT NOT NULL,   -- JSON payload (inner data only)
    occurred_at     TEXT NOT NULL,   -- RFC 3339 UTC; server-assigned
    causation_id    TEXT NOT NULL,
    correlation_id  TEXT NOT NULL,
    UNIQUE (stream_type, stream_id, stream_version)
);

CREATE TRIGGER IF NOT EXISTS events_no_update
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS events_no_delete
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are append-only');
END;

CREATE INDEX IF NOT EXISTS events_correlation_idx ON events(correlation_id);

-- One row per processed external delivery.
CREATE TABLE IF NOT EXISTS deliveries (
    delivery_key    TEXT PRIMARY KEY,
    stream_type     TEXT NOT NULL,
    stream_id       TEXT NOT NULL,
    stream_version  INTEGER NOT NULL,
    sequences       TEXT NOT NULL,   -- JSON array of event sequences
    fingerprint     TEXT,            -- hex SHA-256 of the request body
    processed_at    TEXT NOT NULL
);

-- Folded aggregate state. Disposable: rebuilt from events at will.
CREATE TABLE IF NOT EXISTS projections (
    stream_type     TEXT NOT NULL,
    stream_id       TEXT NOT NULL,
    version         INTEGER NOT NULL,
    watermark       INTEGER NOT NULL,
    state_json      TEXT NOT NULL,
    status          TEXT NOT NULL,
    creator_id      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (stream_type, stream_id)
);

CREATE INDEX IF NOT EXISTS projections_creator_idx ON projections(creator_id);

-- One row per ledger fact on a wallet stream, keyed by event sequence.
CREATE TABLE IF NOT EXISTS ledger_entries (
    sequence          INTEGER PRIMARY KEY,
    creator_id        TEXT NOT NULL,
    kind              TEXT NOT NULL,   -- 'credit' | 'debit'
    amount_cents      INTEGER NOT NULL,
    delta_cents       INTEGER NOT NULL,
    payment_sequence  INTEGER,
    reference         TEXT NOT NULL,
    recorded_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS ledger_entries_creator_idx
    ON ledger_entries(creator_id);
CREATE INDEX IF NOT EXISTS ledger_entries_payment_idx
    ON ledger_entries(payment_sequence);

-- Every payment_succeeded event; posted once a ledger entry references it.
CREATE TABLE IF NOT EXISTS payments (
    sequence         INTEGER PRIMARY KEY,
    subscription_id  TEXT NOT NULL,
    creator_id       TEXT NOT NULL,
    payment_ref      TEXT NOT NULL,
    amount_cents     INTEGER NOT NULL,
    currency         TEXT NOT NULL,
    occurred_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projection_anomalies (
    anomaly_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_type     TEXT NOT NULL,
    stream_id       TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    stream_version  INTEGER NOT NULL,
    event_type      TEXT NOT NULL,
    reason          TEXT NOT NULL,
    detected_at     TEXT NOT NULL,
    resolved_at     TEXT,
    UNIQUE (stream_type, stream_id, sequence)
);

CREATE TABLE IF NOT EXISTS projection_checkpoints (
    name        TEXT PRIMARY KEY,
    sequence    INTEGER NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Audit trail of reconciliation changes to wallet balances.
CREATE TABLE IF NOT EXISTS wallet_corrections (
    correction_id      TEXT PRIMARY KEY,
    creator_id         TEXT NOT NULL,
    previous_balance   INTEGER,
    corrected_balance  INTEGER NOT NULL,
    entry_count        INTEGER NOT NULL,
    watermark          INTEGER NOT NULL,
    corrected_at       TEXT NOT NULL,
    reason             TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS wallet_corrections_creator_idx
    ON wallet_corrections(creator_id);

CREATE TABLE IF NOT EXISTS reconcile_jobs (
    job_name     TEXT PRIMARY KEY,
    stream_type  TEXT NOT NULL,
    last_id      TEXT,
    rebuilt      INTEGER NOT NULL,
    failed       INTEGER NOT NULL,
    status       TEXT NOT NULL,   -- 'running' | 'completed' | 'cancelled'
    started_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

PRAGMA user_version = 1;
";
