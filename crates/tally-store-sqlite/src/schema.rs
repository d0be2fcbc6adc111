//! SQL schemas for the live and archive stores.
//!
//! Executed once at connection startup. Idempotent thanks to
//! `CREATE TABLE IF NOT EXISTS`; future migrations will be gated on
//! `PRAGMA user_version`.

/// Live-store DDL: the ledger, aggregates, pipeline singletons, and the
/// durable task queue.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS petitions (
    petition_id      TEXT PRIMARY KEY,
    action           TEXT NOT NULL,
    state            TEXT NOT NULL DEFAULT 'open',  -- 'open'|'closed'|'rejected'|'hidden'
    state_changed_at TEXT,                          -- terminal transition time
    signature_count  INTEGER NOT NULL DEFAULT 0,
    last_signed_at   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    archived_at      TEXT,                          -- set once migration is verified
    anonymized_at    TEXT,                          -- set once redaction is complete
    count_reset_at   TEXT                           -- reconciler skips while set
);

-- The authoritative ledger. Rows are never deleted individually; the whole
-- petition is deleted after verified archival.
CREATE TABLE IF NOT EXISTS signatures (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    signature_id      TEXT NOT NULL UNIQUE,
    petition_id       TEXT NOT NULL REFERENCES petitions(petition_id),
    name              TEXT,            -- nulled by anonymization
    email             TEXT,            -- nulled by anonymization
    postcode          TEXT,            -- nulled by anonymization
    ip_address        TEXT,            -- nulled by anonymization
    location_code     TEXT NOT NULL,
    constituency_code TEXT NOT NULL,
    state             TEXT NOT NULL DEFAULT 'pending',
    created_at        TEXT NOT NULL,   -- ISO 8601 UTC; server-assigned
    validated_at      TEXT,
    invalidated_at    TEXT,
    anonymized_at     TEXT,            -- monotonic: never cleared once set
    archived          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS journals (
    petition_id     TEXT NOT NULL REFERENCES petitions(petition_id),
    dimension       TEXT NOT NULL,   -- 'constituency' | 'country'
    key             TEXT NOT NULL,
    signature_count INTEGER NOT NULL DEFAULT 0,
    last_signed_at  TEXT,
    PRIMARY KEY (petition_id, dimension, key)
);

-- Dependent petition associations collapsed into one typed table.
CREATE TABLE IF NOT EXISTS petition_records (
    record_id   TEXT PRIMARY KEY,
    petition_id TEXT NOT NULL REFERENCES petitions(petition_id),
    record_kind TEXT NOT NULL,   -- discriminant of RecordValue variant
    value_json  TEXT NOT NULL,   -- JSON payload (inner data only)
    created_at  TEXT NOT NULL
);

-- Standing audit trail; survives petition deletion, hence no foreign key.
CREATE TABLE IF NOT EXISTS invalidations (
    invalidation_id   TEXT PRIMARY KEY,
    ip_address        TEXT,
    email             TEXT,
    name              TEXT,
    postcode          TEXT,
    created_at        TEXT NOT NULL,
    executed_at       TEXT,
    matching_count    INTEGER NOT NULL DEFAULT 0,
    invalidated_count INTEGER NOT NULL DEFAULT 0
);

-- The process-wide 'last reconciled' watermark. Single row, guarded by the
-- same lock discipline as the reconciler itself.
CREATE TABLE IF NOT EXISTS reconciliation_state (
    id                 INTEGER PRIMARY KEY CHECK (id = 1),
    last_reconciled_at TEXT
);
INSERT OR IGNORE INTO reconciliation_state (id, last_reconciled_at)
VALUES (1, NULL);

-- Named non-blocking single-writer locks, one per job family.
CREATE TABLE IF NOT EXISTS locks (
    name        TEXT PRIMARY KEY,
    acquired_at TEXT NOT NULL
);

-- The durable task queue. Popped rows are deleted; a started job is never
-- re-delivered.
CREATE TABLE IF NOT EXISTS tasks (
    task_id   TEXT PRIMARY KEY,
    task_kind TEXT NOT NULL,     -- discriminant of Task variant
    payload   TEXT NOT NULL,     -- full JSON-encoded Task
    priority  INTEGER NOT NULL DEFAULT 0,
    run_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS signatures_petition_idx
    ON signatures(petition_id);
CREATE INDEX IF NOT EXISTS signatures_validated_idx
    ON signatures(state, validated_at);
CREATE INDEX IF NOT EXISTS signatures_archived_idx
    ON signatures(petition_id, archived);
CREATE INDEX IF NOT EXISTS records_petition_idx
    ON petition_records(petition_id);
CREATE INDEX IF NOT EXISTS tasks_due_idx
    ON tasks(run_at, priority);

PRAGMA user_version = 1;
";

/// Archive-store DDL: mirrors the live ledger shape minus the pipeline
/// bookkeeping. `seq` is carried over, not reassigned.
pub const ARCHIVE_SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS petitions (
    petition_id      TEXT PRIMARY KEY,
    action           TEXT NOT NULL,
    state            TEXT NOT NULL,
    state_changed_at TEXT,
    signature_count  INTEGER NOT NULL,
    last_signed_at   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    anonymized_at    TEXT
);

CREATE TABLE IF NOT EXISTS signatures (
    seq               INTEGER PRIMARY KEY,   -- preserved from the live store
    signature_id      TEXT NOT NULL UNIQUE,
    petition_id       TEXT NOT NULL,
    name              TEXT,
    email             TEXT,
    postcode          TEXT,
    ip_address        TEXT,
    location_code     TEXT NOT NULL,
    constituency_code TEXT NOT NULL,
    state             TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    validated_at      TEXT,
    invalidated_at    TEXT,
    anonymized_at     TEXT
);

CREATE TABLE IF NOT EXISTS petition_records (
    record_id   TEXT PRIMARY KEY,
    petition_id TEXT NOT NULL,
    record_kind TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS archive_signatures_petition_idx
    ON signatures(petition_id);

PRAGMA user_version = 1;
";
