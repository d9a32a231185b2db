//! SQL schema for the cadence SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS partition_entities (
    partition_key        TEXT PRIMARY KEY CHECK (partition_key <> ''),
    is_active            INTEGER NOT NULL DEFAULT 1,
    partition_created    INTEGER NOT NULL DEFAULT 0,
    caching_enabled      INTEGER NOT NULL DEFAULT 1,
    auto_archive_enabled INTEGER NOT NULL DEFAULT 0,
    created_at           INTEGER NOT NULL        -- unix millis
);

-- Catalog of provisioned physical partitions. Each row owns a partial index
-- over review_records restricted to its key.
CREATE TABLE IF NOT EXISTS storage_partitions (
    partition_key TEXT PRIMARY KEY,
    index_name    TEXT NOT NULL,
    created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS review_records (
    owner_id         TEXT    NOT NULL,
    partition_key    TEXT    NOT NULL CHECK (partition_key <> ''),
    item_id          TEXT    NOT NULL,
    stability_score  REAL    NOT NULL,
    next_review_at   INTEGER NOT NULL,   -- unix millis
    last_reviewed_at INTEGER NOT NULL,   -- unix millis
    subject          TEXT,
    topic            TEXT,
    UNIQUE (owner_id, partition_key, item_id)
);

CREATE TRIGGER IF NOT EXISTS review_partition_immutable
BEFORE UPDATE OF partition_key ON review_records
WHEN NEW.partition_key <> OLD.partition_key
BEGIN
    SELECT RAISE(ABORT, 'partition_key is immutable');
END;

CREATE INDEX IF NOT EXISTS review_owner_due_idx
    ON review_records(owner_id, partition_key, next_review_at);

-- Cold storage. Rows are never updated except for eligible_for_deletion.
CREATE TABLE IF NOT EXISTS archived_records (
    owner_id              TEXT    NOT NULL,
    partition_key         TEXT    NOT NULL,
    item_id               TEXT    NOT NULL,
    stability_score       REAL    NOT NULL,
    next_review_at        INTEGER NOT NULL,
    last_reviewed_at      INTEGER NOT NULL,
    subject               TEXT,
    topic                 TEXT,
    archived_at           INTEGER NOT NULL,
    eligible_for_deletion INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS archived_partition_idx ON archived_records(partition_key);
CREATE INDEX IF NOT EXISTS archived_at_idx        ON archived_records(archived_at);

-- Append-only audit trail, written in the same transaction as the upserts.
CREATE TABLE IF NOT EXISTS review_audit (
    job_ref         TEXT    NOT NULL,
    owner_id        TEXT    NOT NULL,
    partition_key   TEXT    NOT NULL,
    item_id         TEXT    NOT NULL,
    stability_score REAL    NOT NULL,
    next_review_at  INTEGER NOT NULL,
    persisted_at    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS review_audit_job_idx ON review_audit(job_ref);

CREATE TABLE IF NOT EXISTS persist_failures (
    job_ref        TEXT PRIMARY KEY,
    owner_id       TEXT    NOT NULL,
    partition_key  TEXT    NOT NULL,
    attempts       INTEGER NOT NULL,
    last_error     TEXT    NOT NULL,
    responses_json TEXT    NOT NULL,
    failed_at      INTEGER NOT NULL
);

-- Partitions whose records have moved to cold storage. Set in the same
-- transaction as the move; review writes check it inside theirs.
CREATE TABLE IF NOT EXISTS archived_partitions (
    partition_key TEXT PRIMARY KEY,
    archived_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS archive_runs (
    run_id            TEXT PRIMARY KEY,
    partition_key     TEXT    NOT NULL,
    state             TEXT    NOT NULL,   -- 'running' | 'completed' | 'failed'
    archived_records  INTEGER NOT NULL DEFAULT 0,
    purged_cache_keys INTEGER NOT NULL DEFAULT 0,
    started_at        INTEGER NOT NULL,
    finished_at       INTEGER,
    error             TEXT
);

CREATE INDEX IF NOT EXISTS archive_runs_partition_idx
    ON archive_runs(partition_key, started_at);

PRAGMA user_version = 2;
";

/// Name of the partial index that backs the physical partition for `key`.
/// Hex-encoding keeps arbitrary keys valid as SQL identifiers.
pub fn partition_index_name(key: &str) -> String {
  format!("review_part_{}", hex::encode(key.as_bytes()))
}

/// DDL for the partial index of one physical partition.
pub fn partition_index_ddl(key: &str) -> String {
  format!(
    "CREATE INDEX IF NOT EXISTS \"{}\"
       ON review_records(owner_id, next_review_at)
       WHERE partition_key = '{}'",
    partition_index_name(key),
    key.replace('\'', "''"),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn index_names_are_identifier_safe() {
    let name = partition_index_name("fall'25 \"x\"");
    assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
  }

  #[test]
  fn quotes_in_keys_are_escaped() {
    let ddl = partition_index_ddl("o'brien");
    assert!(ddl.contains("'o''brien'"));
  }
}
