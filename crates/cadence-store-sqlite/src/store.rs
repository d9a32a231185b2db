//! [`SqliteStore`], the SQLite implementation of [`ReviewStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;

use cadence_core::{
  partition::{
    ArchiveRun, NewPartition, PartitionCounts, PartitionEntity, PartitionFlags,
    Provisioned,
  },
  review::{
    ArchivedRecord, DueQuery, PersistFailure, PersistOutcome, ReviewBatch, ReviewRecord,
  },
  store::ReviewStore,
};

use crate::{
  encode::{
    encode_responses, encode_run_state, encode_ts, encode_uuid, RawArchiveRun,
    RawArchived, RawFailure, RawPartition, RawRecord, ARCHIVED_COLUMNS,
    PARTITION_COLUMNS, RECORD_COLUMNS, RUN_COLUMNS,
  },
  schema::{partition_index_ddl, partition_index_name, SCHEMA},
  Result,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A cadence review store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run arbitrary SQL against the underlying connection.
  #[cfg(any(test, feature = "test-support"))]
  pub async fn execute_batch(&self, sql: &str) -> Result<()> {
    let sql = sql.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(&sql)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn query_records(
    &self,
    sql: String,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<ReviewRecord>> {
    let raws: Vec<RawRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawRecord::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecord::into_record).collect()
  }
}

// ─── ReviewStore impl ────────────────────────────────────────────────────────

impl ReviewStore for SqliteStore {
  type Error = crate::Error;

  // ── Review records ──────────────────────────────────────────────────────

  async fn persist_batch(&self, batch: ReviewBatch) -> Result<PersistOutcome> {
    batch.validate()?;

    let job_ref_str   = encode_uuid(batch.job_ref);
    let partition_key = batch.partition_key.clone();
    let persisted_at  = encode_ts(Utc::now());
    let rows: Vec<RawRecord> = batch
      .records()
      .map(|r| RawRecord {
        owner_id:         r.owner_id,
        partition_key:    r.partition_key,
        item_id:          r.item_id,
        stability_score:  r.stability_score,
        next_review_at:   encode_ts(r.next_review_at),
        last_reviewed_at: encode_ts(r.last_reviewed_at),
        subject:          r.classification.subject,
        topic:            r.classification.topic,
      })
      .collect();

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let seen = tx
          .query_row(
            "SELECT 1 FROM review_audit WHERE job_ref = ?1 LIMIT 1",
            rusqlite::params![job_ref_str],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if seen {
          return Ok(PersistOutcome::AlreadyApplied);
        }

        let archived = tx
          .query_row(
            "SELECT 1 FROM archived_partitions WHERE partition_key = ?1",
            rusqlite::params![partition_key],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if archived {
          return Ok(PersistOutcome::PartitionArchived);
        }

        let mut applied = 0;
        {
          let mut upsert = tx.prepare(
            "INSERT INTO review_records (
               owner_id, partition_key, item_id, stability_score,
               next_review_at, last_reviewed_at, subject, topic
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (owner_id, partition_key, item_id) DO UPDATE SET
               stability_score  = excluded.stability_score,
               next_review_at   = excluded.next_review_at,
               last_reviewed_at = excluded.last_reviewed_at,
               subject          = COALESCE(excluded.subject, review_records.subject),
               topic            = COALESCE(excluded.topic, review_records.topic)
             WHERE excluded.last_reviewed_at >= review_records.last_reviewed_at",
          )?;
          let mut audit = tx.prepare(
            "INSERT INTO review_audit (
               job_ref, owner_id, partition_key, item_id,
               stability_score, next_review_at, persisted_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          )?;

          for row in &rows {
            applied += upsert.execute(rusqlite::params![
              row.owner_id,
              row.partition_key,
              row.item_id,
              row.stability_score,
              row.next_review_at,
              row.last_reviewed_at,
              row.subject,
              row.topic,
            ])?;
            audit.execute(rusqlite::params![
              job_ref_str,
              row.owner_id,
              row.partition_key,
              row.item_id,
              row.stability_score,
              row.next_review_at,
              persisted_at,
            ])?;
          }
        }

        tx.commit()?;
        Ok(PersistOutcome::Applied { rows: applied })
      })
      .await?;

    Ok(outcome)
  }

  async fn load_owner(
    &self,
    owner_id:      &str,
    partition_key: &str,
  ) -> Result<Vec<ReviewRecord>> {
    self
      .query_records(
        format!(
          "SELECT {RECORD_COLUMNS} FROM review_records
           WHERE owner_id = ?1 AND partition_key = ?2
           ORDER BY next_review_at"
        ),
        vec![owner_id.to_owned().into(), partition_key.to_owned().into()],
      )
      .await
  }

  async fn top_due(&self, query: &DueQuery) -> Result<Vec<ReviewRecord>> {
    let mut conds = vec![
      "owner_id = ?1",
      "partition_key = ?2",
      "next_review_at <= ?3",
    ];
    let mut params: Vec<rusqlite::types::Value> = vec![
      query.owner_id.clone().into(),
      query.partition_key.clone().into(),
      encode_ts(query.due_before).into(),
      (query.limit as i64).into(),
    ];
    if let Some(subject) = &query.filter.subject {
      conds.push("subject = ?5");
      params.push(subject.clone().into());
    }
    if let Some(topic) = &query.filter.topic {
      conds.push(if query.filter.subject.is_some() {
        "topic = ?6"
      } else {
        "topic = ?5"
      });
      params.push(topic.clone().into());
    }

    let sql = format!(
      "SELECT {RECORD_COLUMNS} FROM review_records
       WHERE {}
       ORDER BY next_review_at ASC
       LIMIT ?4",
      conds.join(" AND ")
    );
    self.query_records(sql, params).await
  }

  async fn get_review(
    &self,
    owner_id:      &str,
    partition_key: &str,
    item_id:       &str,
  ) -> Result<Option<ReviewRecord>> {
    let mut found = self
      .query_records(
        format!(
          "SELECT {RECORD_COLUMNS} FROM review_records
           WHERE owner_id = ?1 AND partition_key = ?2 AND item_id = ?3"
        ),
        vec![
          owner_id.to_owned().into(),
          partition_key.to_owned().into(),
          item_id.to_owned().into(),
        ],
      )
      .await?;
    Ok(found.pop())
  }

  async fn sample_active(&self, limit: usize) -> Result<Vec<ReviewRecord>> {
    // Records whose partition has no entity yet count as active.
    self
      .query_records(
        "SELECT r.owner_id, r.partition_key, r.item_id, r.stability_score,
                r.next_review_at, r.last_reviewed_at, r.subject, r.topic
         FROM review_records r
         LEFT JOIN partition_entities p ON p.partition_key = r.partition_key
         WHERE COALESCE(p.is_active, 1) = 1
         ORDER BY RANDOM()
         LIMIT ?1"
          .to_owned(),
        vec![(limit as i64).into()],
      )
      .await
  }

  async fn owners_in_partition(&self, partition_key: &str) -> Result<Vec<String>> {
    let key = partition_key.to_owned();
    let owners = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT owner_id FROM review_records
           WHERE partition_key = ?1 ORDER BY owner_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![key], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(owners)
  }

  // ── Persistence failures ────────────────────────────────────────────────

  async fn record_persist_failure(&self, failure: PersistFailure) -> Result<()> {
    let job_ref_str    = encode_uuid(failure.job_ref);
    let responses_json = encode_responses(&failure.responses)?;
    let failed_at      = encode_ts(failure.failed_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO persist_failures (
             job_ref, owner_id, partition_key, attempts,
             last_error, responses_json, failed_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            job_ref_str,
            failure.owner_id,
            failure.partition_key,
            failure.attempts,
            failure.last_error,
            responses_json,
            failed_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_persist_failures(&self, limit: usize) -> Result<Vec<PersistFailure>> {
    let limit_val = limit as i64;
    let raws: Vec<RawFailure> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT job_ref, owner_id, partition_key, attempts,
                  last_error, responses_json, failed_at
           FROM persist_failures
           ORDER BY failed_at DESC
           LIMIT ?1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![limit_val], |row| {
            Ok(RawFailure {
              job_ref:        row.get(0)?,
              owner_id:       row.get(1)?,
              partition_key:  row.get(2)?,
              attempts:       row.get(3)?,
              last_error:     row.get(4)?,
              responses_json: row.get(5)?,
              failed_at:      row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawFailure::into_failure).collect()
  }

  // ── Physical partitions ─────────────────────────────────────────────────

  async fn storage_partition_exists(&self, partition_key: &str) -> Result<bool> {
    let key = partition_key.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM storage_partitions WHERE partition_key = ?1",
              rusqlite::params![key],
              |_| Ok(()),
            )
            .optional()?
            .is_some(),
        )
      })
      .await?;
    Ok(exists)
  }

  async fn provision_storage_partition(&self, partition_key: &str) -> Result<Provisioned> {
    let key        = partition_key.to_owned();
    let index_name = partition_index_name(partition_key);
    let ddl        = partition_index_ddl(partition_key);
    let created_at = encode_ts(Utc::now());

    let provisioned = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let inserted = tx.execute(
          "INSERT OR IGNORE INTO storage_partitions (partition_key, index_name, created_at)
           VALUES (?1, ?2, ?3)",
          rusqlite::params![key, index_name, created_at],
        )?;
        if inserted == 0 {
          return Ok(Provisioned::AlreadyExisted);
        }
        tx.execute_batch(&ddl)?;
        tx.commit()?;
        Ok(Provisioned::Created)
      })
      .await?;

    if provisioned == Provisioned::Created {
      tracing::info!(partition = partition_key, "provisioned storage partition");
    }
    Ok(provisioned)
  }

  async fn list_storage_partitions(&self) -> Result<Vec<String>> {
    let keys = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT partition_key FROM storage_partitions ORDER BY partition_key")?;
        let rows = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(keys)
  }

  // ── Partition entities ──────────────────────────────────────────────────

  async fn create_partition(&self, input: NewPartition) -> Result<Option<PartitionEntity>> {
    let entity = PartitionEntity {
      partition_key:        input.partition_key,
      is_active:            input.is_active,
      partition_created:    false,
      caching_enabled:      input.caching_enabled,
      auto_archive_enabled: input.auto_archive_enabled,
      created_at:           Utc::now(),
    };
    if entity.partition_key.is_empty() {
      return Err(cadence_core::Error::EmptyPartitionKey.into());
    }

    let row = RawPartition {
      partition_key:        entity.partition_key.clone(),
      is_active:            entity.is_active,
      partition_created:    false,
      caching_enabled:      entity.caching_enabled,
      auto_archive_enabled: entity.auto_archive_enabled,
      created_at:           encode_ts(entity.created_at),
    };

    let inserted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "INSERT OR IGNORE INTO partition_entities (
             partition_key, is_active, partition_created,
             caching_enabled, auto_archive_enabled, created_at
           ) VALUES (?1, ?2, 0, ?3, ?4, ?5)",
          rusqlite::params![
            row.partition_key,
            row.is_active,
            row.caching_enabled,
            row.auto_archive_enabled,
            row.created_at,
          ],
        )?)
      })
      .await?;

    Ok((inserted == 1).then_some(entity))
  }

  async fn get_partition(&self, partition_key: &str) -> Result<Option<PartitionEntity>> {
    let key = partition_key.to_owned();
    let raw: Option<RawPartition> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {PARTITION_COLUMNS} FROM partition_entities WHERE partition_key = ?1"
              ),
              rusqlite::params![key],
              RawPartition::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawPartition::into_entity).transpose()
  }

  async fn list_partitions(&self) -> Result<Vec<PartitionEntity>> {
    let raws: Vec<RawPartition> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PARTITION_COLUMNS} FROM partition_entities ORDER BY partition_key"
        ))?;
        let rows = stmt
          .query_map([], RawPartition::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPartition::into_entity).collect()
  }

  async fn update_partition(
    &self,
    partition_key: &str,
    flags:         PartitionFlags,
  ) -> Result<Option<PartitionEntity>> {
    let key = partition_key.to_owned();
    let raw: Option<RawPartition> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "UPDATE partition_entities SET
             is_active            = COALESCE(?2, is_active),
             caching_enabled      = COALESCE(?3, caching_enabled),
             auto_archive_enabled = COALESCE(?4, auto_archive_enabled)
           WHERE partition_key = ?1",
          rusqlite::params![
            key,
            flags.is_active,
            flags.caching_enabled,
            flags.auto_archive_enabled,
          ],
        )?;
        let updated = tx
          .query_row(
            &format!(
              "SELECT {PARTITION_COLUMNS} FROM partition_entities WHERE partition_key = ?1"
            ),
            rusqlite::params![key],
            RawPartition::from_row,
          )
          .optional()?;
        tx.commit()?;
        Ok(updated)
      })
      .await?;

    raw.map(RawPartition::into_entity).transpose()
  }

  async fn mark_partition_created(&self, partition_key: &str) -> Result<bool> {
    let key = partition_key.to_owned();
    let flipped = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE partition_entities SET partition_created = 1
           WHERE partition_key = ?1 AND partition_created = 0",
          rusqlite::params![key],
        )?)
      })
      .await?;
    Ok(flipped == 1)
  }

  // ── Archival ────────────────────────────────────────────────────────────

  async fn archive_partition_records(
    &self,
    partition_key: &str,
    archived_at:   DateTime<Utc>,
  ) -> Result<u64> {
    let key = partition_key.to_owned();
    let at  = encode_ts(archived_at);

    let moved = self
      .conn
      .call(move |conn| {
        // Dropping `tx` on any error rolls back both statements.
        let tx = conn.transaction()?;
        let copied = tx.execute(
          "INSERT INTO archived_records (
             owner_id, partition_key, item_id, stability_score,
             next_review_at, last_reviewed_at, subject, topic,
             archived_at, eligible_for_deletion
           )
           SELECT owner_id, partition_key, item_id, stability_score,
                  next_review_at, last_reviewed_at, subject, topic, ?2, 0
           FROM review_records WHERE partition_key = ?1",
          rusqlite::params![key, at],
        )?;
        tx.execute(
          "DELETE FROM review_records WHERE partition_key = ?1",
          rusqlite::params![key],
        )?;
        tx.execute(
          "INSERT INTO archived_partitions (partition_key, archived_at)
           VALUES (?1, ?2)
           ON CONFLICT (partition_key) DO NOTHING",
          rusqlite::params![key, at],
        )?;
        tx.commit()?;
        Ok(copied as u64)
      })
      .await?;
    Ok(moved)
  }

  async fn is_partition_archived(&self, partition_key: &str) -> Result<bool> {
    let key = partition_key.to_owned();
    let archived = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM archived_partitions WHERE partition_key = ?1",
              rusqlite::params![key],
              |_| Ok(()),
            )
            .optional()?
            .is_some(),
        )
      })
      .await?;
    Ok(archived)
  }

  async fn archived_records(
    &self,
    partition_key: &str,
    limit:         usize,
  ) -> Result<Vec<ArchivedRecord>> {
    let key       = partition_key.to_owned();
    let limit_val = limit as i64;
    let raws: Vec<RawArchived> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {ARCHIVED_COLUMNS} FROM archived_records
           WHERE partition_key = ?1
           ORDER BY archived_at DESC, owner_id, item_id
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![key, limit_val], RawArchived::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawArchived::into_archived).collect()
  }

  async fn record_archive_run(&self, run: ArchiveRun) -> Result<()> {
    let run_id     = encode_uuid(run.run_id);
    let state      = encode_run_state(run.state);
    let started    = encode_ts(run.started_at);
    let finished   = run.finished_at.map(encode_ts);
    let archived   = run.archived_records as i64;
    let purged     = run.purged_cache_keys as i64;

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO archive_runs (
             run_id, partition_key, state, archived_records,
             purged_cache_keys, started_at, finished_at, error
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          rusqlite::params![
            run_id,
            run.partition_key,
            state,
            archived,
            purged,
            started,
            finished,
            run.error,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn last_archive_run(&self, partition_key: &str) -> Result<Option<ArchiveRun>> {
    let key = partition_key.to_owned();
    let raw: Option<RawArchiveRun> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {RUN_COLUMNS} FROM archive_runs
                 WHERE partition_key = ?1
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT 1"
              ),
              rusqlite::params![key],
              RawArchiveRun::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawArchiveRun::into_run).transpose()
  }

  async fn partition_counts(&self, partition_key: &str) -> Result<PartitionCounts> {
    let key = partition_key.to_owned();
    let (active, archived, flagged): (i64, i64, i64) = self
      .conn
      .call(move |conn| {
        let active = conn.query_row(
          "SELECT COUNT(*) FROM review_records WHERE partition_key = ?1",
          rusqlite::params![key],
          |r| r.get(0),
        )?;
        let (archived, flagged) = conn.query_row(
          "SELECT COUNT(*), COALESCE(SUM(eligible_for_deletion), 0)
           FROM archived_records WHERE partition_key = ?1",
          rusqlite::params![key],
          |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((active, archived, flagged))
      })
      .await?;

    Ok(PartitionCounts {
      active_records:       active as u64,
      archived_records:     archived as u64,
      flagged_for_deletion: flagged as u64,
    })
  }

  async fn flag_expired_archives(&self, cutoff: DateTime<Utc>) -> Result<u64> {
    let cutoff_ms = encode_ts(cutoff);
    let flagged = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE archived_records SET eligible_for_deletion = 1
           WHERE eligible_for_deletion = 0 AND archived_at < ?1",
          rusqlite::params![cutoff_ms],
        )?)
      })
      .await?;
    Ok(flagged as u64)
  }

  async fn purge_flagged_archives(&self) -> Result<u64> {
    let purged = self
      .conn
      .call(|conn| {
        Ok(conn.execute(
          "DELETE FROM archived_records WHERE eligible_for_deletion = 1",
          [],
        )?)
      })
      .await?;
    Ok(purged as u64)
  }
}
