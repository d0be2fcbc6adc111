//! [`TaskQueue`] implementation on the live store's `tasks` table.
//!
//! Popping is a select-then-delete inside one transaction: a popped task is
//! gone for good, so a job that starts always runs to completion or failure
//! and is never re-delivered.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tally_core::{
  store::TaskQueue,
  task::{NewTask, TaskEnvelope},
};

use crate::{
  Result,
  encode::{RawTask, encode_dt, encode_priority, encode_uuid},
  store::SqliteStore,
};

impl TaskQueue for SqliteStore {
  type Error = crate::Error;

  async fn enqueue(&self, task: NewTask) -> Result<TaskEnvelope> {
    let envelope = TaskEnvelope {
      task_id:  Uuid::new_v4(),
      run_at:   task.run_at,
      priority: task.priority,
      task:     task.task,
    };

    let id_str       = encode_uuid(envelope.task_id);
    let kind         = envelope.task.discriminant().to_owned();
    let payload      = serde_json::to_string(&envelope.task)?;
    let priority_val = encode_priority(envelope.priority);
    let run_at_str   = encode_dt(envelope.run_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO tasks (task_id, task_kind, payload, priority, run_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id_str, kind, payload, priority_val, run_at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(envelope)
  }

  async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<TaskEnvelope>> {
    let now_str = encode_dt(now);

    let raw: Option<RawTask> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let raw: Option<RawTask> = {
          let mut stmt = tx.prepare(
            "SELECT task_id, payload, priority, run_at FROM tasks
             WHERE run_at <= ?1
             ORDER BY priority DESC, run_at ASC
             LIMIT 1",
          )?;
          let mut rows = stmt.query_map(rusqlite::params![now_str], |row| {
            Ok(RawTask {
              task_id:  row.get(0)?,
              payload:  row.get(1)?,
              priority: row.get(2)?,
              run_at:   row.get(3)?,
            })
          })?;
          rows.next().transpose()?
        };

        if let Some(raw) = &raw {
          tx.execute(
            "DELETE FROM tasks WHERE task_id = ?1",
            rusqlite::params![raw.task_id],
          )?;
        }

        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.map(RawTask::into_envelope).transpose()
  }

  async fn pending_tasks(&self) -> Result<Vec<TaskEnvelope>> {
    let raws: Vec<RawTask> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT task_id, payload, priority, run_at FROM tasks
           ORDER BY priority DESC, run_at ASC",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawTask {
              task_id:  row.get(0)?,
              payload:  row.get(1)?,
              priority: row.get(2)?,
              run_at:   row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawTask::into_envelope).collect()
  }
}
