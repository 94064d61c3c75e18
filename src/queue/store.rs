use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::schema::{MIGRATIONS, SCHEMA_VERSION};
use super::{Payload, PendingSubmission};
use crate::error::{OfflineError, Result};

/// Handle to the durable queue.
///
/// Open it once and pass it to whoever needs the queue; every operation runs
/// in its own short transaction.
pub struct QueueStore {
  conn: Mutex<Connection>,
}

impl QueueStore {
  /// Open (creating if needed) the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        OfflineError::StorageUnavailable(format!(
          "Failed to create queue directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      OfflineError::StorageUnavailable(format!(
        "Failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::init(conn)
  }

  /// Open a throwaway in-memory queue.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(mut conn: Connection) -> Result<Self> {
    // Another process (e.g. `watch`) may hold a write lock briefly.
    conn.busy_timeout(Duration::from_secs(5))?;
    run_migrations(&mut conn)?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub(super) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| OfflineError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Persist a new submission and return its id.
  pub fn enqueue(&self, payload: &Payload, auth_token: &str) -> Result<i64> {
    let conn = self.lock()?;
    let data = serde_json::to_string(payload)?;
    let captured_at = Utc::now().to_rfc3339();

    conn.execute(
      "INSERT INTO unsynced_reports (payload, auth_token, captured_at) VALUES (?, ?, ?)",
      params![data, auth_token, captured_at],
    )?;

    let id = conn.last_insert_rowid();
    debug!(id, "Queued submission");
    Ok(id)
  }

  /// Every queued submission, oldest first.
  ///
  /// Rows that cannot be decoded are moved to the quarantine table so they
  /// stop counting as pending.
  pub fn list_all(&self) -> Result<Vec<PendingSubmission>> {
    let mut conn = self.lock()?;

    let rows = {
      let mut stmt = conn.prepare(
        "SELECT id, payload, auth_token, captured_at FROM unsynced_reports ORDER BY id",
      )?;
      let rows = stmt
        .query_map([], |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
          ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
      rows
    };

    let mut entries = Vec::with_capacity(rows.len());
    let mut unreadable = Vec::new();
    for (id, payload, auth_token, captured_at) in rows {
      match decode_row(&payload, &captured_at) {
        Ok((payload, captured_at)) => entries.push(PendingSubmission {
          id,
          payload,
          auth_token,
          captured_at,
        }),
        Err(e) => {
          warn!(id, error = %e, "Quarantining unreadable queue entry");
          unreadable.push((id, e.to_string()));
        }
      }
    }

    if !unreadable.is_empty() {
      let tx = conn.transaction()?;
      let now = Utc::now().to_rfc3339();
      for (id, reason) in &unreadable {
        tx.execute(
          "INSERT OR REPLACE INTO quarantined_reports
             (id, payload, auth_token, captured_at, reason, quarantined_at)
           SELECT id, payload, auth_token, captured_at, ?, ? FROM unsynced_reports WHERE id = ?",
          params![reason, now, id],
        )?;
        tx.execute("DELETE FROM unsynced_reports WHERE id = ?", params![id])?;
      }
      tx.commit()?;
    }

    Ok(entries)
  }

  /// Number of entries moved aside because they could not be decoded.
  pub fn quarantined_len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM quarantined_reports", [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }

  /// Delete a submission. Removing an id that is not queued is not an error.
  pub fn remove(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM unsynced_reports WHERE id = ?", params![id])?;
    debug!(id, removed, "Removed submission");
    Ok(())
  }

  /// Number of queued submissions.
  pub fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM unsynced_reports", [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }
}

fn decode_row(payload: &str, captured_at: &str) -> Result<(Payload, DateTime<Utc>)> {
  let payload: Payload = serde_json::from_str(payload)?;
  let captured_at = DateTime::parse_from_rfc3339(captured_at)
    .map_err(|e| {
      OfflineError::StorageUnavailable(format!("Bad timestamp '{}': {}", captured_at, e))
    })?
    .with_timezone(&Utc);
  Ok((payload, captured_at))
}

/// Bring the schema up to `SCHEMA_VERSION`. A store already at that version
/// is left untouched.
fn run_migrations(conn: &mut Connection) -> Result<()> {
  let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  if version >= SCHEMA_VERSION {
    return Ok(());
  }

  let tx = conn.transaction()?;
  for migration in MIGRATIONS.iter().skip(version.max(0) as usize) {
    tx.execute_batch(migration)?;
  }
  tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
  tx.commit()?;

  debug!(from = version, to = SCHEMA_VERSION, "Upgraded queue schema");
  Ok(())
}
