//! Deferred-sync registrations, kept next to the queue so a later process
//! (the `watch` loop) knows which tags to wake.

use chrono::Utc;
use rusqlite::params;

use super::QueueStore;
use crate::error::Result;

impl QueueStore {
  /// Register a tag; registering twice is a no-op.
  pub fn register_sync(&self, tag: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO sync_registrations (tag, registered_at) VALUES (?, ?)",
      params![tag, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  /// Tags waiting for a wake event, oldest registration first.
  pub fn registered_tags(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT tag FROM sync_registrations ORDER BY registered_at")?;
    let tags = stmt
      .query_map([], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(tags)
  }

  pub fn unregister_sync(&self, tag: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM sync_registrations WHERE tag = ?", params![tag])?;
    Ok(())
  }
}
