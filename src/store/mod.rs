//! Storage layer for Spinq.
//!
//! Persistence uses a dual-storage approach:
//! - **JSONL journal**: append-only log of request snapshots, replayed on
//!   startup when it is ahead of the index
//! - **SQLite database**: the query index, and the arbiter for the
//!   conditional updates that need to be atomic (claims, task-id
//!   assignment, daily counters)
//!
//! The claim path is a single conditional `UPDATE ... WHERE state =
//! 'queued'`; exactly one racing worker observes a changed row. Users and
//! channels are small and SQLite-only.
//!
//! # Example
//!
//! ```ignore
//! use spinq::store::Store;
//! use spinq::domain::{Channel, Request};
//!
//! let mut store = Store::open_at(Path::new("/tmp/spinq"))?;
//! store.save_channel(&Channel::new("chan-1", "Lofi"))?;
//! store.save_request(&Request::new("user-1", "chan-1", "rainy lofi", 50))?;
//! let queued = store.list_queued("chan-1", 10)?;
//! ```

mod requests;
mod users;

use eyre::{Context, Result};
use rusqlite::Connection;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::domain::Request;

/// Store manages requests, users, and channels with JSONL journaling for
/// requests and SQLite indexing for everything.
pub struct Store {
    /// Base directory for this deployment's data
    base_dir: PathBuf,

    /// Path to the request journal
    journal_path: PathBuf,

    /// SQLite connection
    pub(crate) db: Connection,
}

impl Store {
    /// Open or create a Store under the default data directory
    /// (`~/.local/share/spinq`).
    pub fn open() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| eyre::eyre!("Cannot determine data directory"))?
            .join("spinq");
        Self::open_at(&data_dir)
    }

    /// Open or create a Store at the specified directory.
    ///
    /// Useful for testing with custom paths.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        let store_dir = base_dir.join("store");
        fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create store directory: {}", store_dir.display()))?;

        let journal_path = store_dir.join("requests.jsonl");
        let db_path = store_dir.join("spinq.db");

        let db = Connection::open(&db_path)
            .with_context(|| format!("Failed to open SQLite database: {}", db_path.display()))?;

        Self::init_schema(&db)?;

        let mut store = Self {
            base_dir: base_dir.to_path_buf(),
            journal_path,
            db,
        };

        store.rebuild_index_if_needed()?;

        Ok(store)
    }

    /// Initialize the SQLite schema.
    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                prompt TEXT NOT NULL,
                state TEXT NOT NULL,
                base_priority INTEGER NOT NULL,
                votes INTEGER NOT NULL,
                calculated_priority REAL NOT NULL,
                external_task_id TEXT,
                artifact_handle TEXT,
                duration_seconds REAL,
                failure_reason TEXT,
                retry_count INTEGER NOT NULL,
                held_for_review INTEGER NOT NULL,
                claimed_by TEXT,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_state ON requests(state);
            CREATE INDEX IF NOT EXISTS idx_requests_channel_state ON requests(channel_id, state);
            CREATE INDEX IF NOT EXISTS idx_requests_user ON requests(user_id);
            CREATE INDEX IF NOT EXISTS idx_requests_updated ON requests(updated_at);

            -- One provider job maps to at most one live request. Failed
            -- requests leave the index so a task id can be re-reported
            -- against a fresh submission.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_task_unique
                ON requests(external_task_id)
                WHERE external_task_id IS NOT NULL AND state != 'failed';

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                reputation_score INTEGER NOT NULL,
                tier TEXT NOT NULL,
                daily_request_count INTEGER NOT NULL,
                last_request_date TEXT,
                last_request_at INTEGER,
                timeout_until INTEGER,
                lifetime_plays INTEGER NOT NULL,
                disabled INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                max_queue_size INTEGER NOT NULL,
                moderation_strict INTEGER NOT NULL,
                weights_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Append a request snapshot to the journal.
    pub(crate) fn append_journal(&self, request: &Request) -> Result<()> {
        let json = serde_json::to_string(request)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Rebuild the SQLite request index from the journal if needed.
    fn rebuild_index_if_needed(&mut self) -> Result<()> {
        if !self.journal_path.exists() {
            return Ok(());
        }

        let journal_lines = self.count_journal_lines()?;
        let db_count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))
            .unwrap_or(0);

        // If the journal has entries the index never saw, replay it
        if journal_lines as i64 > db_count || db_count == 0 {
            self.rebuild_index()?;
        }

        Ok(())
    }

    /// Count lines in the journal file.
    fn count_journal_lines(&self) -> Result<usize> {
        let file = File::open(&self.journal_path)?;
        let reader = BufReader::new(file);
        Ok(reader.lines().count())
    }

    /// Rebuild the request index from the journal, last write wins.
    fn rebuild_index(&mut self) -> Result<()> {
        self.db.execute("DELETE FROM requests", [])?;

        if !self.journal_path.exists() {
            return Ok(());
        }

        let file = File::open(&self.journal_path)?;
        let reader = BufReader::new(file);

        let mut records: std::collections::HashMap<String, Request> = std::collections::HashMap::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record: Request = serde_json::from_str(&line).context("Failed to parse journal line")?;
            records.insert(record.id.clone(), record);
        }

        let tx = self.db.transaction()?;
        for record in records.values() {
            Self::insert_request_row(&tx, record)?;
        }
        tx.commit()?;

        tracing::info!(requests = records.len(), "Rebuilt request index from journal");

        Ok(())
    }

    /// Get the base directory for this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Channel, Request, RequestState};
    use tempfile::TempDir;

    fn create_temp_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_open_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let _store = Store::open_at(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join("store").exists());
        assert!(temp_dir.path().join("store/spinq.db").exists());
    }

    #[test]
    fn test_journal_persistence() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut store = Store::open_at(temp_dir.path()).unwrap();
            let request = Request::new("user-1", "chan-1", "persistent prompt", 50);
            store.save_request(&request).unwrap();
        }

        {
            let store = Store::open_at(temp_dir.path()).unwrap();
            let all = store.list_requests(None, None).unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].prompt, "persistent prompt");
        }
    }

    #[test]
    fn test_rebuild_index_from_journal() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut store = Store::open_at(temp_dir.path()).unwrap();
            store.save_request(&Request::new("user-1", "chan-1", "one", 50)).unwrap();
            store.save_request(&Request::new("user-2", "chan-1", "two", 50)).unwrap();
        }

        // Delete the SQLite file to force a rebuild
        let db_path = temp_dir.path().join("store/spinq.db");
        fs::remove_file(&db_path).unwrap();

        {
            let store = Store::open_at(temp_dir.path()).unwrap();
            let all = store.list_requests(None, None).unwrap();
            assert_eq!(all.len(), 2);
        }
    }

    #[test]
    fn test_rebuild_keeps_latest_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let id;

        {
            let mut store = Store::open_at(temp_dir.path()).unwrap();
            let mut request = Request::new("user-1", "chan-1", "prompt", 50);
            id = request.id.clone();
            store.save_request(&request).unwrap();

            request.state = RequestState::Moderating;
            store.save_request(&request).unwrap();
        }

        let db_path = temp_dir.path().join("store/spinq.db");
        fs::remove_file(&db_path).unwrap();

        {
            let store = Store::open_at(temp_dir.path()).unwrap();
            let loaded = store.get_request(&id).unwrap().unwrap();
            assert_eq!(loaded.state, RequestState::Moderating);
        }
    }

    #[test]
    fn test_channels_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut store = Store::open_at(temp_dir.path()).unwrap();
            store.save_channel(&Channel::new("chan-1", "Lofi")).unwrap();
        }

        {
            let store = Store::open_at(temp_dir.path()).unwrap();
            let chan = store.get_channel("chan-1").unwrap().unwrap();
            assert_eq!(chan.name, "Lofi");
        }
    }

    #[test]
    fn test_base_dir() {
        let (store, temp) = create_temp_store();
        assert_eq!(store.base_dir(), temp.path());
    }
}
