//! Request queries: saves, lookups, and the conditional updates that give
//! the scheduler its exactly-once claim semantics.

use std::collections::HashSet;

use eyre::Result;
use rusqlite::{Connection, Row, params, params_from_iter};

use super::Store;
use crate::domain::{Request, RequestState};

/// Column list shared by every request SELECT.
const REQUEST_COLUMNS: &str = "id, user_id, channel_id, prompt, state, base_priority, votes, \
     calculated_priority, external_task_id, artifact_handle, duration_seconds, failure_reason, \
     retry_count, held_for_review, claimed_by, claimed_at, created_at, updated_at";

/// Map a SELECT row (in `REQUEST_COLUMNS` order) to a Request.
fn row_to_request(row: &Row) -> rusqlite::Result<Request> {
    let state_str: String = row.get(4)?;
    let state = RequestState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown request state: {}", state_str).into(),
        )
    })?;

    Ok(Request {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel_id: row.get(2)?,
        prompt: row.get(3)?,
        state,
        base_priority: row.get(5)?,
        votes: row.get::<_, i64>(6)? as u32,
        calculated_priority: row.get(7)?,
        external_task_id: row.get(8)?,
        artifact_handle: row.get(9)?,
        duration_seconds: row.get(10)?,
        failure_reason: row.get(11)?,
        retry_count: row.get::<_, i64>(12)? as u32,
        held_for_review: row.get::<_, i64>(13)? != 0,
        claimed_by: row.get(14)?,
        claimed_at: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

impl Store {
    /// Insert or replace a request row.
    pub(crate) fn insert_request_row(db: &Connection, request: &Request) -> Result<()> {
        db.execute(
            r#"
            INSERT OR REPLACE INTO requests
            (id, user_id, channel_id, prompt, state, base_priority, votes, calculated_priority,
             external_task_id, artifact_handle, duration_seconds, failure_reason, retry_count,
             held_for_review, claimed_by, claimed_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                request.id,
                request.user_id,
                request.channel_id,
                request.prompt,
                request.state.as_str(),
                request.base_priority,
                request.votes,
                request.calculated_priority,
                request.external_task_id,
                request.artifact_handle,
                request.duration_seconds,
                request.failure_reason,
                request.retry_count,
                request.held_for_review as i64,
                request.claimed_by,
                request.claimed_at,
                request.created_at,
                request.updated_at,
            ],
        )?;

        Ok(())
    }

    /// Save a request snapshot: index row plus journal entry.
    pub fn save_request(&mut self, request: &Request) -> Result<()> {
        Self::insert_request_row(&self.db, request)?;
        self.append_journal(request)?;
        Ok(())
    }

    /// Get a request by ID.
    pub fn get_request(&self, id: &str) -> Result<Option<Request>> {
        let sql = format!("SELECT {} FROM requests WHERE id = ?1", REQUEST_COLUMNS);
        let result = self.db.query_row(&sql, [id], row_to_request);

        match result {
            Ok(request) => Ok(Some(request)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a request by its provider task id.
    pub fn get_request_by_task_id(&self, task_id: &str) -> Result<Option<Request>> {
        let sql = format!(
            "SELECT {} FROM requests WHERE external_task_id = ?1 ORDER BY updated_at DESC LIMIT 1",
            REQUEST_COLUMNS
        );
        let result = self.db.query_row(&sql, [task_id], row_to_request);

        match result {
            Ok(request) => Ok(Some(request)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List requests, optionally filtered by state and/or channel.
    pub fn list_requests(&self, state: Option<RequestState>, channel_id: Option<&str>) -> Result<Vec<Request>> {
        let mut sql = format!("SELECT {} FROM requests", REQUEST_COLUMNS);
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(state) = state {
            clauses.push("state = ?");
            args.push(state.as_str().to_string());
        }
        if let Some(channel_id) = channel_id {
            clauses.push("channel_id = ?");
            args.push(channel_id.to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at");

        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }

        Ok(requests)
    }

    /// Top of the queue for a channel, ordered by calculated priority.
    pub fn list_queued(&self, channel_id: &str, limit: usize) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT {} FROM requests WHERE channel_id = ?1 AND state = 'queued' \
             ORDER BY calculated_priority DESC, created_at ASC LIMIT ?2",
            REQUEST_COLUMNS
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params![channel_id, limit as i64], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }

        Ok(requests)
    }

    /// Number of queued requests in a channel.
    pub fn count_queued(&self, channel_id: &str) -> Result<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM requests WHERE channel_id = ?1 AND state = 'queued'",
            [channel_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Estimated queue position for a newly admitted request.
    pub fn estimated_position(&self, channel_id: &str) -> Result<usize> {
        Ok(self.count_queued(channel_id)? + 1)
    }

    /// Atomically claim a queued request for a worker.
    ///
    /// This is the only queued -> generating edge. The conditional UPDATE
    /// guarantees exactly one winner when workers race; the loser gets
    /// `false` and simply moves on to its next candidate.
    pub fn claim_request(&mut self, id: &str, worker: &str, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE requests SET state = 'generating', claimed_by = ?2, claimed_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND state = 'queued'",
            params![id, worker, now],
        )?;

        if changed == 1 {
            self.journal_current(id)?;
            tracing::debug!(request.id = %id, worker = %worker, "Claimed request");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release a claim without penalty (breaker-open path). The request
    /// goes back to queued with its retry count untouched.
    pub fn release_claim(&mut self, id: &str, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE requests SET state = 'queued', claimed_by = NULL, claimed_at = NULL, updated_at = ?2 \
             WHERE id = ?1 AND state = 'generating'",
            params![id, now],
        )?;

        if changed == 1 {
            self.journal_current(id)?;
        }
        Ok(changed == 1)
    }

    /// Requeue a stuck request, counting the retry (reconciler path).
    pub fn requeue_stuck(&mut self, id: &str, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE requests SET state = 'queued', retry_count = retry_count + 1, \
             claimed_by = NULL, claimed_at = NULL, updated_at = ?2 \
             WHERE id = ?1 AND state = 'generating'",
            params![id, now],
        )?;

        if changed == 1 {
            self.journal_current(id)?;
        }
        Ok(changed == 1)
    }

    /// Terminally fail a generating request.
    pub fn fail_generating(&mut self, id: &str, reason: &str, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE requests SET state = 'failed', failure_reason = ?2, updated_at = ?3 \
             WHERE id = ?1 AND state = 'generating'",
            params![id, reason, now],
        )?;

        if changed == 1 {
            self.journal_current(id)?;
        }
        Ok(changed == 1)
    }

    /// Record the provider task id, first assignment only.
    ///
    /// Returns `false` when the id was already set (a duplicate submit or a
    /// race). The partial unique index rejects mapping one provider job to
    /// two live requests.
    pub fn set_external_task_id(&mut self, id: &str, task_id: &str, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE requests SET external_task_id = ?2, updated_at = ?3 \
             WHERE id = ?1 AND external_task_id IS NULL",
            params![id, task_id, now],
        )?;

        if changed == 1 {
            self.journal_current(id)?;
        }
        Ok(changed == 1)
    }

    /// Stamp a freshly computed priority score.
    pub fn update_calculated_priority(&mut self, id: &str, score: f64, now: i64) -> Result<()> {
        self.db.execute(
            "UPDATE requests SET calculated_priority = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, score, now],
        )?;
        Ok(())
    }

    /// Requests generating since before `cutoff_ms` — reconciler fodder.
    pub fn list_stuck_generating(&self, cutoff_ms: i64) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT {} FROM requests WHERE state = 'generating' AND claimed_at IS NOT NULL AND claimed_at <= ?1",
            REQUEST_COLUMNS
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([cutoff_ms], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }

        Ok(requests)
    }

    /// Users with a request currently in flight for this channel. One
    /// user never occupies two concurrent slots.
    pub fn active_users(&self, channel_id: &str) -> Result<HashSet<String>> {
        let mut stmt = self.db.prepare(
            "SELECT DISTINCT user_id FROM requests \
             WHERE channel_id = ?1 AND state IN ('generating', 'broadcasting')",
        )?;
        let rows = stmt.query_map([channel_id], |row| row.get::<_, String>(0))?;

        let mut users = HashSet::new();
        for row in rows {
            users.insert(row?);
        }

        Ok(users)
    }

    /// Users behind the most recent `n` plays in this channel, for the
    /// diversity constraint.
    pub fn recent_played_users(&self, channel_id: &str, n: usize) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare(
            "SELECT user_id FROM requests \
             WHERE channel_id = ?1 AND state IN ('ready', 'broadcasting', 'completed') \
             ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![channel_id, n as i64], |row| row.get::<_, String>(0))?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }

        Ok(users)
    }

    /// Apply a vote event: bump the request's upvotes (positive deltas
    /// only) and the owner's bounded reputation, in one transaction.
    pub fn apply_vote(&mut self, request_id: &str, delta: i32, rep_min: i32, rep_max: i32, now: i64) -> Result<bool> {
        let tx = self.db.transaction()?;

        let vote_add = delta.max(0);
        let changed = tx.execute(
            "UPDATE requests SET votes = votes + ?2, updated_at = ?3 WHERE id = ?1",
            params![request_id, vote_add, now],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE users SET reputation_score = MAX(?2, MIN(?3, reputation_score + ?4)) \
             WHERE id = (SELECT user_id FROM requests WHERE id = ?1)",
            params![request_id, rep_min, rep_max, delta],
        )?;

        tx.commit()?;
        self.journal_current(request_id)?;
        Ok(true)
    }

    /// Journal the current index row for a request (used after column-level
    /// conditional updates so the journal stays a faithful history).
    fn journal_current(&self, id: &str) -> Result<()> {
        if let Some(request) = self.get_request(id)? {
            self.append_journal(&request)?;
        }
        Ok(())
    }
}
