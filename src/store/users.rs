//! User and channel queries.
//!
//! Both tables are small and SQLite-only. The admission counter update is
//! a single statement so concurrent admission checks for the same user
//! cannot double-admit past the limit.

use eyre::Result;
use rusqlite::{Row, params};

use super::Store;
use crate::domain::{Channel, PriorityWeights, Tier, User};

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let tier_str: String = row.get(2)?;
    let tier = Tier::parse(&tier_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown tier: {}", tier_str).into(),
        )
    })?;

    Ok(User {
        id: row.get(0)?,
        reputation_score: row.get(1)?,
        tier,
        daily_request_count: row.get::<_, i64>(3)? as u32,
        last_request_date: row.get(4)?,
        last_request_at: row.get(5)?,
        timeout_until: row.get(6)?,
        lifetime_plays: row.get::<_, i64>(7)? as u64,
        disabled: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn row_to_channel(row: &Row) -> rusqlite::Result<Channel> {
    let weights_json: String = row.get(4)?;
    let weights: PriorityWeights = serde_json::from_str(&weights_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        max_queue_size: row.get::<_, i64>(2)? as u32,
        moderation_strict: row.get::<_, i64>(3)? != 0,
        weights,
        created_at: row.get(5)?,
    })
}

impl Store {
    /// Insert or replace a user.
    pub fn save_user(&mut self, user: &User) -> Result<()> {
        self.db.execute(
            r#"
            INSERT OR REPLACE INTO users
            (id, reputation_score, tier, daily_request_count, last_request_date,
             last_request_at, timeout_until, lifetime_plays, disabled, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                user.id,
                user.reputation_score,
                user.tier.as_str(),
                user.daily_request_count,
                user.last_request_date,
                user.last_request_at,
                user.timeout_until,
                user.lifetime_plays as i64,
                user.disabled as i64,
                user.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get a user by ID.
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let result = self.db.query_row(
            "SELECT id, reputation_score, tier, daily_request_count, last_request_date, \
             last_request_at, timeout_until, lifetime_plays, disabled, created_at \
             FROM users WHERE id = ?1",
            [id],
            row_to_user,
        );

        match result {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a user, creating a default free-tier record on first contact.
    pub fn get_or_create_user(&mut self, id: &str) -> Result<User> {
        if let Some(user) = self.get_user(id)? {
            return Ok(user);
        }

        let user = User::new(id);
        self.save_user(&user)?;
        Ok(user)
    }

    /// Record an admitted submission: one atomic statement that rolls the
    /// daily counter over on a date change and stamps the cooldown clock.
    pub fn record_admission(&mut self, user_id: &str, today: &str, now: i64) -> Result<()> {
        self.db.execute(
            "UPDATE users SET \
             daily_request_count = CASE WHEN last_request_date = ?2 THEN daily_request_count + 1 ELSE 1 END, \
             last_request_date = ?2, \
             last_request_at = ?3 \
             WHERE id = ?1",
            params![user_id, today, now],
        )?;
        Ok(())
    }

    /// Count one more lifetime play for a user (ready transition).
    pub fn increment_lifetime_plays(&mut self, user_id: &str) -> Result<()> {
        self.db.execute(
            "UPDATE users SET lifetime_plays = lifetime_plays + 1 WHERE id = ?1",
            [user_id],
        )?;
        Ok(())
    }

    /// Insert or replace a channel.
    pub fn save_channel(&mut self, channel: &Channel) -> Result<()> {
        let weights_json = serde_json::to_string(&channel.weights)?;
        self.db.execute(
            r#"
            INSERT OR REPLACE INTO channels
            (id, name, max_queue_size, moderation_strict, weights_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                channel.id,
                channel.name,
                channel.max_queue_size,
                channel.moderation_strict as i64,
                weights_json,
                channel.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get a channel by ID.
    pub fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        let result = self.db.query_row(
            "SELECT id, name, max_queue_size, moderation_strict, weights_json, created_at \
             FROM channels WHERE id = ?1",
            [id],
            row_to_channel,
        );

        match result {
            Ok(channel) => Ok(Some(channel)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List all channels.
    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self.db.prepare(
            "SELECT id, name, max_queue_size, moderation_strict, weights_json, created_at \
             FROM channels ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }

        Ok(channels)
    }
}
