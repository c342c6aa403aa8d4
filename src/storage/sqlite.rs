//! Durable storage backend on SQLite via `sqlx`.
//!
//! `init()` creates the schema idempotently; restarts keep sessions, cached
//! messages, and device tokens, which is what makes boot-time redelivery
//! recovery meaningful.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{
    CachedMessage, CleanupCounts, DeviceToken, SessionPatch, SessionRecord, Storage, StorageError,
    StorageResult,
};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (or creates) the database file and a small connection pool.
    pub async fn connect(path: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database {path}"))?;
        Ok(Self { pool })
    }

    fn session_from_row(row: &SqliteRow) -> SessionRecord {
        let notifier: Option<String> = row.get("notifier");
        SessionRecord {
            session_name: row.get("sessionName"),
            password: row.get("password"),
            secret_key: row.get("secretKey"),
            retry_interval: row.get::<i64, _>("retryInterval") as u64,
            max_retry_limit: row.get::<i64, _>("maxRetryLimit") as u32,
            message_expiry_time: row
                .get::<Option<i64>, _>("messageExpiryTime")
                .map(|v| v as u64),
            session_expiry: row.get::<Option<i64>, _>("sessionExpiry").map(|v| v as u64),
            suspended: row.get::<i64, _>("suspended") != 0,
            notifier: notifier.and_then(|raw| serde_json::from_str(&raw).ok()),
        }
    }

    fn message_from_row(row: &SqliteRow) -> CachedMessage {
        CachedMessage {
            message_id: row.get("messageId"),
            session_name: row.get("sessionName"),
            topic: row.get("topic"),
            data: row.get("data"),
            hash: row.get("hash"),
            timestamp: row.get::<i64, _>("timestamp") as u64,
            frame_type: row.get("type"),
            published_at: row.get::<i64, _>("publishedAt") as u64,
            retry_count: row.get::<i64, _>("retryCount") as u32,
            expiry_time: row.get::<Option<i64>, _>("expiryTime").map(|v| v as u64),
            max_retry_limit: row.get::<i64, _>("maxRetryLimit") as u32,
            retry_interval: row.get::<i64, _>("retryInterval") as u64,
        }
    }

    fn token_from_row(row: &SqliteRow) -> DeviceToken {
        DeviceToken {
            session_name: row.get("sessionName"),
            user_id: row.get("userId"),
            device_id: row.get("deviceId"),
            token: row.get("token"),
            platform: row.get("platform"),
            created_at: row.get::<i64, _>("createdAt") as u64,
            updated_at: row.get::<i64, _>("updatedAt") as u64,
        }
    }
}

fn backend_err(err: sqlx::Error, what: &str) -> StorageError {
    StorageError::Backend(anyhow::Error::new(err).context(what.to_string()))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> StorageResult<()> {
        // raw_sql: the schema is several statements in one batch.
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                sessionName       TEXT PRIMARY KEY,
                password          TEXT NOT NULL,
                secretKey         TEXT NOT NULL,
                retryInterval     INTEGER NOT NULL,
                maxRetryLimit     INTEGER NOT NULL,
                messageExpiryTime INTEGER,
                sessionExpiry     INTEGER,
                suspended         INTEGER NOT NULL DEFAULT 0,
                notifier          TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                messageId     TEXT PRIMARY KEY,
                sessionName   TEXT NOT NULL,
                topic         TEXT NOT NULL,
                data          TEXT NOT NULL,
                hash          TEXT NOT NULL,
                timestamp     INTEGER NOT NULL,
                type          TEXT NOT NULL,
                publishedAt   INTEGER NOT NULL,
                retryCount    INTEGER NOT NULL,
                expiryTime    INTEGER,
                maxRetryLimit INTEGER NOT NULL,
                retryInterval INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (sessionName);
            CREATE TABLE IF NOT EXISTS device_tokens (
                sessionName TEXT NOT NULL,
                userId      TEXT NOT NULL,
                deviceId    TEXT NOT NULL,
                token       TEXT NOT NULL,
                platform    TEXT NOT NULL,
                createdAt   INTEGER NOT NULL,
                updatedAt   INTEGER NOT NULL,
                PRIMARY KEY (sessionName, userId, deviceId)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err(e, "creating schema"))?;
        Ok(())
    }

    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()> {
        let notifier = session
            .notifier
            .as_ref()
            .map(|v| v.to_string());
        let result = sqlx::query(
            r#"
            INSERT INTO sessions
                (sessionName, password, secretKey, retryInterval, maxRetryLimit,
                 messageExpiryTime, sessionExpiry, suspended, notifier)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_name)
        .bind(&session.password)
        .bind(&session.secret_key)
        .bind(session.retry_interval as i64)
        .bind(session.max_retry_limit as i64)
        .bind(session.message_expiry_time.map(|v| v as i64))
        .bind(session.session_expiry.map(|v| v as i64))
        .bind(session.suspended as i64)
        .bind(notifier)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                Err(StorageError::AlreadyExists(session.session_name.clone()))
            }
            Err(e) => Err(backend_err(e, "inserting session")),
        }
    }

    async fn get_session(&self, name: &str) -> StorageResult<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE sessionName = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend_err(e, "loading session"))?;
        Ok(row.as_ref().map(Self::session_from_row))
    }

    async fn update_session(&self, name: &str, patch: SessionPatch) -> StorageResult<()> {
        let current = self
            .get_session(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;

        let suspended = patch.suspended.unwrap_or(current.suspended);
        let session_expiry = patch.session_expiry.unwrap_or(current.session_expiry);
        let notifier = patch
            .notifier
            .unwrap_or(current.notifier)
            .map(|v| v.to_string());

        sqlx::query(
            "UPDATE sessions SET suspended = ?, sessionExpiry = ?, notifier = ? WHERE sessionName = ?",
        )
        .bind(suspended as i64)
        .bind(session_expiry.map(|v| v as i64))
        .bind(notifier)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err(e, "updating session"))?;
        Ok(())
    }

    async fn delete_session(&self, name: &str) -> StorageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err(e, "starting delete transaction"))?;
        for sql in [
            "DELETE FROM messages WHERE sessionName = ?",
            "DELETE FROM device_tokens WHERE sessionName = ?",
            "DELETE FROM sessions WHERE sessionName = ?",
        ] {
            sqlx::query(sql)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| backend_err(e, "deleting session"))?;
        }
        tx.commit()
            .await
            .map_err(|e| backend_err(e, "committing delete"))?;
        Ok(())
    }

    async fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend_err(e, "listing sessions"))?;
        Ok(rows.iter().map(Self::session_from_row).collect())
    }

    async fn save_message(&self, message: &CachedMessage) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (messageId, sessionName, topic, data, hash, timestamp, type,
                 publishedAt, retryCount, expiryTime, maxRetryLimit, retryInterval)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(messageId) DO UPDATE SET
                sessionName = excluded.sessionName,
                topic = excluded.topic,
                data = excluded.data,
                hash = excluded.hash,
                timestamp = excluded.timestamp,
                type = excluded.type,
                publishedAt = excluded.publishedAt,
                retryCount = excluded.retryCount,
                expiryTime = excluded.expiryTime,
                maxRetryLimit = excluded.maxRetryLimit,
                retryInterval = excluded.retryInterval
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.session_name)
        .bind(&message.topic)
        .bind(&message.data)
        .bind(&message.hash)
        .bind(message.timestamp as i64)
        .bind(&message.frame_type)
        .bind(message.published_at as i64)
        .bind(message.retry_count as i64)
        .bind(message.expiry_time.map(|v| v as i64))
        .bind(message.max_retry_limit as i64)
        .bind(message.retry_interval as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err(e, "saving message"))?;
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> StorageResult<Option<CachedMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE messageId = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend_err(e, "loading message"))?;
        Ok(row.as_ref().map(Self::message_from_row))
    }

    async fn remove_message(&self, message_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM messages WHERE messageId = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| backend_err(e, "removing message"))?;
        Ok(())
    }

    async fn list_pending_messages(&self, session: &str) -> StorageResult<Vec<CachedMessage>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE sessionName = ?")
            .bind(session)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend_err(e, "listing pending messages"))?;
        Ok(rows.iter().map(Self::message_from_row).collect())
    }

    async fn cleanup_expired(&self, now_ms: u64) -> StorageResult<CleanupCounts> {
        let mut counts = CleanupCounts::default();

        let expired: Vec<String> =
            sqlx::query("SELECT sessionName FROM sessions WHERE sessionExpiry IS NOT NULL AND sessionExpiry < ?")
                .bind(now_ms as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| backend_err(e, "listing expired sessions"))?
                .iter()
                .map(|row| row.get("sessionName"))
                .collect();
        for name in &expired {
            self.delete_session(name).await?;
        }
        counts.sessions = expired.len() as u64;

        let result =
            sqlx::query("DELETE FROM messages WHERE expiryTime IS NOT NULL AND expiryTime < ?")
                .bind(now_ms as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| backend_err(e, "deleting expired messages"))?;
        counts.messages = result.rows_affected();

        Ok(counts)
    }

    async fn save_device_token(&self, token: &DeviceToken) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_tokens
                (sessionName, userId, deviceId, token, platform, createdAt, updatedAt)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(sessionName, userId, deviceId) DO UPDATE SET
                token = excluded.token,
                platform = excluded.platform,
                updatedAt = excluded.updatedAt
            "#,
        )
        .bind(&token.session_name)
        .bind(&token.user_id)
        .bind(&token.device_id)
        .bind(&token.token)
        .bind(&token.platform)
        .bind(token.created_at as i64)
        .bind(token.updated_at as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err(e, "saving device token"))?;
        Ok(())
    }

    async fn get_device_tokens(&self, session: &str) -> StorageResult<Vec<DeviceToken>> {
        let rows = sqlx::query("SELECT * FROM device_tokens WHERE sessionName = ?")
            .bind(session)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend_err(e, "listing device tokens"))?;
        Ok(rows.iter().map(Self::token_from_row).collect())
    }

    async fn delete_device_token(
        &self,
        session: &str,
        user_id: &str,
        device_id: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "DELETE FROM device_tokens WHERE sessionName = ? AND userId = ? AND deviceId = ?",
        )
        .bind(session)
        .bind(user_id)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err(e, "deleting device token"))?;
        Ok(())
    }
}
