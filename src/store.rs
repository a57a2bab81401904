//! SQLite-backed conversation history and bargain counters.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::traits::{ConversationKey, ConversationStore, Role, Turn};

pub struct SqliteContextStore {
    pool: SqlitePool,
    max_history: usize,
}

impl SqliteContextStore {
    pub async fn new(db_path: &str, max_history: usize) -> anyhow::Result<Self> {
        if let Some(dir) = std::path::Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool, max_history };
        store.init_schema().await?;
        tracing::info!(db_path, "conversation store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_item ON messages (user_id, item_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_timestamp ON messages (timestamp)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bargain_counts (
                user_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                count INTEGER DEFAULT 0,
                last_updated TEXT NOT NULL,
                PRIMARY KEY (user_id, item_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete turns older than `days_to_keep` plus bargain rows whose
    /// conversation no longer has any messages.
    pub async fn clear_history(&self, days_to_keep: i64) -> anyhow::Result<u64> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days_to_keep)).to_rfc3339();

        let deleted = sqlx::query("DELETE FROM messages WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let orphaned = sqlx::query(
            "DELETE FROM bargain_counts
             WHERE NOT EXISTS (
                 SELECT 1 FROM messages
                 WHERE messages.user_id = bargain_counts.user_id
                   AND messages.item_id = bargain_counts.item_id
             )",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 || orphaned > 0 {
            tracing::info!(deleted, orphaned, "cleared old conversation history");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ConversationStore for SqliteContextStore {
    async fn append(&self, key: &ConversationKey, role: Role, text: &str) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO messages (user_id, item_id, role, content, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&key.user_id)
        .bind(&key.item_id)
        .bind(role.as_str())
        .bind(text)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        // Trim to max_history per conversation: find the oldest row to keep
        // and delete everything before it.
        let oldest_to_keep = sqlx::query(
            "SELECT id FROM messages
             WHERE user_id = ? AND item_id = ?
             ORDER BY id DESC
             LIMIT 1 OFFSET ?",
        )
        .bind(&key.user_id)
        .bind(&key.item_id)
        .bind(self.max_history as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = oldest_to_keep {
            let boundary: i64 = row.get("id");
            sqlx::query("DELETE FROM messages WHERE user_id = ? AND item_id = ? AND id <= ?")
                .bind(&key.user_id)
                .bind(&key.item_id)
                .bind(boundary)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn context(&self, key: &ConversationKey, limit: usize) -> anyhow::Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT role, content FROM messages
             WHERE user_id = ? AND item_id = ?
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(&key.user_id)
        .bind(&key.item_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut turns: Vec<Turn> = rows
            .iter()
            .map(|row| Turn {
                role: Role::parse(row.get::<String, _>("role").as_str()),
                content: row.get("content"),
            })
            .collect();

        let bargains = self.bargain_count(key).await?;
        if bargains > 0 {
            turns.push(Turn {
                role: Role::System,
                content: format!("议价次数: {}", bargains),
            });
        }

        Ok(turns)
    }

    async fn bargain_count(&self, key: &ConversationKey) -> anyhow::Result<u32> {
        let row = sqlx::query(
            "SELECT count FROM bargain_counts WHERE user_id = ? AND item_id = ?",
        )
        .bind(&key.user_id)
        .bind(&key.item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("count") as u32).unwrap_or(0))
    }

    async fn increment_bargain(&self, key: &ConversationKey) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO bargain_counts (user_id, item_id, count, last_updated)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(user_id, item_id)
             DO UPDATE SET count = count + 1, last_updated = ?",
        )
        .bind(&key.user_id)
        .bind(&key.item_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(max_history: usize) -> (SqliteContextStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let store = SqliteContextStore::new(path.to_str().unwrap(), max_history)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn append_and_fetch_ordered_context() {
        let (store, _dir) = store(100).await;
        let key = ConversationKey::new("u1", "i1");

        store.append(&key, Role::User, "多少钱").await.unwrap();
        store.append(&key, Role::Assistant, "120元").await.unwrap();

        let turns = store.context(&key, 50).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "多少钱");
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn conversations_are_isolated_by_key() {
        let (store, _dir) = store(100).await;
        let a = ConversationKey::new("u1", "i1");
        let b = ConversationKey::new("u1", "i2");

        store.append(&a, Role::User, "a").await.unwrap();
        store.append(&b, Role::User, "b").await.unwrap();

        let turns = store.context(&a, 50).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "a");
    }

    #[tokio::test]
    async fn history_is_trimmed_per_conversation() {
        let (store, _dir) = store(5).await;
        let key = ConversationKey::new("u1", "i1");

        for n in 0..12 {
            store
                .append(&key, Role::User, &format!("msg-{}", n))
                .await
                .unwrap();
        }

        let turns = store.context(&key, 50).await.unwrap();
        assert_eq!(turns.len(), 5);
        assert_eq!(turns[0].content, "msg-7");
        assert_eq!(turns[4].content, "msg-11");
    }

    #[tokio::test]
    async fn bargain_count_upserts_and_shows_in_context() {
        let (store, _dir) = store(100).await;
        let key = ConversationKey::new("u1", "i1");

        assert_eq!(store.bargain_count(&key).await.unwrap(), 0);
        store.increment_bargain(&key).await.unwrap();
        store.increment_bargain(&key).await.unwrap();
        assert_eq!(store.bargain_count(&key).await.unwrap(), 2);

        store.append(&key, Role::User, "能便宜点吗").await.unwrap();
        let turns = store.context(&key, 50).await.unwrap();
        let last = turns.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert_eq!(last.content, "议价次数: 2");
    }

    #[tokio::test]
    async fn clear_history_removes_orphaned_bargains() {
        let (store, _dir) = store(100).await;
        let key = ConversationKey::new("u1", "i1");
        store.increment_bargain(&key).await.unwrap();

        // No messages exist for the key, so the bargain row is orphaned.
        store.clear_history(30).await.unwrap();
        assert_eq!(store.bargain_count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_history_keeps_recent_turns() {
        let (store, _dir) = store(100).await;
        let key = ConversationKey::new("u1", "i1");
        store.append(&key, Role::User, "recent").await.unwrap();

        let deleted = store.clear_history(30).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.context(&key, 50).await.unwrap().len(), 1);
    }
}
