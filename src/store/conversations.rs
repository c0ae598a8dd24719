use sqlx::Row;

use super::{new_id, now_ms, ts, SqliteStore};
use crate::error::StoreError;
use crate::models::{Conversation, Message, MessageRole, NewMessage};

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        notebook_id: row.get("notebook_id"),
        title: row.get("title"),
        created_at: ts(row.get("created_at")),
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let role: String = row.get("role");
    let cited_json: String = row.get("cited_json");
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        seq: row.get("seq"),
        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
        text: row.get("text"),
        cited_chunk_ids: serde_json::from_str(&cited_json).unwrap_or_default(),
        created_at: ts(row.get("created_at")),
    }
}

impl SqliteStore {
    pub async fn create_conversation(
        &self,
        notebook_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        self.get_notebook(notebook_id).await?;
        let id = new_id();
        let now = now_ms();
        let title = match title.trim() {
            "" => "Untitled conversation",
            t => t,
        };
        sqlx::query(
            "INSERT INTO conversations (id, notebook_id, title, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(notebook_id)
        .bind(title)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, "conversation"))?;

        Ok(Conversation {
            id,
            notebook_id: notebook_id.to_string(),
            title: title.to_string(),
            created_at: ts(now),
        })
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", id))?;
        Ok(row_to_conversation(&row))
    }

    pub async fn list_conversations(
        &self,
        notebook_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE notebook_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(notebook_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_conversation).collect())
    }

    /// Full transcript in order.
    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.get_conversation(conversation_id).await?;
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// The last `limit` messages, oldest first.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Append messages to the end of a transcript in one transaction.
    /// Existing messages are never modified.
    pub async fn append_messages(
        &self,
        conversation_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<Message>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("conversation", conversation_id));
        }

        let last: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = now_ms();
        let mut stored = Vec::with_capacity(messages.len());
        for (i, message) in messages.iter().enumerate() {
            let seq = last + 1 + i as i64;
            let id = new_id();
            let cited_json =
                serde_json::to_string(&message.cited_chunk_ids).unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                r#"
                INSERT INTO messages (id, conversation_id, seq, role, text, cited_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(conversation_id)
            .bind(seq)
            .bind(message.role.as_str())
            .bind(&message.text)
            .bind(&cited_json)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write(e, "message"))?;

            stored.push(Message {
                id,
                conversation_id: conversation_id.to_string(),
                seq,
                role: message.role,
                text: message.text.clone(),
                cited_chunk_ids: message.cited_chunk_ids.clone(),
                created_at: ts(now),
            });
        }
        tx.commit().await?;
        Ok(stored)
    }
}
