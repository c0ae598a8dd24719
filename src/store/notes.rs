use sqlx::Row;

use super::{new_id, now_ms, ts, SqliteStore};
use crate::error::StoreError;
use crate::models::{AuthorKind, Note};

/// Fields of a note to be created.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub notebook_id: String,
    pub title: Option<String>,
    pub text: String,
    pub author: AuthorKind,
    pub source_id: Option<String>,
}

fn row_to_note(row: &sqlx::sqlite::SqliteRow) -> Note {
    let author: String = row.get("author");
    Note {
        id: row.get("id"),
        notebook_id: row.get("notebook_id"),
        title: row.get("title"),
        text: row.get("text"),
        author: AuthorKind::parse(&author).unwrap_or(AuthorKind::Human),
        source_id: row.get("source_id"),
        created_at: ts(row.get("created_at")),
    }
}

impl SqliteStore {
    pub async fn create_note(&self, note: NewNote) -> Result<Note, StoreError> {
        if note.text.trim().is_empty() {
            return Err(StoreError::ConstraintViolation(
                "note text must not be empty".to_string(),
            ));
        }
        self.get_notebook(&note.notebook_id).await?;
        if let Some(source_id) = &note.source_id {
            let source = self.get_source(source_id).await?;
            if source.notebook_id != note.notebook_id {
                return Err(StoreError::ConstraintViolation(format!(
                    "source {} belongs to another notebook",
                    source_id
                )));
            }
        }

        let id = new_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO notes (id, notebook_id, title, text, author, source_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&note.notebook_id)
        .bind(&note.title)
        .bind(&note.text)
        .bind(note.author.as_str())
        .bind(&note.source_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, "note"))?;
        self.touch_notebook(&note.notebook_id).await?;

        Ok(Note {
            id,
            notebook_id: note.notebook_id,
            title: note.title,
            text: note.text,
            author: note.author,
            source_id: note.source_id,
            created_at: ts(now),
        })
    }

    pub async fn get_note(&self, id: &str) -> Result<Note, StoreError> {
        let row = sqlx::query("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("note", id))?;
        Ok(row_to_note(&row))
    }

    /// Newest first.
    pub async fn list_notes(&self, notebook_id: &str) -> Result<Vec<Note>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notes WHERE notebook_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(notebook_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_note).collect())
    }

    pub async fn delete_note(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("note", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NewNote;
    use crate::error::StoreError;
    use crate::models::{AuthorKind, SourceDescriptor};
    use crate::store::test_support::temp_store;

    fn note(notebook_id: &str, text: &str) -> NewNote {
        NewNote {
            notebook_id: notebook_id.to_string(),
            title: None,
            text: text.to_string(),
            author: AuthorKind::Human,
            source_id: None,
        }
    }

    #[tokio::test]
    async fn notes_list_newest_first() {
        let (_tmp, store) = temp_store().await;
        let nb = store.create_notebook("nb", None).await.unwrap();
        store.create_note(note(&nb.id, "first")).await.unwrap();
        store.create_note(note(&nb.id, "second")).await.unwrap();

        let notes = store.list_notes(&nb.id).await.unwrap();
        let texts: Vec<_> = notes.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn note_source_must_share_notebook() {
        let (_tmp, store) = temp_store().await;
        let a = store.create_notebook("a", None).await.unwrap();
        let b = store.create_notebook("b", None).await.unwrap();
        let source = store
            .create_source(
                &b.id,
                &SourceDescriptor::Text {
                    text: "x".into(),
                    title: None,
                },
            )
            .await
            .unwrap();

        let mut n = note(&a.id, "about b");
        n.source_id = Some(source.id.clone());
        assert!(matches!(
            store.create_note(n).await,
            Err(StoreError::ConstraintViolation(_))
        ));

        let mut n = note(&b.id, "about b");
        n.source_id = Some(source.id.clone());
        let saved = store.create_note(n).await.unwrap();
        assert_eq!(saved.source_id.as_deref(), Some(source.id.as_str()));
    }

    #[tokio::test]
    async fn delete_missing_note_is_not_found() {
        let (_tmp, store) = temp_store().await;
        assert!(matches!(
            store.delete_note("nope").await,
            Err(StoreError::NotFound { entity: "note", .. })
        ));
    }
}
