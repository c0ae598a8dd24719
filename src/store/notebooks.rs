use sqlx::Row;

use super::{new_id, now_ms, ts, SqliteStore};
use crate::error::StoreError;
use crate::models::Notebook;

fn row_to_notebook(row: &sqlx::sqlite::SqliteRow) -> Notebook {
    Notebook {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    }
}

impl SqliteStore {
    pub async fn create_notebook(
        &self,
        title: &str,
        description: Option<&str>,
    ) -> Result<Notebook, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::ConstraintViolation(
                "notebook title must not be empty".to_string(),
            ));
        }
        let id = new_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO notebooks (id, title, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, "notebook"))?;

        Ok(Notebook {
            id,
            title: title.to_string(),
            description: description.map(String::from),
            created_at: ts(now),
            updated_at: ts(now),
        })
    }

    pub async fn get_notebook(&self, id: &str) -> Result<Notebook, StoreError> {
        let row = sqlx::query("SELECT * FROM notebooks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("notebook", id))?;
        Ok(row_to_notebook(&row))
    }

    /// Most recently updated first.
    pub async fn list_notebooks(&self) -> Result<Vec<Notebook>, StoreError> {
        let rows = sqlx::query("SELECT * FROM notebooks ORDER BY updated_at DESC, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_notebook).collect())
    }

    pub async fn update_notebook(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Notebook, StoreError> {
        let current = self.get_notebook(id).await?;
        let title = title.map(str::trim).unwrap_or(&current.title);
        if title.is_empty() {
            return Err(StoreError::ConstraintViolation(
                "notebook title must not be empty".to_string(),
            ));
        }
        let description = description.or(current.description.as_deref());
        sqlx::query("UPDATE notebooks SET title = ?, description = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(description)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_notebook(id).await
    }

    /// Delete a notebook together with everything it owns.
    pub async fn delete_notebook(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM notebooks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("notebook", id));
        }
        Ok(())
    }

    pub(crate) async fn touch_notebook(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE notebooks SET updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
