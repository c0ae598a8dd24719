use sqlx::Row;

use super::{new_id, now_ms, ts, SqliteStore};
use crate::error::StoreError;
use crate::models::{
    Source, SourceDescriptor, SourceMetadata, SourceOrigin, SourceStatus, SourceStatusReport,
};

fn row_to_source(row: &sqlx::sqlite::SqliteRow) -> Source {
    let origin: String = row.get("origin");
    let status: String = row.get("status");
    let warnings_json: String = row.get("warnings_json");
    Source {
        id: row.get("id"),
        notebook_id: row.get("notebook_id"),
        origin: SourceOrigin::parse(&origin).unwrap_or(SourceOrigin::Text),
        metadata: SourceMetadata {
            title: row.get("title"),
            author: row.get("author"),
            mime_type: row.get("mime_type"),
            filename: row.get("filename"),
            url: row.get("url"),
        },
        status: SourceStatus::parse(&status).unwrap_or(SourceStatus::Failed),
        warnings: serde_json::from_str(&warnings_json).unwrap_or_default(),
        error: row.get("error"),
        active_version: row.get("active_version"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    }
}

impl SqliteStore {
    /// Register a source in `pending` state together with its raw content.
    pub async fn create_source(
        &self,
        notebook_id: &str,
        descriptor: &SourceDescriptor,
    ) -> Result<Source, StoreError> {
        // Surface a missing notebook as NotFound rather than a FK failure.
        self.get_notebook(notebook_id).await?;

        let id = new_id();
        let now = now_ms();
        let metadata = descriptor.initial_metadata();
        let origin = descriptor.origin();

        let (body, filename, mime_type, title): (Vec<u8>, Option<&str>, Option<&str>, Option<&str>) =
            match descriptor {
                SourceDescriptor::File {
                    bytes,
                    mime_type,
                    filename,
                } => (bytes.clone(), filename.as_deref(), mime_type.as_deref(), None),
                SourceDescriptor::Url(url) => (url.as_bytes().to_vec(), None, None, None),
                SourceDescriptor::Text { text, title } => {
                    (text.as_bytes().to_vec(), None, None, title.as_deref())
                }
            };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sources (id, notebook_id, origin, title, author, mime_type, filename, url,
                                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(notebook_id)
        .bind(origin.as_str())
        .bind(&metadata.title)
        .bind(&metadata.author)
        .bind(&metadata.mime_type)
        .bind(&metadata.filename)
        .bind(&metadata.url)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, "source"))?;

        sqlx::query(
            "INSERT INTO source_content (source_id, kind, body, filename, mime_type, title) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(origin.as_str())
        .bind(body)
        .bind(filename)
        .bind(mime_type)
        .bind(title)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, "source content"))?;
        tx.commit().await?;

        self.touch_notebook(notebook_id).await?;
        self.get_source(&id).await
    }

    pub async fn get_source(&self, id: &str) -> Result<Source, StoreError> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("source", id))?;
        Ok(row_to_source(&row))
    }

    pub async fn list_sources(&self, notebook_id: &str) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sources WHERE notebook_id = ? ORDER BY created_at, id")
            .bind(notebook_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_source).collect())
    }

    pub async fn source_status(&self, id: &str) -> Result<SourceStatusReport, StoreError> {
        let source = self.get_source(id).await?;
        Ok(SourceStatusReport {
            source_id: source.id,
            status: source.status,
            warnings: source.warnings,
            error: source.error,
        })
    }

    /// The raw input the source was created from.
    pub async fn source_content(&self, id: &str) -> Result<SourceDescriptor, StoreError> {
        let row = sqlx::query(
            "SELECT kind, body, filename, mime_type, title FROM source_content WHERE source_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("source content", id))?;

        let kind: String = row.get("kind");
        let body: Vec<u8> = row.get("body");
        let as_text = |body: Vec<u8>| {
            String::from_utf8(body)
                .map_err(|_| StoreError::Consistency(format!("source {} content is not UTF-8", id)))
        };
        match SourceOrigin::parse(&kind) {
            Some(SourceOrigin::File) => Ok(SourceDescriptor::File {
                bytes: body,
                mime_type: row.get("mime_type"),
                filename: row.get("filename"),
            }),
            Some(SourceOrigin::Url) => Ok(SourceDescriptor::Url(as_text(body)?)),
            Some(SourceOrigin::Text) => Ok(SourceDescriptor::Text {
                text: as_text(body)?,
                title: row.get("title"),
            }),
            None => Err(StoreError::Consistency(format!(
                "source {} has unknown content kind '{}'",
                id, kind
            ))),
        }
    }

    /// Move a source into `processing`, clearing the previous outcome.
    pub async fn mark_processing(&self, id: &str) -> Result<(), StoreError> {
        self.set_status(id, SourceStatus::Processing, &[], None).await
    }

    /// Record a successful ingestion with its extraction warnings.
    pub async fn mark_done(&self, id: &str, warnings: &[String]) -> Result<(), StoreError> {
        self.set_status(id, SourceStatus::Done, warnings, None).await
    }

    /// Record a failed ingestion. Chunks already committed stay visible.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        self.set_status(id, SourceStatus::Failed, &[], Some(reason))
            .await
    }

    async fn set_status(
        &self,
        id: &str,
        status: SourceStatus,
        warnings: &[String],
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let warnings_json = serde_json::to_string(warnings).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "UPDATE sources SET status = ?, warnings_json = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(warnings_json)
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("source", id));
        }
        Ok(())
    }

    /// Merge metadata discovered during extraction; known fields are kept
    /// when the extractor has nothing better.
    pub async fn update_source_metadata(
        &self,
        id: &str,
        metadata: &SourceMetadata,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                title = COALESCE(?, title),
                author = COALESCE(?, author),
                mime_type = COALESCE(?, mime_type),
                filename = COALESCE(?, filename),
                url = COALESCE(?, url),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&metadata.title)
        .bind(&metadata.author)
        .bind(&metadata.mime_type)
        .bind(&metadata.filename)
        .bind(&metadata.url)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_source(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("source", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::models::{SourceDescriptor, SourceStatus};
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn source_lifecycle_and_content() {
        let (_tmp, store) = temp_store().await;
        let nb = store.create_notebook("nb", None).await.unwrap();
        let descriptor = SourceDescriptor::Text {
            text: "hello".into(),
            title: Some("greeting".into()),
        };
        let source = store.create_source(&nb.id, &descriptor).await.unwrap();
        assert_eq!(source.status, SourceStatus::Pending);
        assert_eq!(source.metadata.title.as_deref(), Some("greeting"));
        assert_eq!(store.source_content(&source.id).await.unwrap(), descriptor);

        store.mark_processing(&source.id).await.unwrap();
        store
            .mark_done(&source.id, &["lost tables".to_string()])
            .await
            .unwrap();
        let report = store.source_status(&source.id).await.unwrap();
        assert_eq!(report.status, SourceStatus::Done);
        assert_eq!(report.warnings, vec!["lost tables".to_string()]);

        store.mark_failed(&source.id, "boom").await.unwrap();
        let report = store.source_status(&source.id).await.unwrap();
        assert_eq!(report.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn source_requires_notebook() {
        let (_tmp, store) = temp_store().await;
        let err = store
            .create_source("missing", &SourceDescriptor::Url("https://x.test".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "notebook", .. }));
    }

    #[tokio::test]
    async fn deleting_notebook_cascades_to_sources() {
        let (_tmp, store) = temp_store().await;
        let nb = store.create_notebook("nb", None).await.unwrap();
        let source = store
            .create_source(
                &nb.id,
                &SourceDescriptor::Text {
                    text: "x".into(),
                    title: None,
                },
            )
            .await
            .unwrap();
        store.delete_notebook(&nb.id).await.unwrap();
        assert!(matches!(
            store.get_source(&source.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
