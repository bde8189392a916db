use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use time::OffsetDateTime;

use crate::application::repos::{CanonicalStore, PostPage, RepoError};
use crate::domain::entities::{CommentRecord, PostId, PostRecord};

use super::{PostgresRepositories, map_sqlx_error};

const POST_COLUMNS: &str = "p.id, p.author_id, p.content, p.created_at, p.published_at, p.view_count";

#[derive(sqlx::FromRow)]
struct PostRow {
    id: i64,
    author_id: i64,
    content: String,
    created_at: OffsetDateTime,
    published_at: Option<OffsetDateTime>,
    view_count: i64,
}

impl From<PostRow> for PostRecord {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.id,
            author_id: row.author_id,
            content: row.content,
            published_at: row.published_at.unwrap_or(row.created_at),
            created_at: row.created_at,
            view_count: row.view_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: i64,
    post_id: i64,
    author_id: i64,
    content: String,
    created_at: OffsetDateTime,
}

impl From<CommentRow> for CommentRecord {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id,
            post_id: row.post_id,
            author_id: row.author_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CountRow {
    post_id: i64,
    total: i64,
}

impl PostgresRepositories {
    async fn count_by_post(
        &self,
        sql: &'static str,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError> {
        if post_ids.is_empty() {
            return Ok(HashMap::new());
        }

        sqlx::query_as::<_, CountRow>(sql)
            .bind(post_ids)
            .fetch(self.pool())
            .map_ok(|row| (row.post_id, row.total))
            .try_collect::<HashMap<_, _>>()
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl CanonicalStore for PostgresRepositories {
    async fn fetch_post(&self, post_id: PostId) -> Result<Option<PostRecord>, RepoError> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM post p \
             WHERE p.id = $1 AND p.published = TRUE AND p.deleted = FALSE"
        );
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(post_id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(PostRecord::from))
    }

    async fn fetch_posts_in_range(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        page: u32,
        batch_size: u32,
    ) -> Result<PostPage, RepoError> {
        if batch_size == 0 {
            return Err(RepoError::InvalidInput {
                message: "batch size must be greater than zero".to_string(),
            });
        }

        let limit = i64::from(batch_size);
        let offset = i64::from(page) * limit;
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM post p \
             WHERE p.published = TRUE AND p.deleted = FALSE \
               AND p.published_at BETWEEN $1 AND $2 \
             ORDER BY p.published_at DESC, p.id DESC \
             LIMIT $3 OFFSET $4"
        );

        // One extra row tells whether another page follows.
        let mut rows = sqlx::query_as::<_, PostRow>(&sql)
            .bind(from)
            .bind(to)
            .bind(limit + 1)
            .bind(offset)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let has_next = (rows.len() as i64) > limit;
        if has_next {
            rows.pop();
        }

        Ok(PostPage {
            items: rows.into_iter().map(PostRecord::from).collect(),
            has_next,
        })
    }

    async fn aggregate_comment_counts(
        &self,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError> {
        self.count_by_post(
            "SELECT c.post_id, COUNT(*) AS total FROM comment c \
             WHERE c.post_id = ANY($1) GROUP BY c.post_id",
            post_ids,
        )
        .await
    }

    async fn aggregate_like_counts(
        &self,
        post_ids: &[PostId],
    ) -> Result<HashMap<PostId, i64>, RepoError> {
        self.count_by_post(
            "SELECT l.post_id, COUNT(*) AS total FROM likes l \
             WHERE l.post_id = ANY($1) GROUP BY l.post_id",
            post_ids,
        )
        .await
    }

    async fn fetch_top_k_recent_comments(
        &self,
        post_ids: &[PostId],
        k: usize,
    ) -> Result<HashMap<PostId, Vec<CommentRecord>>, RepoError> {
        if post_ids.is_empty() || k == 0 {
            return Ok(HashMap::new());
        }
        let k = i64::try_from(k).map_err(|_| RepoError::InvalidInput {
            message: format!("comment preview size {k} is out of range"),
        })?;

        let rows = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT sub.id, sub.post_id, sub.author_id, sub.content, sub.created_at
              FROM (
                    SELECT c.id, c.post_id, c.author_id, c.content, c.created_at,
                           ROW_NUMBER() OVER (
                               PARTITION BY c.post_id
                               ORDER BY c.created_at DESC, c.id DESC
                           ) AS rn
                      FROM comment c
                     WHERE c.post_id = ANY($1)
                   ) sub
             WHERE sub.rn <= $2
             ORDER BY sub.post_id, sub.rn
            "#,
        )
        .bind(post_ids)
        .bind(k)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let mut grouped: HashMap<PostId, Vec<CommentRecord>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.post_id)
                .or_default()
                .push(CommentRecord::from(row));
        }
        Ok(grouped)
    }
}
