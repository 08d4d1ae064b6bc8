//! Database query functions for the `repositories` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Repository;

/// Insert a new repository row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_repository(
    pool: &PgPool,
    name: &str,
    clone_url: &str,
    default_branch: &str,
    project_key: Option<&str>,
) -> Result<Repository> {
    let repo = sqlx::query_as::<_, Repository>(
        "INSERT INTO repositories (name, clone_url, default_branch, project_key) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(name)
    .bind(clone_url)
    .bind(default_branch)
    .bind(project_key)
    .fetch_one(pool)
    .await
    .context("failed to insert repository")?;

    Ok(repo)
}

/// Fetch a repository by its ID.
pub async fn get_repository(pool: &PgPool, id: Uuid) -> Result<Option<Repository>> {
    let repo = sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch repository")?;

    Ok(repo)
}

/// List all repositories, ordered by creation time (newest first).
pub async fn list_repositories(pool: &PgPool) -> Result<Vec<Repository>> {
    let repos =
        sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list repositories")?;

    Ok(repos)
}
