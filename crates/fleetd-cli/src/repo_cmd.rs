//! `fleetd repo` -- minimal seed commands for the repository anchor row.
//! Full repository CRUD and git plumbing live outside the orchestration
//! core; these exist only so `fleetd task create`/`fleetd run create` have
//! something to point at.

use anyhow::Result;
use sqlx::PgPool;

use fleetd_db::queries::repositories;

pub async fn create(
    pool: &PgPool,
    name: &str,
    clone_url: &str,
    default_branch: &str,
    project_key: Option<&str>,
) -> Result<()> {
    let repo = repositories::insert_repository(pool, name, clone_url, default_branch, project_key)
        .await?;
    println!("{}", serde_json::to_string_pretty(&repo)?);
    Ok(())
}

pub async fn list(pool: &PgPool) -> Result<()> {
    let repos = repositories::list_repositories(pool).await?;
    println!("{}", serde_json::to_string_pretty(&repos)?);
    Ok(())
}
