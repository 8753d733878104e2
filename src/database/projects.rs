use anyhow::Result;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, Database};
use crate::models::Project;

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    let created_at = row.get::<String, _>("created_at");
    let updated_at = row.get::<String, _>("updated_at");
    Ok(Project {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        name: row.get("name"),
        platform: row.get("platform"),
        description: row.get("description"),
        max_bounty: row.get("max_bounty"),
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl Database {
    pub async fn create_project(
        &self,
        name: &str,
        platform: &str,
        description: Option<&str>,
        max_bounty: Option<f64>,
    ) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            platform: platform.to_string(),
            description: description.map(str::to_string),
            max_bounty,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO projects (id, name, platform, description, max_bounty, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.platform)
        .bind(&project.description)
        .bind(project.max_bounty)
        .bind(project.created_at.to_rfc3339())
        .bind(project.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(project)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, platform, description, max_bounty, created_at, updated_at
             FROM projects WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    pub async fn get_project_by_name(
        &self,
        platform: &str,
        name: &str,
    ) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, platform, description, max_bounty, created_at, updated_at
             FROM projects WHERE platform = ? AND name = ?",
        )
        .bind(platform)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    pub async fn list_projects(&self, platform: Option<&str>) -> Result<Vec<Project>> {
        let rows = match platform {
            Some(platform) => {
                sqlx::query(
                    "SELECT id, name, platform, description, max_bounty, created_at, updated_at
                     FROM projects WHERE platform = ? ORDER BY name",
                )
                .bind(platform)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, name, platform, description, max_bounty, created_at, updated_at
                     FROM projects ORDER BY name",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(project_from_row).collect()
    }

    pub async fn update_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET description = ?, max_bounty = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&project.description)
        .bind(project.max_bounty)
        .bind(Utc::now().to_rfc3339())
        .bind(project.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a project and (via FK cascade) all of its assets.
    pub async fn delete_project(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
