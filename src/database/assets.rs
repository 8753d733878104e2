use anyhow::Result;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_datetime, Database};
use crate::models::{Asset, AssetType, ImplementationRecord, NewAsset};

const ASSET_COLUMNS: &str = "id, identifier, project_id, asset_type, source_url, local_path,
     implementation_id, extra_data, created_at, updated_at";

fn asset_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Asset> {
    let asset_type_str: String = row.get("asset_type");
    let asset_type = AssetType::parse(&asset_type_str)
        .ok_or_else(|| anyhow::anyhow!("Unknown asset type: {}", asset_type_str))?;

    let extra_data_str: String = row.get("extra_data");
    let created_at = row.get::<String, _>("created_at");
    let updated_at = row.get::<String, _>("updated_at");
    let implementation_id = row.get::<Option<String>, _>("implementation_id");

    Ok(Asset {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        identifier: row.get("identifier"),
        project_id: Uuid::parse_str(&row.get::<String, _>("project_id"))?,
        asset_type,
        source_url: row.get("source_url"),
        local_path: row.get("local_path"),
        implementation_id: implementation_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()?,
        extra_data: serde_json::from_str(&extra_data_str)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

impl Database {
    pub async fn create_asset(&self, new_asset: &NewAsset) -> Result<Asset> {
        let asset = Asset {
            id: Uuid::new_v4(),
            identifier: new_asset.identifier.clone(),
            project_id: new_asset.project_id,
            asset_type: new_asset.asset_type,
            source_url: new_asset.source_url.clone(),
            local_path: new_asset.local_path.clone(),
            implementation_id: None,
            extra_data: new_asset.extra_data.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO assets (id, identifier, project_id, asset_type, source_url, local_path,
             implementation_id, extra_data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(asset.id.to_string())
        .bind(&asset.identifier)
        .bind(asset.project_id.to_string())
        .bind(asset.asset_type.as_str())
        .bind(&asset.source_url)
        .bind(&asset.local_path)
        .bind(asset.extra_data.to_string())
        .bind(asset.created_at.to_rfc3339())
        .bind(asset.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(asset)
    }

    pub async fn get_asset(&self, id: Uuid) -> Result<Option<Asset>> {
        let query = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(asset_from_row).transpose()
    }

    pub async fn get_asset_by_identifier(&self, identifier: &str) -> Result<Option<Asset>> {
        let query = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE identifier = ?");
        let row = sqlx::query(&query)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(asset_from_row).transpose()
    }

    pub async fn list_assets(&self, project_id: Option<Uuid>) -> Result<Vec<Asset>> {
        let rows = match project_id {
            Some(project_id) => {
                let query = format!(
                    "SELECT {ASSET_COLUMNS} FROM assets WHERE project_id = ? ORDER BY identifier"
                );
                sqlx::query(&query)
                    .bind(project_id.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {ASSET_COLUMNS} FROM assets ORDER BY identifier");
                sqlx::query(&query).fetch_all(&self.pool).await?
            }
        };

        rows.iter().map(asset_from_row).collect()
    }

    pub async fn list_assets_with_local_path(&self) -> Result<Vec<Asset>> {
        let query = format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE local_path IS NOT NULL ORDER BY identifier"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(asset_from_row).collect()
    }

    /// Deployed contracts still eligible for proxy monitoring. Contracts the
    /// monitor has flagged `is_not_proxy` stay excluded until the flag is
    /// cleared externally.
    pub async fn list_proxy_candidates(&self) -> Result<Vec<Asset>> {
        let query = format!(
            "SELECT {ASSET_COLUMNS} FROM assets
             WHERE asset_type = 'deployed_contract'
               AND json_extract(extra_data, '$.is_not_proxy') IS NOT 1
             ORDER BY identifier"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(asset_from_row).collect()
    }

    /// Sticky flag set when a contract shows no upgrade events.
    pub async fn mark_not_proxy(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE assets
             SET extra_data = json_set(extra_data, '$.is_not_proxy', json('true')),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_asset_extra_data(
        &self,
        id: Uuid,
        extra_data: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE assets SET extra_data = ?, updated_at = ? WHERE id = ?")
            .bind(extra_data.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_asset(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assets WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist a batch of embeddings in a single transaction. Returns the
    /// number of rows updated.
    pub async fn update_embeddings(&self, batch: &[(Uuid, Vec<f32>)]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for (id, embedding) in batch {
            sqlx::query("UPDATE assets SET embedding = ?, updated_at = ? WHERE id = ?")
                .bind(serde_json::to_string(embedding)?)
                .bind(Utc::now().to_rfc3339())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(batch.len())
    }

    pub async fn get_embedding(&self, id: Uuid) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query("SELECT embedding FROM assets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let embedding: Option<String> = row.get("embedding");
                Ok(embedding
                    .map(|s| serde_json::from_str(&s))
                    .transpose()?)
            }
            None => Ok(None),
        }
    }

    /// Re-link a proxy to a new implementation in one transaction: create the
    /// implementation asset if it does not exist yet, point the proxy's
    /// implementation relation at it, and append one audit-trail entry to
    /// `extra_data.implementation_history`. A failure anywhere rolls the whole
    /// contract update back.
    pub async fn apply_implementation_upgrade(
        &self,
        proxy_id: Uuid,
        new_implementation: &NewAsset,
        record: &ImplementationRecord,
    ) -> Result<Asset> {
        let mut tx = self.pool.begin().await?;

        // Locate or create the implementation asset inside the transaction.
        let select = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE identifier = ?");
        let existing = sqlx::query(&select)
            .bind(&new_implementation.identifier)
            .fetch_optional(&mut *tx)
            .await?;

        let impl_asset = match existing {
            Some(row) => asset_from_row(&row)?,
            None => {
                let asset = Asset {
                    id: Uuid::new_v4(),
                    identifier: new_implementation.identifier.clone(),
                    project_id: new_implementation.project_id,
                    asset_type: new_implementation.asset_type,
                    source_url: new_implementation.source_url.clone(),
                    local_path: new_implementation.local_path.clone(),
                    implementation_id: None,
                    extra_data: new_implementation.extra_data.clone(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                sqlx::query(
                    "INSERT INTO assets (id, identifier, project_id, asset_type, source_url,
                     local_path, implementation_id, extra_data, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)",
                )
                .bind(asset.id.to_string())
                .bind(&asset.identifier)
                .bind(asset.project_id.to_string())
                .bind(asset.asset_type.as_str())
                .bind(&asset.source_url)
                .bind(&asset.local_path)
                .bind(asset.extra_data.to_string())
                .bind(asset.created_at.to_rfc3339())
                .bind(asset.updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
                asset
            }
        };

        // Re-read the proxy's audit trail inside the transaction so the append
        // works on current state.
        let select = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?");
        let proxy_row = sqlx::query(&select)
            .bind(proxy_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Proxy asset {} not found", proxy_id))?;
        let proxy = asset_from_row(&proxy_row)?;

        let mut map = match proxy.extra_data {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };
        let history = map
            .entry("implementation_history")
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let Some(entries) = history.as_array_mut() {
            entries.push(serde_json::to_value(record)?);
        }
        let extra_data = serde_json::Value::Object(map);

        sqlx::query(
            "UPDATE assets SET implementation_id = ?, extra_data = ?, updated_at = ? WHERE id = ?",
        )
        .bind(impl_asset.id.to_string())
        .bind(extra_data.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(proxy_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(impl_asset)
    }
}
