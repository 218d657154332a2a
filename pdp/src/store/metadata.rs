use chrono::{DateTime, Utc};
use opendx_core::policy::{AccessControlType, PolicyFieldInput, PolicyMetadataRecord};
use sqlx::PgPool;
use uuid::Uuid;

use super::{MetadataStore, StoreError};

#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct MetadataRow {
    id: Uuid,
    schema_id: String,
    field_name: String,
    source: String,
    is_owner: bool,
    access_control_type: String,
    owner: Option<String>,
    display_name: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MetadataRow {
    fn into_record(self) -> Result<PolicyMetadataRecord, StoreError> {
        let access_control_type = self
            .access_control_type
            .parse::<AccessControlType>()
            .map_err(StoreError::Corrupt)?;
        Ok(PolicyMetadataRecord {
            id: self.id,
            schema_id: self.schema_id,
            field_name: self.field_name,
            source: self.source,
            is_owner: self.is_owner,
            access_control_type,
            owner: self.owner,
            display_name: self.display_name,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert a batch of field records for one schema. Existing rows keep
    /// their id and created_at; everything else is replaced.
    pub async fn put_records(
        &self,
        schema_id: &str,
        records: Vec<PolicyFieldInput>,
    ) -> Result<Vec<PolicyMetadataRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut stored = Vec::with_capacity(records.len());

        for input in records {
            let row = sqlx::query_as::<_, MetadataRow>(
                r#"
                INSERT INTO policy_metadata
                    (id, schema_id, field_name, source, is_owner, access_control_type,
                     owner, display_name, description, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
                ON CONFLICT (schema_id, field_name) DO UPDATE SET
                    source = EXCLUDED.source,
                    is_owner = EXCLUDED.is_owner,
                    access_control_type = EXCLUDED.access_control_type,
                    owner = EXCLUDED.owner,
                    display_name = EXCLUDED.display_name,
                    description = EXCLUDED.description,
                    updated_at = EXCLUDED.updated_at
                RETURNING id, schema_id, field_name, source, is_owner, access_control_type,
                          owner, display_name, description, created_at, updated_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(schema_id)
            .bind(&input.field_name)
            .bind(&input.source)
            .bind(input.is_owner)
            .bind(input.access_control_type.as_str())
            .bind(&input.owner)
            .bind(&input.display_name)
            .bind(&input.description)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            stored.push(row.into_record()?);
        }

        tx.commit().await?;
        Ok(stored)
    }

    pub async fn list_by_schema(
        &self,
        schema_id: &str,
    ) -> Result<Vec<PolicyMetadataRecord>, StoreError> {
        let rows = sqlx::query_as::<_, MetadataRow>(
            r#"
            SELECT id, schema_id, field_name, source, is_owner, access_control_type,
                   owner, display_name, description, created_at, updated_at
            FROM policy_metadata
            WHERE schema_id = $1
            ORDER BY field_name
            "#,
        )
        .bind(schema_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MetadataRow::into_record).collect()
    }
}

impl MetadataStore for PgMetadataStore {
    async fn field(
        &self,
        schema_id: &str,
        field_name: &str,
    ) -> Result<Option<PolicyMetadataRecord>, StoreError> {
        let row = sqlx::query_as::<_, MetadataRow>(
            r#"
            SELECT id, schema_id, field_name, source, is_owner, access_control_type,
                   owner, display_name, description, created_at, updated_at
            FROM policy_metadata
            WHERE schema_id = $1 AND field_name = $2
            "#,
        )
        .bind(schema_id)
        .bind(field_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MetadataRow::into_record).transpose()
    }
}
