use chrono::{DateTime, Duration, Utc};
use opendx_core::policy::{AllowListEntry, FieldRef};
use sqlx::PgPool;

use super::{AllowListStore, StoreError};

#[derive(Clone)]
pub struct PgAllowListStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct AllowListRow {
    application_id: String,
    schema_id: String,
    field_name: String,
    granted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl AllowListRow {
    fn into_entry(self) -> AllowListEntry {
        AllowListEntry {
            application_id: self.application_id,
            schema_id: self.schema_id,
            field_name: self.field_name,
            granted_at: self.granted_at,
            expires_at: self.expires_at,
        }
    }
}

impl PgAllowListStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Grant (or refresh) `application_id`'s access to each field. Every call
    /// restarts the clock: granted_at = now, expires_at = now + ttl.
    pub async fn upsert(
        &self,
        application_id: &str,
        fields: &[FieldRef],
        ttl: Duration,
    ) -> Result<Vec<AllowListEntry>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let granted_at = Utc::now();
        let expires_at = granted_at + ttl;
        let mut entries = Vec::with_capacity(fields.len());

        for field in fields {
            let row = sqlx::query_as::<_, AllowListRow>(
                r#"
                INSERT INTO allow_list (application_id, schema_id, field_name, granted_at, expires_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (application_id, schema_id, field_name) DO UPDATE SET
                    granted_at = EXCLUDED.granted_at,
                    expires_at = EXCLUDED.expires_at
                RETURNING application_id, schema_id, field_name, granted_at, expires_at
                "#,
            )
            .bind(application_id)
            .bind(&field.schema_id)
            .bind(&field.field_name)
            .bind(granted_at)
            .bind(expires_at)
            .fetch_one(&mut *tx)
            .await?;
            entries.push(row.into_entry());
        }

        tx.commit().await?;
        Ok(entries)
    }

    /// Delete entries whose expiry is older than `before`. Recently-expired
    /// entries are kept so decisions can report them as expired rather than
    /// unknown.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM allow_list WHERE expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl AllowListStore for PgAllowListStore {
    async fn lookup(
        &self,
        application_id: &str,
        field: &FieldRef,
    ) -> Result<Option<AllowListEntry>, StoreError> {
        let row = sqlx::query_as::<_, AllowListRow>(
            r#"
            SELECT application_id, schema_id, field_name, granted_at, expires_at
            FROM allow_list
            WHERE application_id = $1 AND schema_id = $2 AND field_name = $3
            "#,
        )
        .bind(application_id)
        .bind(&field.schema_id)
        .bind(&field.field_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AllowListRow::into_entry))
    }
}
