pub mod allow_list;
pub mod metadata;

pub use allow_list::PgAllowListStore;
pub use metadata::PgMetadataStore;

use opendx_core::policy::{AllowListEntry, FieldRef, PolicyMetadataRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Read side of the policy metadata store, as the evaluator sees it.
pub trait MetadataStore {
    async fn field(
        &self,
        schema_id: &str,
        field_name: &str,
    ) -> Result<Option<PolicyMetadataRecord>, StoreError>;
}

/// Read side of the allow-list store, as the evaluator sees it.
pub trait AllowListStore {
    async fn lookup(
        &self,
        application_id: &str,
        field: &FieldRef,
    ) -> Result<Option<AllowListEntry>, StoreError>;
}
