use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use utoipa::ToSchema;

/// Where one consumer-facing field comes from.
#[derive(Debug, Clone, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldSource {
    /// Registry key of the provider serving this field
    pub provider: String,
    /// The field name in the provider's own response
    pub provider_field: String,
    /// Provider schema the field belongs to
    pub schema_id: String,
}

/// The active consumer-field → provider-source mapping.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SchemaMap {
    pub fields: HashMap<String, FieldSource>,
}

/// A requested field resolved against the active schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField {
    pub consumer_field: String,
    pub source: FieldSource,
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("unknown fields: {}", .0.join(", "))]
pub struct UnknownFields(pub Vec<String>);

/// Read-mostly holder of the active schema. Updates swap the whole map so
/// in-flight queries keep the version they started with.
pub struct SchemaRegistry {
    active: RwLock<Arc<SchemaMap>>,
}

impl SchemaRegistry {
    pub fn new(map: SchemaMap) -> Self {
        Self {
            active: RwLock::new(Arc::new(map)),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(raw)?))
    }

    pub fn active(&self) -> Arc<SchemaMap> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, map: SchemaMap) {
        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(map);
    }

    /// Resolve requested consumer fields, preserving request order and
    /// collapsing duplicates. All unknown fields are reported together.
    pub fn resolve(&self, requested: &[String]) -> Result<Vec<ResolvedField>, UnknownFields> {
        let map = self.active();
        let mut resolved = Vec::with_capacity(requested.len());
        let mut unknown = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for name in requested {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match map.fields.get(name) {
                Some(source) => resolved.push(ResolvedField {
                    consumer_field: name.clone(),
                    source: source.clone(),
                }),
                None => unknown.push(name.clone()),
            }
        }

        if unknown.is_empty() {
            Ok(resolved)
        } else {
            Err(UnknownFields(unknown))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_json(
            r#"{
                "fields": {
                    "name": {"provider": "drp", "providerField": "fullName", "schemaId": "drp.person.v1"},
                    "email": {"provider": "contacts", "providerField": "emailAddress", "schemaId": "contacts.person.v2"}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_known_fields_in_request_order() {
        let registry = registry();
        let resolved = registry
            .resolve(&["email".to_string(), "name".to_string()])
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].consumer_field, "email");
        assert_eq!(resolved[0].source.provider, "contacts");
        assert_eq!(resolved[1].source.provider_field, "fullName");
    }

    #[test]
    fn reports_all_unknown_fields_at_once() {
        let registry = registry();
        let err = registry
            .resolve(&["name".to_string(), "nic".to_string(), "age".to_string()])
            .expect_err("unknown fields must fail resolution");
        assert_eq!(err, UnknownFields(vec!["nic".into(), "age".into()]));
    }

    #[test]
    fn duplicate_requests_resolve_once() {
        let registry = registry();
        let resolved = registry
            .resolve(&["name".to_string(), "name".to_string()])
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn replace_swaps_the_active_map() {
        let registry = registry();
        registry.replace(SchemaMap::default());
        assert!(registry.resolve(&["name".to_string()]).is_err());
    }
}
