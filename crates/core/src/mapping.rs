use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::expr::Expr;

/// Declarative translation rules between one local table and one vault ontology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDocument {
    pub table_name: String,
    pub schema_id: String,
    #[serde(default)]
    pub owner: Option<OwnerSpec>,
    #[serde(default)]
    pub participants: Option<ParticipantSpec>,
    #[serde(default = "default_acl")]
    pub acl: Vec<String>,
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub reference_fields: Vec<ReferenceField>,
}

fn default_acl() -> Vec<String> {
    vec!["*".to_string()]
}

/// Where to find the identity whose vault stores a record. Paths are tried
/// in order; the first one yielding a value wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSpec {
    pub paths: Vec<String>,
    /// When set, the value at the path is a local id of a row in this table
    /// and the owner is that row's global id.
    #[serde(default)]
    pub target_table: Option<String>,
}

/// Identities (other than the owner) that should receive a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSpec {
    pub path: String,
    #[serde(default)]
    pub target_table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub local_field: String,
    pub global_field: String,
    #[serde(default)]
    pub transform: Option<Transform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Transform {
    /// Normalizes timestamps to RFC 3339 on the global side.
    Date {
        #[serde(default, rename = "localFormat")]
        local_format: DateFormat,
    },
    /// Derived numeric value; not carried back to the local side.
    Calc {
        expr: String,
        #[serde(default, rename = "asDate")]
        as_date: bool,
    },
}

/// How a date is stored in the local row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateFormat {
    #[default]
    Iso,
    Millis,
    Seconds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceField {
    pub field: String,
    pub target_table: String,
}

impl MappingDocument {
    pub fn from_json(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn reference_for(&self, local_field: &str) -> Option<&ReferenceField> {
        self.reference_fields.iter().find(|r| r.field == local_field)
    }

    pub fn field_for_local(&self, local_field: &str) -> Option<&FieldMapping> {
        self.field_mappings
            .iter()
            .find(|f| f.local_field == local_field)
    }

    fn invalid(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidMapping {
            table: self.table_name.clone(),
            reason: reason.into(),
        }
    }

    /// Checks the document on its own; cross-document uniqueness is the
    /// registry's job.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.table_name.trim().is_empty() {
            return Err(self.invalid("tableName is empty"));
        }
        if Uuid::parse_str(&self.schema_id).is_err() {
            return Err(self.invalid(format!("schemaId {:?} is not a UUID", self.schema_id)));
        }
        if self.field_mappings.is_empty() {
            return Err(self.invalid("no fieldMappings"));
        }

        let mut globals = HashSet::new();
        for field in &self.field_mappings {
            if field.local_field.is_empty() || field.global_field.is_empty() {
                return Err(self.invalid("field mapping with an empty name"));
            }
            if !globals.insert(field.global_field.as_str()) {
                return Err(self.invalid(format!(
                    "globalField {:?} mapped twice",
                    field.global_field
                )));
            }
            if let Some(Transform::Calc { expr, .. }) = &field.transform {
                Expr::parse(expr).map_err(|e| self.invalid(e.to_string()))?;
            }
        }

        for reference in &self.reference_fields {
            let Some(field) = self.field_for_local(&reference.field) else {
                return Err(self.invalid(format!(
                    "referenceField {:?} has no field mapping",
                    reference.field
                )));
            };
            if field.transform.is_some() {
                return Err(self.invalid(format!(
                    "referenceField {:?} cannot also carry a transform",
                    reference.field
                )));
            }
            if reference.target_table.is_empty() {
                return Err(self.invalid("referenceField with empty targetTable"));
            }
        }

        if let Some(owner) = &self.owner {
            if owner.paths.is_empty() || owner.paths.iter().any(|p| p.trim().is_empty()) {
                return Err(self.invalid("owner needs at least one non-empty path"));
            }
        }
        Ok(())
    }
}
