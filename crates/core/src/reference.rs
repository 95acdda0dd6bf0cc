use std::fmt;

use crate::error::CoreError;
use crate::ids::{GlobalId, W3Id};

/// A cross-table reference embedded in a payload, written `table(id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub id: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Parses `table(id)`. Returns `None` for anything else, including bare ids.
    pub fn parse(raw: &str) -> Option<Self> {
        let (table, rest) = raw.split_once('(')?;
        let id = rest.strip_suffix(')')?;
        if table.is_empty()
            || id.is_empty()
            || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return None;
        }
        Some(Self::new(table, id))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.table, self.id)
    }
}

/// Returns the id inside `table(id)`, or the input unchanged when it is a bare id.
pub fn embedded_id(raw: &str) -> &str {
    match raw.split_once('(') {
        Some((_, rest)) if TableRef::parse(raw).is_some() => rest.strip_suffix(')').unwrap_or(rest),
        _ => raw,
    }
}

/// Grants a non-owning vault visibility into a record: `owner/record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultReference {
    pub owner: W3Id,
    pub record: GlobalId,
}

impl VaultReference {
    pub fn new(owner: W3Id, record: GlobalId) -> Self {
        Self { owner, record }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.split_once('/') {
            Some((owner, record)) if !owner.is_empty() && !record.is_empty() => {
                Ok(Self::new(W3Id::new(owner), GlobalId::new(record)))
            }
            _ => Err(CoreError::InvalidReference(raw.to_string())),
        }
    }
}

impl fmt::Display for VaultReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.record)
    }
}
