//! Translation between local rows and global payloads, driven by a
//! [`MappingDocument`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use w3sync_core::expr::Expr;
use w3sync_core::mapping::{DateFormat, Transform};
use w3sync_core::path;
use w3sync_core::reference::{TableRef, embedded_id};
use w3sync_core::{GlobalId, LocalId, MappingDocument, Row, W3Id};
use w3sync_storage::MappingStore;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalProjection {
    pub data: Row,
    /// Identity whose vault stores the record. `None` means the record
    /// cannot be synced yet.
    pub owner_evault: Option<W3Id>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalProjection {
    pub data: Row,
    /// References whose target has no local row yet. The raw global id was
    /// written in their place.
    pub unresolved: Vec<TableRef>,
}

pub fn to_global<S: MappingStore + ?Sized>(
    data: &Row,
    mapping: &MappingDocument,
    store: &S,
) -> Result<GlobalProjection, EngineError> {
    let mut out = Row::new();

    for field in &mapping.field_mappings {
        if let Some(Transform::Calc { expr, as_date }) = &field.transform {
            let expr = Expr::parse(expr)?;
            if let Some(value) = expr.eval(data).and_then(|n| calc_value(n, *as_date)) {
                path::assign(&mut out, &field.global_field, value);
            }
            continue;
        }

        let Some(value) = path::lookup_in(data, &field.local_field) else {
            continue;
        };

        let value = if let Some(reference) = mapping.reference_for(&field.local_field) {
            match reference_to_global(value, &reference.target_table, store)? {
                Some(value) => value,
                None => continue,
            }
        } else if let Some(Transform::Date { local_format }) = &field.transform {
            date_to_global(value, *local_format)
        } else {
            value
        };
        path::assign(&mut out, &field.global_field, value);
    }

    let owner_evault = resolve_owner(data, mapping, store)?;
    Ok(GlobalProjection {
        data: out,
        owner_evault,
    })
}

pub fn from_global<S: MappingStore + ?Sized>(
    data: &Row,
    mapping: &MappingDocument,
    store: &S,
) -> Result<LocalProjection, EngineError> {
    let mut out = Row::new();
    let mut unresolved = Vec::new();

    for field in &mapping.field_mappings {
        if matches!(field.transform, Some(Transform::Calc { .. })) {
            continue;
        }
        let Some(value) = path::lookup_in(data, &field.global_field) else {
            continue;
        };

        let value = if let Some(reference) = mapping.reference_for(&field.local_field) {
            reference_to_local(value, &reference.target_table, store, &mut unresolved)?
        } else if let Some(Transform::Date { local_format }) = &field.transform {
            date_to_local(value, *local_format)
        } else {
            value
        };
        path::assign(&mut out, &field.local_field, value);
    }

    Ok(LocalProjection {
        data: out,
        unresolved,
    })
}

/// Walks the owner paths in order and returns the first identity found.
pub fn resolve_owner<S: MappingStore + ?Sized>(
    data: &Row,
    mapping: &MappingDocument,
    store: &S,
) -> Result<Option<W3Id>, EngineError> {
    let Some(owner) = &mapping.owner else {
        return Ok(None);
    };
    for owner_path in &owner.paths {
        let Some(raw) = path::lookup_in(data, owner_path).as_ref().and_then(id_text) else {
            continue;
        };
        let raw = embedded_id(&raw);
        match &owner.target_table {
            Some(table) => {
                if let Some(global) = store.get_global_id(&LocalId::new(raw), table)? {
                    return Ok(Some(W3Id::from(global)));
                }
                debug!(
                    table = %table,
                    local_id = raw,
                    path = %owner_path,
                    "owner row not mapped yet"
                );
            }
            None => return Ok(Some(W3Id::new(raw))),
        }
    }
    Ok(None)
}

/// Identities listed by the document's participant path. Unmapped local ids
/// are skipped.
pub fn resolve_participants<S: MappingStore + ?Sized>(
    data: &Row,
    mapping: &MappingDocument,
    store: &S,
) -> Result<Vec<W3Id>, EngineError> {
    let Some(source) = &mapping.participants else {
        return Ok(Vec::new());
    };
    let raw_ids: Vec<String> = match path::lookup_in(data, &source.path) {
        Some(Value::Array(items)) => items.iter().filter_map(id_text).collect(),
        Some(value) => id_text(&value).into_iter().collect(),
        None => Vec::new(),
    };

    let mut participants = Vec::with_capacity(raw_ids.len());
    for raw in raw_ids {
        let raw = embedded_id(&raw);
        match &source.target_table {
            Some(table) => {
                if let Some(global) = store.get_global_id(&LocalId::new(raw), table)? {
                    participants.push(W3Id::from(global));
                }
            }
            None => participants.push(W3Id::new(raw)),
        }
    }
    Ok(participants)
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn reference_to_global<S: MappingStore + ?Sized>(
    value: Value,
    target_table: &str,
    store: &S,
) -> Result<Option<Value>, EngineError> {
    let single = |item: &Value| -> Result<Option<Value>, EngineError> {
        let Some(raw) = id_text(item) else {
            return Ok(None);
        };
        let local_id = LocalId::new(embedded_id(&raw));
        match store.get_global_id(&local_id, target_table)? {
            Some(global) => Ok(Some(Value::String(
                TableRef::new(target_table, global.as_str()).to_string(),
            ))),
            None => {
                debug!(table = target_table, %local_id, "reference not mapped yet, omitted");
                Ok(None)
            }
        }
    };

    match value {
        Value::Null => Ok(Some(Value::Null)),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in &items {
                if let Some(value) = single(item)? {
                    resolved.push(value);
                }
            }
            Ok(Some(Value::Array(resolved)))
        }
        other => single(&other),
    }
}

fn reference_to_local<S: MappingStore + ?Sized>(
    value: Value,
    target_table: &str,
    store: &S,
    unresolved: &mut Vec<TableRef>,
) -> Result<Value, EngineError> {
    let mut single = |item: Value| -> Result<Value, EngineError> {
        let Some(raw) = id_text(&item) else {
            return Ok(item);
        };
        let global_id = GlobalId::new(embedded_id(&raw));
        match store.get_local_id(&global_id)? {
            Some(local) => Ok(Value::String(local.into_string())),
            None => {
                unresolved.push(TableRef::new(target_table, global_id.as_str()));
                Ok(Value::String(global_id.into_string()))
            }
        }
    };

    match value {
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(single(item)?);
            }
            Ok(Value::Array(resolved))
        }
        other => single(other),
    }
}

fn parse_instant(value: &Value, format: DateFormat) -> Option<DateTime<Utc>> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if let Some(n) = number {
        return match format {
            DateFormat::Seconds => DateTime::from_timestamp(n as i64, 0),
            DateFormat::Millis | DateFormat::Iso => DateTime::from_timestamp_millis(n as i64),
        };
    }

    let text = value.as_str()?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, pattern) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn iso(instant: DateTime<Utc>) -> Value {
    Value::String(instant.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn date_to_global(value: Value, format: DateFormat) -> Value {
    if value.is_null() {
        return value;
    }
    match parse_instant(&value, format) {
        Some(instant) => iso(instant),
        None => {
            warn!(?value, "unparseable date passed through");
            value
        }
    }
}

fn date_to_local(value: Value, format: DateFormat) -> Value {
    if value.is_null() {
        return value;
    }
    let Some(instant) = parse_instant(&value, DateFormat::Iso) else {
        warn!(?value, "unparseable date passed through");
        return value;
    };
    match format {
        DateFormat::Iso => iso(instant),
        DateFormat::Millis => Value::from(instant.timestamp_millis()),
        DateFormat::Seconds => Value::from(instant.timestamp()),
    }
}

fn calc_value(n: f64, as_date: bool) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    if as_date {
        return DateTime::from_timestamp_millis(n as i64).map(iso);
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Some(Value::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(Value::Number)
    }
}
