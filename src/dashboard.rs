//! Cache keys and optimistic transforms for the cloud dashboard's resources.
//!
//! Values are raw JSON records as returned by the API. Records carry a string
//! `id`; lists are JSON arrays of records.

use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::cache::CacheKey;
use crate::cache_key;
use crate::remote::{RemoteError, RemoteErrorKind};

pub const UPDATED_AT_FIELD: &str = "updatedAt";

pub mod keys {
    use super::*;

    pub fn cloud_accounts(organization_id: &str) -> CacheKey {
        cache_key!["cloud-accounts", organization_id]
    }

    pub fn cloud_account(id: &str) -> CacheKey {
        cache_key!["cloud-account", id]
    }

    pub fn resources(cloud_account_id: &str) -> CacheKey {
        cache_key!["resources", cloud_account_id]
    }

    pub fn resource(id: &str) -> CacheKey {
        cache_key!["resource", id]
    }

    pub fn schedules(organization_id: &str) -> CacheKey {
        cache_key!["schedules", organization_id]
    }

    pub fn schedule(id: &str) -> CacheKey {
        cache_key!["schedule", id]
    }

    pub fn teams(organization_id: &str) -> CacheKey {
        cache_key!["teams", organization_id]
    }

    pub fn team(id: &str) -> CacheKey {
        cache_key!["team", id]
    }
}

/// Shallow-merge `patch` over the cached record and stamp `updatedAt`.
pub fn merge_patch(patch: &Value, cached: Option<&Value>) -> Result<Value, RemoteError> {
    let patch = as_object(patch, "patch")?;
    let mut merged = match cached {
        Some(record) => as_object(record, "cached record")?.clone(),
        None => Map::new(),
    };
    for (field, value) in patch {
        merged.insert(field.clone(), value.clone());
    }
    merged.insert(UPDATED_AT_FIELD.to_string(), Value::String(now_rfc3339()?));
    Ok(Value::Object(merged))
}

/// Drop the record with `id` from a cached list. A missing list stays empty.
pub fn remove_by_id(id: &str, cached: Option<&Value>) -> Result<Value, RemoteError> {
    let list = cached_list(cached)?;
    Ok(Value::Array(
        list.into_iter()
            .filter(|record| record_id(record) != Some(id))
            .collect(),
    ))
}

/// Replace the list element with the same `id` as `record`, or append it.
pub fn upsert_by_id(record: &Value, cached: Option<&Value>) -> Result<Value, RemoteError> {
    let id = record_id(record)
        .ok_or_else(|| RemoteError::validation("record has no string `id`"))?;
    let mut list = cached_list(cached)?;
    match list.iter().position(|existing| record_id(existing) == Some(id)) {
        Some(index) => list[index] = record.clone(),
        None => list.push(record.clone()),
    }
    Ok(Value::Array(list))
}

/// Put a newly created record at the head of a cached list.
pub fn prepend(record: &Value, cached: Option<&Value>) -> Result<Value, RemoteError> {
    let mut list = cached_list(cached)?;
    list.insert(0, record.clone());
    Ok(Value::Array(list))
}

pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, RemoteError> {
    value
        .as_object()
        .ok_or_else(|| RemoteError::validation(format!("{what} is not a JSON object")))
}

fn cached_list(cached: Option<&Value>) -> Result<Vec<Value>, RemoteError> {
    match cached {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(RemoteError::validation("cached value is not a JSON array")),
    }
}

fn now_rfc3339() -> Result<String, RemoteError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| RemoteError::new(RemoteErrorKind::Unknown, err.to_string()))
}
