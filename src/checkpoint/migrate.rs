//! Forward-only checkpoint schema migrations.
//!
//! Migrations operate on raw JSON so that a checkpoint is never deserialized
//! under a schema it was not written with. Each step is pure, additive and
//! idempotent: it only inserts missing fields with safe defaults.
//!
//! | Version | Adds                                                          |
//! |---------|---------------------------------------------------------------|
//! | 1       | `phases[].{name,status,team_name}`, `session`                 |
//! | 2       | `phases[].{artifact_hashes,started_at,completed_at}`          |
//! | 3       | `phases[].{attempts,partial_reason,failure}`, `convergence`, `halt`, `session.process_name` |

use serde_json::{Map, Value, json};

use super::types::CURRENT_SCHEMA_VERSION;
use crate::errors::CheckpointError;

/// Schema version of a raw checkpoint. Documents predating the field are v1.
pub fn schema_version_of(value: &Value) -> u32 {
    value
        .get("schema_version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(1)
}

/// Migrate `value` from schema `from` to schema `to`, one version at a time.
pub fn migrate(mut value: Value, from: u32, to: u32) -> Result<Value, CheckpointError> {
    if from > CURRENT_SCHEMA_VERSION {
        return Err(CheckpointError::NewerSchema {
            found: from,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    let to = to.min(CURRENT_SCHEMA_VERSION);
    let mut version = from.max(1);
    while version < to {
        value = match version {
            1 => v1_to_v2(value)?,
            2 => v2_to_v3(value)?,
            _ => value,
        };
        version += 1;
        set_version(&mut value, version)?;
    }
    Ok(value)
}

fn root_mut(value: &mut Value) -> Result<&mut Map<String, Value>, CheckpointError> {
    value
        .as_object_mut()
        .ok_or_else(|| CheckpointError::MalformedForMigration {
            field: "<root>".to_string(),
        })
}

fn phases_mut(value: &mut Value) -> Result<&mut Vec<Value>, CheckpointError> {
    value
        .get_mut("phases")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| CheckpointError::MalformedForMigration {
            field: "phases".to_string(),
        })
}

fn set_version(value: &mut Value, version: u32) -> Result<(), CheckpointError> {
    root_mut(value)?.insert("schema_version".to_string(), json!(version));
    Ok(())
}

fn insert_missing(obj: &mut Map<String, Value>, key: &str, default: Value) {
    obj.entry(key.to_string()).or_insert(default);
}

/// v2 records artifact hashes and phase timing.
fn v1_to_v2(mut value: Value) -> Result<Value, CheckpointError> {
    for phase in phases_mut(&mut value)? {
        let Some(obj) = phase.as_object_mut() else {
            return Err(CheckpointError::MalformedForMigration {
                field: "phases[]".to_string(),
            });
        };
        insert_missing(obj, "artifact_hashes", json!({}));
        insert_missing(obj, "started_at", Value::Null);
        insert_missing(obj, "completed_at", Value::Null);
    }
    Ok(value)
}

/// v3 adds retry bookkeeping, convergence sub-state and the pid-reuse guard.
fn v2_to_v3(mut value: Value) -> Result<Value, CheckpointError> {
    for phase in phases_mut(&mut value)? {
        let Some(obj) = phase.as_object_mut() else {
            return Err(CheckpointError::MalformedForMigration {
                field: "phases[]".to_string(),
            });
        };
        // A completed v2 phase ran at least once.
        let ran = obj.get("status").and_then(Value::as_str) != Some("pending");
        insert_missing(obj, "attempts", json!(u32::from(ran)));
        insert_missing(obj, "partial_reason", Value::Null);
        insert_missing(obj, "failure", Value::Null);
    }
    let root = root_mut(&mut value)?;
    insert_missing(root, "convergence", Value::Null);
    insert_missing(root, "halt", Value::Null);
    match root.get_mut("session").and_then(Value::as_object_mut) {
        Some(session) => insert_missing(session, "process_name", Value::Null),
        None => {
            return Err(CheckpointError::MalformedForMigration {
                field: "session".to_string(),
            });
        }
    }
    Ok(value)
}
