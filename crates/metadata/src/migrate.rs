//! Schema-versioned migrations for artifact records.
//!
//! Every artifact record carries a `schema` number. When a store is opened,
//! records written by an older schema are passed through the remaining steps
//! of a migration list, as raw JSON, before they are deserialized. Migration
//! `i` upgrades a record from schema `i` to `i + 1`, so the current schema is
//! simply the length of the list.
//!
//! Records from a *newer* schema are left alone; their unknown keys survive
//! the round trip anyway.

use serde_json::{Map, Value};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

/// What a migration step knows about the record it is rewriting.
#[derive(Debug, Clone, Copy)]
pub struct MigrationContext<'a> {
    /// Kind of the store being opened (`"model"`, `"texture"`, …).
    pub kind: &'a str,
    /// Key of the record in the store document.
    pub name: &'a str,
}

pub type Migration = fn(&MigrationContext<'_>, &mut Map<String, Value>);

/// Migrations for records that share the common artifact fields.
pub static ARTIFACT_MIGRATIONS: &[Migration] = &[legacy_sidecar];

/// Schema stamped on freshly created artifact records.
pub const CURRENT_SCHEMA: u32 = 1;

/// Bring one record up to date. Returns `true` if anything was rewritten.
///
/// # Errors
/// Fails when the record is not a JSON object, which no schema allows.
pub fn apply(ctx: &MigrationContext<'_>, record: &mut Value, migrations: &[Migration]) -> Result<bool, NotAnObject> {
    let object = record.as_object_mut().ok_or(NotAnObject)?;
    if migrations.is_empty() {
        return Ok(false);
    }
    let from = object.get("schema").and_then(Value::as_u64).unwrap_or(0) as usize;
    if from >= migrations.len() {
        return Ok(false);
    }
    for step in &migrations[from..] {
        step(ctx, object);
    }
    object.insert("schema".into(), Value::from(migrations.len()));
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotAnObject;

/// Schema 0 → 1: sidecars written by the first generation of asset managers.
///
/// Those used short key names, had no `kind`/`name` inside the record and
/// wrote naive ISO-8601 timestamps without an offset.
fn legacy_sidecar(ctx: &MigrationContext<'_>, record: &mut Map<String, Value>) {
    const RENAMES: &[(&str, &str)] = &[
        ("created", "created_at"),
        ("last_modified", "last_modified_at"),
        ("path", "source_path"),
        ("file_path", "source_path"),
        ("size", "size_bytes"),
        ("file_size", "size_bytes"),
        ("hash", "content_hash"),
        ("vertices", "vertex_count"),
        ("faces", "face_count"),
    ];
    for (old, new) in RENAMES {
        rename(record, old, new);
    }
    // Counts and lists shared a name in the old files.
    for (old, new) in [("materials", "material_count"), ("animations", "animation_count")] {
        if record.get(old).is_some_and(Value::is_number) {
            rename(record, old, new);
        }
    }
    record.entry("name").or_insert_with(|| Value::from(ctx.name));
    record.entry("kind").or_insert_with(|| Value::from(ctx.kind));
    record.entry("version").or_insert_with(|| Value::from("1.0"));
    for key in ["created_at", "last_modified_at", "last_accessed_at", "last_triggered_at"] {
        if let Some(Value::String(stamp)) = record.get_mut(key)
            && let Some(fixed) = naive_to_rfc3339(stamp)
        {
            *stamp = fixed;
        }
    }
}

fn rename(record: &mut Map<String, Value>, old: &str, new: &str) {
    if record.contains_key(new) {
        return;
    }
    if let Some(value) = record.remove(old) {
        record.insert(new.to_string(), value);
    }
}

/// Naive timestamps are assumed to be UTC. Anything already valid RFC 3339,
/// or not a timestamp at all, is left untouched.
fn naive_to_rfc3339(stamp: &str) -> Option<String> {
    if OffsetDateTime::parse(stamp, &Rfc3339).is_ok() {
        return None;
    }
    let naive = PrimitiveDateTime::parse(stamp, &Iso8601::DEFAULT).ok()?;
    naive.assume_utc().format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CTX: MigrationContext<'static> = MigrationContext { kind: "model", name: "cube" };

    #[test]
    fn test_legacy_record_is_upgraded() {
        let mut record = json!({
            "path": "assets/models/cube.glb",
            "size": 2048,
            "vertices": 8,
            "faces": 12,
            "materials": 1,
            "animations": 0,
            "created": "2024-03-01T10:20:30.123456",
            "custom_note": "keep me",
        });
        assert!(apply(&CTX, &mut record, ARTIFACT_MIGRATIONS).unwrap());
        assert_eq!(record["source_path"], "assets/models/cube.glb");
        assert_eq!(record["size_bytes"], 2048);
        assert_eq!(record["vertex_count"], 8);
        assert_eq!(record["face_count"], 12);
        assert_eq!(record["material_count"], 1);
        assert_eq!(record["animation_count"], 0);
        assert_eq!(record["name"], "cube");
        assert_eq!(record["kind"], "model");
        assert_eq!(record["version"], "1.0");
        assert_eq!(record["schema"], 1);
        assert_eq!(record["custom_note"], "keep me");
        let created = record["created_at"].as_str().unwrap();
        assert!(OffsetDateTime::parse(created, &Rfc3339).is_ok());
    }

    #[test]
    fn test_material_lists_are_not_renamed() {
        let mut record = json!({ "materials": ["steel"] });
        apply(&CTX, &mut record, ARTIFACT_MIGRATIONS).unwrap();
        assert!(record.get("material_count").is_none());
        assert_eq!(record["materials"], json!(["steel"]));
    }

    #[test]
    fn test_current_records_are_untouched() {
        let mut record = json!({ "schema": CURRENT_SCHEMA, "size": 1 });
        assert!(!apply(&CTX, &mut record, ARTIFACT_MIGRATIONS).unwrap());
        assert_eq!(record["size"], 1);
    }

    #[test]
    fn test_stores_without_migrations_are_untouched() {
        let mut record = json!({ "size": 1 });
        assert!(!apply(&CTX, &mut record, &[]).unwrap());
        assert!(record.get("schema").is_none());
    }

    #[test]
    fn test_non_object_is_rejected() {
        let mut record = json!([1, 2, 3]);
        assert_eq!(apply(&CTX, &mut record, ARTIFACT_MIGRATIONS), Err(NotAnObject));
    }
}
