//! Schema validation for job recipes.
//!
//! The recipe is the only operator-controlled input that reaches hardware, so
//! everything is checked up front and all problems are reported in one pass.
//! Malformed JSON is the single system-error case; every other violation
//! becomes a `FieldError` suitable for a 400 response body.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

lazy_static! {
    static ref TASK_TARGET_RE: Regex = Regex::new(r"^[A-Za-z0-9_.-]+\.target$").unwrap();
    static ref SCHEMA_VERSION_RE: Regex = Regex::new(r"^1(\.[0-9]+)?$").unwrap();
    // host[:port]/path(:tag|@digest)? -- a heuristic, not a full OCI parser.
    static ref OCI_URL_RE: Regex = Regex::new(
        r"^[A-Za-z0-9][A-Za-z0-9.-]*(:[0-9]+)?(/[A-Za-z0-9._-]+)+((:[A-Za-z0-9._-]+)|(@[A-Za-z0-9-]+:[0-9A-Fa-f]+))?$"
    )
    .unwrap();
    static ref PARTITION_SIZE_RE: Regex =
        Regex::new(r"^([1-9][0-9]*[KMGTP][iB]?|100%)$").unwrap();
    static ref TYPE_GUID_SHORT_RE: Regex = Regex::new(r"^[0-9A-Fa-f]{4}$").unwrap();
    static ref TYPE_GUID_FULL_RE: Regex = Regex::new(
        r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$"
    )
    .unwrap();
}

const KNOWN_FIELDS: &[&str] = &[
    "task_target",
    "target_disk",
    "schema_version",
    "oci_url",
    "wim_index",
    "firmware_url",
    "partition_layout",
    "user_data",
    "unattend_xml",
    "ks.cfg",
    "env",
    "notes",
];

const PAYLOAD_FIELDS: &[&str] = &["user_data", "unattend_xml", "ks.cfg"];
const PAYLOAD_SOURCES: &[&str] = &["content", "url", "path"];
const PARTITION_FIELDS: &[&str] = &["size", "type_guid", "format", "label", "mountpoint", "bootable"];
const PARTITION_FORMATS: &[&str] = &["vfat", "ext4", "xfs", "ntfs", "swap", "raw", "none"];
const NOTES_MAX_LEN: usize = 2000;
const LABEL_MAX_LEN: usize = 32;

/// Validate raw recipe bytes.
///
/// `Err` only for JSON that fails to parse; all schema violations come back
/// as the (possibly empty) error list.
pub fn validate_recipe(raw: &[u8]) -> Result<Vec<FieldError>, serde_json::Error> {
    let value: Value = serde_json::from_slice(raw)?;
    Ok(validate_value(&value))
}

/// Validate an already-parsed recipe.
pub fn validate_value(value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();

    let Some(recipe) = value.as_object() else {
        return vec![FieldError::new("root", "must be a JSON object")];
    };

    for key in recipe.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            errors.push(FieldError::new(key.clone(), "unknown field"));
        }
    }

    check_required_string(recipe, "task_target", &mut errors, |v, errors| {
        if !TASK_TARGET_RE.is_match(v) {
            errors.push(FieldError::new(
                "task_target",
                "must match *.target using [A-Za-z0-9_.-]",
            ));
        }
    });

    check_required_string(recipe, "target_disk", &mut errors, |v, errors| {
        if v.is_empty() {
            errors.push(FieldError::new("target_disk", "must not be empty"));
        }
    });

    if let Some(v) = recipe.get("schema_version") {
        match v.as_str() {
            Some(s) if SCHEMA_VERSION_RE.is_match(s) => {}
            _ => errors.push(FieldError::new(
                "schema_version",
                "must match 1 or 1.<minor>",
            )),
        }
    }

    if let Some(v) = recipe.get("oci_url") {
        match v.as_str() {
            Some(s) if OCI_URL_RE.is_match(s) => {}
            _ => errors.push(FieldError::new(
                "oci_url",
                "must look like host[:port]/path[:tag|@digest]",
            )),
        }
    }

    if let Some(v) = recipe.get("wim_index") {
        let ok = (v.is_i64() || v.is_u64()) && v.as_i64().map(|n| n >= 1).unwrap_or(v.is_u64());
        if !ok {
            errors.push(FieldError::new("wim_index", "must be an integer >= 1"));
        }
    }

    if let Some(v) = recipe.get("firmware_url") {
        match v.as_str() {
            Some(s) if !s.is_empty() => {}
            _ => errors.push(FieldError::new("firmware_url", "must be a non-empty string")),
        }
    }

    if let Some(v) = recipe.get("partition_layout") {
        validate_partition_layout(v, &mut errors);
    }

    for field in PAYLOAD_FIELDS {
        if let Some(v) = recipe.get(*field) {
            validate_payload(field, v, &mut errors);
        }
    }

    if let Some(v) = recipe.get("env") {
        match v.as_object() {
            Some(map) => {
                for (key, value) in map {
                    if !value.is_string() {
                        errors.push(FieldError::new(
                            format!("env.{key}"),
                            "must be a string",
                        ));
                    }
                }
            }
            None => errors.push(FieldError::new("env", "must be a map of string to string")),
        }
    }

    if let Some(v) = recipe.get("notes") {
        match v.as_str() {
            Some(s) if s.chars().count() <= NOTES_MAX_LEN => {}
            Some(_) => errors.push(FieldError::new(
                "notes",
                format!("must be at most {NOTES_MAX_LEN} characters"),
            )),
            None => errors.push(FieldError::new("notes", "must be a string")),
        }
    }

    errors
}

fn check_required_string(
    recipe: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
    check: impl FnOnce(&str, &mut Vec<FieldError>),
) {
    match recipe.get(field) {
        None => errors.push(FieldError::new(field, "required")),
        Some(v) => match v.as_str() {
            Some(s) => check(s, errors),
            None => errors.push(FieldError::new(field, "must be a string")),
        },
    }
}

fn validate_partition_layout(value: &Value, errors: &mut Vec<FieldError>) {
    let Some(entries) = value.as_array() else {
        errors.push(FieldError::new("partition_layout", "must be an array"));
        return;
    };
    if entries.is_empty() {
        errors.push(FieldError::new("partition_layout", "must not be empty"));
        return;
    }

    for (idx, entry) in entries.iter().enumerate() {
        let path = |field: &str| format!("partition_layout[{idx}].{field}");

        let Some(partition) = entry.as_object() else {
            errors.push(FieldError::new(
                format!("partition_layout[{idx}]"),
                "must be an object",
            ));
            continue;
        };

        for key in partition.keys() {
            if !PARTITION_FIELDS.contains(&key.as_str()) {
                errors.push(FieldError::new(path(key), "unknown field"));
            }
        }

        match partition.get("size").and_then(Value::as_str) {
            Some(size) if PARTITION_SIZE_RE.is_match(size) => {}
            Some(_) => errors.push(FieldError::new(
                path("size"),
                "must match <digits><K|M|G|T|P>[i|B] or 100%",
            )),
            None => errors.push(FieldError::new(path("size"), "required")),
        }

        if let Some(v) = partition.get("type_guid") {
            match v.as_str() {
                Some(s) if TYPE_GUID_SHORT_RE.is_match(s) || TYPE_GUID_FULL_RE.is_match(s) => {}
                _ => errors.push(FieldError::new(
                    path("type_guid"),
                    "must be 4 hex digits or a full GUID",
                )),
            }
        }

        if let Some(v) = partition.get("format") {
            match v.as_str() {
                Some(s) if PARTITION_FORMATS.contains(&s) => {}
                _ => errors.push(FieldError::new(
                    path("format"),
                    "must be one of vfat, ext4, xfs, ntfs, swap, raw, none",
                )),
            }
        }

        if let Some(v) = partition.get("label") {
            match v.as_str() {
                Some(s) if s.chars().count() <= LABEL_MAX_LEN => {}
                Some(_) => errors.push(FieldError::new(
                    path("label"),
                    format!("must be at most {LABEL_MAX_LEN} characters"),
                )),
                None => errors.push(FieldError::new(path("label"), "must be a string")),
            }
        }

        if let Some(v) = partition.get("mountpoint") {
            match v.as_str() {
                Some(s) if !s.is_empty() => {}
                _ => errors.push(FieldError::new(
                    path("mountpoint"),
                    "must be a non-empty string",
                )),
            }
        }

        if let Some(v) = partition.get("bootable") {
            if !v.is_boolean() {
                errors.push(FieldError::new(path("bootable"), "must be a boolean"));
            }
        }
    }
}

fn validate_payload(field: &str, value: &Value, errors: &mut Vec<FieldError>) {
    match value {
        Value::String(_) => {}
        Value::Object(map) => {
            for key in map.keys() {
                if !PAYLOAD_SOURCES.contains(&key.as_str()) {
                    errors.push(FieldError::new(format!("{field}.{key}"), "unknown field"));
                }
            }

            let sources: Vec<&str> = PAYLOAD_SOURCES
                .iter()
                .copied()
                .filter(|s| map.contains_key(*s))
                .collect();
            if sources.len() != 1 {
                errors.push(FieldError::new(
                    field,
                    "must contain exactly one of content, url, path",
                ));
                return;
            }

            let source = sources[0];
            match map.get(source).and_then(Value::as_str) {
                Some(s) if !s.is_empty() => {}
                _ => errors.push(FieldError::new(
                    format!("{field}.{source}"),
                    "must be a non-empty string",
                )),
            }
        }
        _ => errors.push(FieldError::new(
            field,
            "must be a string or an object with one of content, url, path",
        )),
    }
}
