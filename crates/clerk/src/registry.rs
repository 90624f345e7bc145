//! The closed set of tools this adapter advertises, with their parameter
//! contracts, and the declarative argument validator driven by them. Adding
//! a tool means adding a descriptor here and a handler arm in `tools`.

use std::time::Duration;

/// Decoded-size ceiling for uploaded content.
pub const MAX_UPLOAD_BYTES: u64 = 1 << 30; // 1 GiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    /// ISO 8601 calendar date, `YYYY-MM-DD`.
    Date,
    Enum(&'static [&'static str]),
    /// Base64-encoded bytes with a decoded-size ceiling, enforced against
    /// the encoded length before any decode is attempted.
    Base64 { max_decoded: u64 },
}

impl ParamType {
    fn tag(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Date => "date",
            ParamType::Enum(_) => "enum",
            ParamType::Base64 { .. } => "base64-bytes",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub result: &'static str,
    pub params: &'static [ParamSpec],
    /// Mutating tools bypass the response cache.
    pub mutating: bool,
    /// None defers to the configured default TTL; zero disables caching
    /// for the tool.
    pub cache_ttl: Option<Duration>,
    /// When non-empty, at least one of the named parameters must be bound.
    pub requires_one_of: &'static [&'static str],
}

const STATUS_VALUES: &[&str] = &["open", "closed", "overdue"];
const PERIOD_VALUES: &[&str] = &["week", "month"];

const fn required(name: &'static str, ty: ParamType) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required: true,
    }
}

const fn optional(name: &'static str, ty: ParamType) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required: false,
    }
}

pub static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "listTasks",
        description: "List the tasks of a project, optionally filtered by status.",
        result: "{tasks: [{id, name, owner, status, due-date, url}]}",
        params: &[
            required("project-id", ParamType::String),
            optional("status", ParamType::Enum(STATUS_VALUES)),
        ],
        mutating: false,
        cache_ttl: Some(Duration::from_secs(60)),
        requires_one_of: &[],
    },
    ToolSpec {
        name: "createTask",
        description: "Create a task in a project. Identical creates within a short window \
                      return the task produced by the first.",
        result: "{task-id}",
        params: &[
            required("project-id", ParamType::String),
            required("name", ParamType::String),
            optional("owner", ParamType::String),
            optional("due-date", ParamType::Date),
        ],
        mutating: true,
        cache_ttl: None,
        requires_one_of: &[],
    },
    ToolSpec {
        name: "updateTask",
        description: "Update a task's status, due date or owner.",
        result: "{ok: true}",
        params: &[
            required("task-id", ParamType::String),
            optional("status", ParamType::Enum(STATUS_VALUES)),
            optional("due-date", ParamType::Date),
            optional("owner", ParamType::String),
        ],
        mutating: true,
        cache_ttl: None,
        requires_one_of: &["status", "due-date", "owner"],
    },
    ToolSpec {
        name: "getTaskDetail",
        description: "Fetch one task with its comments and change history.",
        result: "{id, name, description, status, owner, due-date, comments, history}",
        params: &[required("task-id", ParamType::String)],
        mutating: false,
        cache_ttl: Some(Duration::from_secs(30)),
        requires_one_of: &[],
    },
    ToolSpec {
        name: "getProjectSummary",
        description: "Aggregate task counts and completion rate for a project.",
        result: "{project-id, total-tasks, completion-rate, overdue-count}",
        params: &[
            required("project-id", ParamType::String),
            optional("period", ParamType::Enum(PERIOD_VALUES)),
        ],
        mutating: false,
        // Derived from cacheable constituent reads; the summary itself is
        // recomputed per call.
        cache_ttl: Some(Duration::ZERO),
        requires_one_of: &[],
    },
    ToolSpec {
        name: "downloadFile",
        description: "Obtain a short-lived pre-signed download URL for a file.",
        result: "{file-url, expires-at}",
        params: &[required("file-id", ParamType::String)],
        mutating: false,
        cache_ttl: Some(Duration::ZERO),
        requires_one_of: &[],
    },
    ToolSpec {
        name: "uploadReviewSheet",
        description: "Upload a review sheet into a project folder.",
        result: "{file-id}",
        params: &[
            required("project-id", ParamType::String),
            required("folder-id", ParamType::String),
            required("name", ParamType::String),
            required(
                "content-base64",
                ParamType::Base64 {
                    max_decoded: MAX_UPLOAD_BYTES,
                },
            ),
        ],
        mutating: true,
        cache_ttl: None,
        requires_one_of: &[],
    },
    ToolSpec {
        name: "searchFiles",
        description: "Search files by name, optionally scoped to a folder.",
        result: "{files: [{id, name, path}]}",
        params: &[
            required("query", ParamType::String),
            optional("folder-id", ParamType::String),
        ],
        mutating: false,
        cache_ttl: Some(Duration::from_secs(30)),
        requires_one_of: &[],
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|spec| spec.name == name)
}

/// The advertised manifest. This is the same descriptor set `listTools`
/// returns; the set of names is closed and equal to it.
pub fn manifest() -> serde_json::Value {
    let tools: Vec<serde_json::Value> = TOOLS.iter().map(descriptor).collect();
    serde_json::json!({ "tools": tools })
}

fn descriptor(spec: &ToolSpec) -> serde_json::Value {
    let params: Vec<serde_json::Value> = spec
        .params
        .iter()
        .map(|p| {
            let mut d = serde_json::json!({
                "name": p.name,
                "type": p.ty.tag(),
                "required": p.required,
            });
            if let ParamType::Enum(values) = p.ty {
                d["values"] = serde_json::json!(values);
            }
            d
        })
        .collect();
    serde_json::json!({
        "name": spec.name,
        "description": spec.description,
        "parameters": params,
        "result": spec.result,
        "mutating": spec.mutating,
    })
}

/// Validate named arguments against a tool's contract. The returned message
/// names the offending parameter.
pub fn validate(
    spec: &ToolSpec,
    args: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), String> {
    for name in args.keys() {
        if !spec.params.iter().any(|p| p.name == name) {
            return Err(format!("unknown parameter {name}"));
        }
    }

    for param in spec.params {
        match args.get(param.name) {
            None if param.required => {
                return Err(format!("missing required parameter {}", param.name))
            }
            None => {}
            Some(value) => validate_value(param, value)?,
        }
    }

    if !spec.requires_one_of.is_empty()
        && !spec.requires_one_of.iter().any(|name| args.contains_key(*name))
    {
        return Err(format!(
            "at least one of {} is required",
            spec.requires_one_of.join(", ")
        ));
    }

    Ok(())
}

fn validate_value(param: &ParamSpec, value: &serde_json::Value) -> Result<(), String> {
    let name = param.name;
    match param.ty {
        ParamType::String => {
            let s = as_string(name, value)?;
            if s.trim().is_empty() {
                return Err(format!("parameter {name} must not be empty"));
            }
        }
        ParamType::Integer => {
            if !value.is_i64() && !value.is_u64() {
                return Err(format!("parameter {name} must be an integer"));
            }
        }
        ParamType::Date => {
            let s = as_string(name, value)?;
            let format = time::macros::format_description!("[year]-[month]-[day]");
            if time::Date::parse(s, &format).is_err() {
                return Err(format!(
                    "parameter {name} must be an ISO 8601 date (YYYY-MM-DD)"
                ));
            }
        }
        ParamType::Enum(values) => {
            let s = as_string(name, value)?;
            if !values.contains(&s) {
                return Err(format!(
                    "parameter {name} must be one of {}",
                    values.join(", ")
                ));
            }
        }
        ParamType::Base64 { max_decoded } => {
            let s = as_string(name, value)?;
            if s.is_empty() {
                return Err(format!("parameter {name} must not be empty"));
            }
            // Four encoded bytes carry three decoded ones, so the encoded
            // length bounds the decoded size without decoding.
            let max_encoded = (max_decoded + 2) / 3 * 4;
            if s.len() as u64 > max_encoded {
                return Err(format!(
                    "parameter {name} exceeds the {} byte size ceiling",
                    max_decoded
                ));
            }
            if let Some(bad) = s
                .bytes()
                .find(|b| !b.is_ascii_alphanumeric() && !matches!(b, b'+' | b'/' | b'='))
            {
                return Err(format!(
                    "parameter {name} is not valid base64 (byte {bad:#x})"
                ));
            }
        }
    }
    Ok(())
}

fn as_string<'v>(name: &str, value: &'v serde_json::Value) -> Result<&'v str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("parameter {name} must be a string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &str) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::from_str(raw).unwrap() {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn manifest_is_closed_over_the_registered_tools() {
        let manifest = manifest();
        let names: Vec<&str> = manifest["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "listTasks",
                "createTask",
                "updateTask",
                "getTaskDetail",
                "getProjectSummary",
                "downloadFile",
                "uploadReviewSheet",
                "searchFiles",
            ]
        );
        for name in &names {
            assert!(find(name).is_some());
        }
        assert!(find("dropDatabase").is_none());
    }

    #[test]
    fn unknown_and_missing_parameters_are_rejected() {
        let spec = find("listTasks").unwrap();

        let err = validate(spec, &args(r#"{"project-id": "P1", "colour": "red"}"#)).unwrap_err();
        assert!(err.contains("colour"), "{err}");

        let err = validate(spec, &args(r#"{"status": "open"}"#)).unwrap_err();
        assert!(err.contains("project-id"), "{err}");

        assert!(validate(spec, &args(r#"{"project-id": "P1"}"#)).is_ok());
    }

    #[test]
    fn empty_strings_are_rejected() {
        let spec = find("listTasks").unwrap();
        let err = validate(spec, &args(r#"{"project-id": "  "}"#)).unwrap_err();
        assert!(err.contains("project-id"), "{err}");
    }

    #[test]
    fn enum_values_outside_the_declared_set_are_rejected() {
        let spec = find("listTasks").unwrap();
        let err =
            validate(spec, &args(r#"{"project-id": "P1", "status": "paused"}"#)).unwrap_err();
        assert!(err.contains("status"), "{err}");
        assert!(err.contains("open, closed, overdue"), "{err}");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let spec = find("createTask").unwrap();
        let ok = r#"{"project-id": "P1", "name": "Review", "due-date": "2026-02-28"}"#;
        assert!(validate(spec, &args(ok)).is_ok());

        for bad in ["28/02/2026", "2026-13-01", "2026-02-30", "tomorrow"] {
            let raw = format!(r#"{{"project-id": "P1", "name": "Review", "due-date": "{bad}"}}"#);
            let err = validate(spec, &args(&raw)).unwrap_err();
            assert!(err.contains("due-date"), "{bad}: {err}");
        }
    }

    #[test]
    fn update_task_requires_at_least_one_field() {
        let spec = find("updateTask").unwrap();
        let err = validate(spec, &args(r#"{"task-id": "T1"}"#)).unwrap_err();
        assert!(err.contains("status, due-date, owner"), "{err}");

        assert!(validate(spec, &args(r#"{"task-id": "T1", "status": "closed"}"#)).is_ok());
    }

    #[test]
    fn oversized_uploads_are_rejected_by_encoded_length_alone() {
        let param = ParamSpec {
            name: "content-base64",
            ty: ParamType::Base64 { max_decoded: 12 },
            required: true,
        };
        // 18 decoded bytes encode to 24; over the 12-byte ceiling.
        let value = serde_json::Value::String("QUFBQUFBQUFBQUFBQUFBQUFB".to_string());
        let err = validate_value(&param, &value).unwrap_err();
        assert!(err.contains("content-base64"), "{err}");
        assert!(err.contains("size ceiling"), "{err}");

        // 9 decoded bytes encode to 12; within the ceiling.
        let value = serde_json::Value::String("QUFBQUFBQUFB".to_string());
        assert!(validate_value(&param, &value).is_ok());
    }

    #[test]
    fn base64_with_foreign_bytes_is_rejected() {
        let param = ParamSpec {
            name: "content-base64",
            ty: ParamType::Base64 { max_decoded: 1024 },
            required: true,
        };
        let value = serde_json::Value::String("not base64!".to_string());
        let err = validate_value(&param, &value).unwrap_err();
        assert!(err.contains("content-base64"), "{err}");
    }

    #[test]
    fn integers_are_type_checked() {
        let param = ParamSpec {
            name: "limit",
            ty: ParamType::Integer,
            required: true,
        };
        assert!(validate_value(&param, &serde_json::json!(10)).is_ok());
        assert!(validate_value(&param, &serde_json::json!("10")).is_err());
        assert!(validate_value(&param, &serde_json::json!(1.5)).is_err());
    }
}
