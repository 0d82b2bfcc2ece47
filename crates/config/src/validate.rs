//! Configuration validation engine.
//!
//! Parses a config file, flags unknown or misspelled fields, and reports
//! semantic problems (zero limits, bad weights, missing credentials).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::{env_subst::substitute_env, schema::BrainProxyConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "value", "security", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "retrieval.top_k"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Struct};

    let section = |keys: &[&'static str]| Struct(keys.iter().map(|k| (*k, Leaf)).collect());

    Struct(HashMap::from([
        ("server", section(&["bind", "port", "body_limit_mb"])),
        (
            "upstream",
            section(&["base_url", "api_key", "default_model", "timeout_secs"]),
        ),
        ("storage", section(&["dir", "index_db"])),
        ("ingest", section(&["max_upload_mb"])),
        ("retrieval", section(&["top_k"])),
        ("memory", section(&["enabled", "top_k", "extraction_model"])),
        (
            "embeddings",
            section(&[
                "enabled",
                "base_url",
                "api_key",
                "model",
                "dimensions",
                "vector_weight",
                "keyword_weight",
            ]),
        ),
        ("auth", section(&["api_keys"])),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or the discovered one if `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => {
            let format = actual_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("toml");
            validate_str(&substitute_env(&content), format)
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate config text in the given format (`toml`, `yaml`/`yml`, `json`).
#[must_use]
pub fn validate_str(raw: &str, format: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let value = match parse_value(raw, format) {
        Ok(v) => v,
        Err(message) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message,
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown fields
    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    // 3. Types, then semantics on the parsed config
    match serde_json::from_value::<BrainProxyConfig>(value) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Validate a TOML string.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    validate_str(toml_str, "toml")
}

fn parse_value(raw: &str, format: &str) -> Result<Value, String> {
    match format {
        "toml" => toml::from_str::<toml::Value>(raw)
            .map_err(|e| format!("TOML syntax error: {e}"))
            .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        "yaml" | "yml" => {
            let v: Value =
                serde_yaml::from_str(raw).map_err(|e| format!("YAML syntax error: {e}"))?;
            // An empty YAML document parses as null.
            Ok(if v.is_null() {
                Value::Object(Default::default())
            } else {
                v
            })
        },
        "json" => serde_json::from_str(raw).map_err(|e| format!("JSON syntax error: {e}")),
        other => Err(format!("unsupported config format: .{other}")),
    }
}

fn check_unknown_fields(
    value: &Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (Value::Object(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };
    let known: Vec<&str> = fields.keys().copied().collect();
    for (key, child) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if let Some(child_schema) = fields.get(key.as_str()) {
            check_unknown_fields(child, child_schema, &path, diagnostics);
            continue;
        }
        let message = match suggest(key, &known, 3) {
            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
            None => "unknown field".to_string(),
        };
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "unknown-field",
            path,
            message,
        });
    }
}

fn check_semantics(config: &BrainProxyConfig, diagnostics: &mut Vec<Diagnostic>) {
    let mut push = |severity, category, path: &str, message: String| {
        diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.into(),
            message,
        });
    };

    if config.server.port == 0 {
        push(
            Severity::Error,
            "value",
            "server.port",
            "port must be non-zero".into(),
        );
    }
    if config.retrieval.top_k == 0 {
        push(
            Severity::Error,
            "value",
            "retrieval.top_k",
            "top_k must be at least 1".into(),
        );
    }
    if config.memory.enabled && config.memory.top_k == 0 {
        push(
            Severity::Error,
            "value",
            "memory.top_k",
            "top_k must be at least 1 when memory is enabled".into(),
        );
    }
    if config.ingest.max_upload_mb == 0 {
        push(
            Severity::Error,
            "value",
            "ingest.max_upload_mb",
            "upload ceiling of 0 rejects every attachment".into(),
        );
    }
    for (path, weight) in [
        ("embeddings.vector_weight", config.embeddings.vector_weight),
        ("embeddings.keyword_weight", config.embeddings.keyword_weight),
    ] {
        if !(0.0..=1.0).contains(&weight) {
            push(
                Severity::Error,
                "value",
                path,
                format!("weight {weight} is outside 0..=1"),
            );
        }
    }

    if config.upstream.api_key.is_none() {
        push(
            Severity::Warning,
            "security",
            "upstream.api_key",
            "no upstream API key configured; requests are forwarded unauthenticated".into(),
        );
    }
    if config.embeddings.enabled
        && config.embeddings.api_key.is_none()
        && config.upstream.api_key.is_none()
    {
        push(
            Severity::Error,
            "value",
            "embeddings.api_key",
            "embeddings are enabled but no API key is available".into(),
        );
    }

    let is_localhost = matches!(config.server.bind.as_str(), "127.0.0.1" | "localhost" | "::1");
    if config.auth.api_keys.is_empty() && !is_localhost {
        push(
            Severity::Warning,
            "security",
            "auth.api_keys",
            format!(
                "no API keys configured while binding to {}",
                config.server.bind
            ),
        );
    }
}
