//! Declared recipe options and `--key=value` invocation overrides.
//!
//! Declared options are typed and validated when the command line is parsed.
//! Undeclared keys are accepted as plain strings and land in the env as-is.
//! The `tasks` key is reserved: `--tasks=a,b` appends tasks to the pipeline.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::env::Env;
use crate::error::{Error, Result};

pub const EXTRA_TASKS_KEY: &str = "tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    #[default]
    String,
    Bool,
    Integer,
    List,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSpec {
    #[serde(default, rename = "type")]
    pub kind: OptionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Applied when neither host env nor the command line sets the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Declared options keyed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSchema {
    options: BTreeMap<String, OptionSpec>,
}

/// Parsed invocation overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub env: Env,
    pub extra_tasks: Vec<String>,
}

fn override_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^--([A-Za-z_][A-Za-z0-9_.:-]*)(?:=(.*))?$").expect("override regex is valid")
    })
}

impl OptionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.options.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionSpec)> {
        self.options.iter()
    }

    /// Check declared defaults against their declared types.
    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.options {
            if let Some(default) = &spec.default {
                normalize(name, spec.kind, &json_to_raw(default))?;
            }
        }
        Ok(())
    }

    /// Declared defaults as env entries, normalized to their types.
    pub fn defaults(&self) -> Result<Env> {
        let mut env = Env::new();
        for (name, spec) in &self.options {
            if let Some(default) = &spec.default {
                env.set(name, normalize(name, spec.kind, &json_to_raw(default))?);
            }
        }
        Ok(env)
    }

    /// Parse `--key=value` and bare `--flag` arguments.
    ///
    /// A bare `--flag` means `true` and is only allowed for undeclared keys
    /// or declared bools. Repeated keys keep the last value, except
    /// `--tasks`, which accumulates.
    pub fn parse_overrides<S: AsRef<str>>(&self, args: &[S]) -> Result<Overrides> {
        let mut overrides = Overrides::default();

        for arg in args {
            let arg = arg.as_ref();
            if arg == "--" {
                continue;
            }
            let caps = override_regex().captures(arg).ok_or_else(|| {
                Error::validation_invalid_argument(
                    "override",
                    format!("Expected --key=value, got '{}'", arg),
                )
            })?;
            let key = &caps[1];
            let raw = caps.get(2).map(|m| m.as_str());

            if key == EXTRA_TASKS_KEY {
                let value = raw.unwrap_or_default();
                overrides.extra_tasks.extend(split_list(value));
                continue;
            }

            let value = match (self.options.get(key), raw) {
                (Some(spec), Some(raw)) => normalize(key, spec.kind, raw)?,
                (Some(spec), None) if spec.kind == OptionKind::Bool => "true".to_string(),
                (Some(_), None) => {
                    return Err(Error::validation_invalid_argument(
                        key,
                        format!("Option --{} needs a value (--{}=...)", key, key),
                    ))
                }
                (None, Some(raw)) => raw.to_string(),
                (None, None) => "true".to_string(),
            };
            overrides.env.set(key, value);
        }

        Ok(overrides)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn json_to_raw(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(json_to_raw)
            .collect::<Vec<_>>()
            .join(","),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Validate `raw` against `kind` and return its canonical string form.
fn normalize(key: &str, kind: OptionKind, raw: &str) -> Result<String> {
    match kind {
        OptionKind::String => Ok(raw.to_string()),
        OptionKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok("true".to_string()),
            "false" | "0" | "no" | "off" => Ok("false".to_string()),
            _ => Err(Error::validation_invalid_argument(
                key,
                format!("Expected a boolean for --{}, got '{}'", key, raw),
            )),
        },
        OptionKind::Integer => raw
            .trim()
            .parse::<i64>()
            .map(|n| n.to_string())
            .map_err(|_| {
                Error::validation_invalid_argument(
                    key,
                    format!("Expected an integer for --{}, got '{}'", key, raw),
                )
            }),
        OptionKind::List => Ok(split_list(raw).join(",")),
    }
}
