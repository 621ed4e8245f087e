//! Desired manifest document
//!
//! The manifest is an open JSON object. fleetd only reads the fields it needs
//! (`environment`, `runtime`, `env`, `secrets`, `tools`, `skills`) and leaves
//! everything else untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::errors::FleetError;
use crate::utils::sha256_hash;

/// Promotion environments, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Next environment in the dev -> staging -> prod chain
    pub fn next(&self) -> Option<Environment> {
        match self {
            Environment::Dev => Some(Environment::Staging),
            Environment::Staging => Some(Environment::Prod),
            Environment::Prod => None,
        }
    }

    pub fn prev(&self) -> Option<Environment> {
        match self {
            Environment::Dev => None,
            Environment::Staging => Some(Environment::Dev),
            Environment::Prod => Some(Environment::Staging),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" | "stage" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(FleetError::ValidationError(format!(
                "Unknown environment: {}",
                other
            ))),
        }
    }
}

/// Container resource limits read from `runtime`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
}

/// A parsed desired manifest
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    root: Map<String, Value>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a manifest document; the root must be a JSON object
    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| FleetError::ManifestError(format!("invalid manifest JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, FleetError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            other => Err(FleetError::ManifestError(format!(
                "manifest root must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn to_json(&self) -> String {
        // Serializing a Map<String, Value> cannot fail
        serde_json::to_string(&self.root).unwrap_or_else(|_| "{}".to_string())
    }

    /// Stable digest; `serde_json::Map` keeps keys sorted
    pub fn digest(&self) -> String {
        sha256_hash(self.to_json().as_bytes())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.root.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// Mutable object at `path`, creating intermediate objects. Non-object
    /// values in the way are replaced.
    pub fn object_at_mut(&mut self, path: &[&str]) -> &mut Map<String, Value> {
        let mut current = &mut self.root;
        for key in path {
            let entry = current
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just replaced by an object"),
            };
        }
        current
    }

    pub fn environment(&self) -> Option<&str> {
        self.root.get("environment").and_then(Value::as_str)
    }

    pub fn set_environment(&mut self, environment: Environment) {
        self.root.insert(
            "environment".to_string(),
            Value::String(environment.as_str().to_string()),
        );
    }

    /// Container image from `runtime.image`
    pub fn image(&self) -> Option<&str> {
        self.get_path(&["runtime", "image"]).and_then(Value::as_str)
    }

    pub fn resources(&self) -> ResourceLimits {
        ResourceLimits {
            cpus: self.get_path(&["runtime", "cpus"]).and_then(Value::as_f64),
            memory_mb: self.get_path(&["runtime", "memoryMb"]).and_then(Value::as_u64),
        }
    }

    /// Plain environment variables from `env`; non-string values are stringified
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(Value::Object(map)) = self.root.get("env") {
            for (key, value) in map {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.insert(key.clone(), value);
            }
        }
        env
    }

    /// Secret keys to attach from the instance's secret store
    pub fn secret_keys(&self) -> Vec<String> {
        self.root
            .get("secrets")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
