//! JSON-schema payload validation
//!
//! Loads every schema found in a configured directory at startup and
//! validates event payloads against them. An event is considered valid if
//! any registered schema accepts it; the pipeline only needs the boolean.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use tanq_ports::Validator;

/// Errors constructing the validator. All fatal: a configured schema
/// directory that cannot be loaded aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read schema directory '{dir}': {source}")]
    ReadDir {
        dir: String,
        source: std::io::Error,
    },

    #[error("failed to read schema file '{file}': {source}")]
    ReadFile {
        file: String,
        source: std::io::Error,
    },

    #[error("schema '{file}' is not valid JSON: {reason}")]
    Parse { file: String, reason: String },

    #[error("failed to compile schema '{file}': {reason}")]
    Compile { file: String, reason: String },

    #[error("no schemas found in '{dir}'")]
    Empty { dir: String },
}

/// Validator holding the compiled schemas, indexed by their `$id` (or file
/// name for schemas without one).
pub struct SchemaValidator {
    schemas: HashMap<String, jsonschema::Validator>,
}

impl SchemaValidator {
    /// Compile every `.json` file in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::ReadDir {
            dir: dir.display().to_string(),
            source,
        })?;

        let mut schemas = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| SchemaError::ReadDir {
                dir: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let file = path.display().to_string();
            let raw =
                std::fs::read(&path).map_err(|source| SchemaError::ReadFile {
                    file: file.clone(),
                    source,
                })?;
            let schema: serde_json::Value =
                serde_json::from_slice(&raw).map_err(|e| SchemaError::Parse {
                    file: file.clone(),
                    reason: e.to_string(),
                })?;

            let id = schema
                .get("$id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| file.clone());

            let compiled =
                jsonschema::validator_for(&schema).map_err(|e| SchemaError::Compile {
                    file: file.clone(),
                    reason: e.to_string(),
                })?;

            debug!(id = %id, file = %file, "Registered schema");
            schemas.insert(id, compiled);
        }

        if schemas.is_empty() {
            return Err(SchemaError::Empty {
                dir: dir.display().to_string(),
            });
        }

        Ok(Self { schemas })
    }

    /// Validate against the schema registered under `id`.
    pub fn validate_with_id(&self, data: &[u8], id: &str) -> bool {
        let Some(schema) = self.schemas.get(id) else {
            warn!(id = %id, "Requested schema not found");
            return false;
        };
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
            warn!("Payload is not valid JSON");
            return false;
        };
        schema.is_valid(&value)
    }

    /// Registered schema ids.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

impl Validator for SchemaValidator {
    /// A payload is valid if any registered schema accepts it.
    fn validate(&self, data: &[u8]) -> bool {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
            debug!("Payload is not valid JSON");
            return false;
        };
        for (id, schema) in &self.schemas {
            if schema.is_valid(&value) {
                debug!(id = %id, "Validation match");
                return true;
            }
        }
        false
    }
}
