//! JSON Schema wrapper used to validate capability payloads and context args.

use crate::error::{Error, Result, SchemaViolation};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A compiled JSON Schema plus its source document.
///
/// `Schema::any()` accepts every value and skips compilation.
#[derive(Clone)]
pub struct Schema {
    source: Value,
    compiled: Option<Arc<JSONSchema>>,
}

impl Schema {
    /// A schema that accepts anything.
    pub fn any() -> Self {
        Self {
            source: Value::Bool(true),
            compiled: None,
        }
    }

    /// Compile a schema document.
    pub fn new(source: Value) -> Result<Self> {
        if source == Value::Bool(true) {
            return Ok(Self::any());
        }
        let compiled = JSONSchema::compile(&source)
            .map_err(|e| Error::config(format!("invalid JSON schema: {e}")))?;
        Ok(Self {
            source,
            compiled: Some(Arc::new(compiled)),
        })
    }

    /// `{"type": "string"}`
    pub fn string() -> Self {
        // A literal schema always compiles
        Self::new(serde_json::json!({ "type": "string" })).unwrap_or_else(|_| Self::any())
    }

    pub fn source(&self) -> &Value {
        &self.source
    }

    pub fn is_any(&self) -> bool {
        self.compiled.is_none()
    }

    /// Validate an instance, collecting every violation.
    pub fn validate(&self, instance: &Value) -> std::result::Result<(), Vec<SchemaViolation>> {
        let Some(compiled) = &self.compiled else {
            return Ok(());
        };
        compiled.validate(instance).map_err(|errors| {
            errors
                .map(|e| SchemaViolation {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect()
        })
    }

    /// The declared `type` of a top-level property, if any.
    pub fn property_type(&self, key: &str) -> Option<&str> {
        self.source
            .get("properties")
            .and_then(|p| p.get(key))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }

    /// The schema's own declared `type`, if any.
    pub fn root_type(&self) -> Option<&str> {
        self.source.get("type").and_then(Value::as_str)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("source", &self.source).finish()
    }
}
