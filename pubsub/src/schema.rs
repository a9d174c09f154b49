//! Schema registry types and message validation.
//!
//! Only JSON schemas are validated; AVRO and protocol-buffer schemas are
//! accepted into the registry but `validate_message` on them fails with
//! `Unimplemented`. Validation is dispatched through a named validator
//! registry so callers can install their own.

use std::collections::HashMap;
use std::time::SystemTime;

use serde_json::Value;

use crate::status::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemaType {
    ProtocolBuffer,
    Avro,
    Json,
}

impl SchemaType {
    /// Name under which a validator for this type is registered.
    pub fn validator_name(&self) -> &'static str {
        match self {
            SchemaType::ProtocolBuffer => "protocol-buffer",
            SchemaType::Avro => "avro",
            SchemaType::Json => "json",
        }
    }
}

/// Message payload encoding declared on a topic's schema settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Binary,
}

/// A registered schema.
#[derive(Clone, Debug)]
pub struct Schema {
    pub name: String,
    pub schema_type: SchemaType,
    pub definition: String,
    pub create_time: SystemTime,
}

/// Binds a topic to a schema in the registry.
#[derive(Clone, Debug)]
pub struct SchemaSettings {
    /// Fully qualified schema name.
    pub schema: String,
    pub encoding: Encoding,
}

/// Validates schema definitions and message payloads.
///
/// Implementations are registered on the broker by name (see
/// [`SchemaType::validator_name`]); installing an `avro` validator makes
/// AVRO topics validate instead of failing `Unimplemented`.
pub trait SchemaValidator: Send + Sync {
    /// Checks that `definition` is a well formed schema document.
    fn validate_definition(&self, definition: &str) -> Result<(), String>;

    /// Checks `data` against `definition`.
    fn validate_message(&self, definition: &str, data: &[u8], encoding: Encoding) -> Result<(), String>;
}

/// The built-in JSON validator.
///
/// Validation is syntactic: the definition must parse, the payload must
/// parse, and when the definition constrains the top-level `type` or lists
/// `required` properties those are enforced. Full JSON-schema semantics are
/// out of scope.
pub(crate) struct JsonValidator;

impl SchemaValidator for JsonValidator {
    fn validate_definition(&self, definition: &str) -> Result<(), String> {
        serde_json::from_str::<Value>(definition)
            .map(|_| ())
            .map_err(|e| format!("definition is not valid JSON: {e}"))
    }

    fn validate_message(&self, definition: &str, data: &[u8], _encoding: Encoding) -> Result<(), String> {
        let schema: Value =
            serde_json::from_str(definition).map_err(|e| format!("definition is not valid JSON: {e}"))?;
        let instance: Value =
            serde_json::from_slice(data).map_err(|e| format!("message data is not valid JSON: {e}"))?;

        if let Some(expected) = schema.get("type").and_then(Value::as_str) {
            let actual = json_type_name(&instance);
            let matches = match expected {
                "integer" => instance.as_i64().is_some() || instance.as_u64().is_some(),
                other => other == actual,
            };
            if !matches {
                return Err(format!("expected a JSON {expected}, got {actual}"));
            }
        }
        if let (Some(required), Some(object)) = (
            schema.get("required").and_then(Value::as_array),
            instance.as_object(),
        ) {
            for field in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(field) {
                    return Err(format!("missing required property '{field}'"));
                }
            }
        }
        Ok(())
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn default_validators() -> HashMap<String, std::sync::Arc<dyn SchemaValidator>> {
    let mut validators: HashMap<String, std::sync::Arc<dyn SchemaValidator>> = HashMap::new();
    validators.insert(
        SchemaType::Json.validator_name().to_string(),
        std::sync::Arc::new(JsonValidator),
    );
    validators
}

/// Validates `definition` without touching the registry.
pub(crate) fn validate_definition(
    validators: &HashMap<String, std::sync::Arc<dyn SchemaValidator>>,
    schema_type: SchemaType,
    definition: &str,
) -> Result<(), Status> {
    match validators.get(schema_type.validator_name()) {
        None => {
            // AVRO and protocol-buffer definitions are accepted unvalidated
            // unless the caller installed a validator for them.
            Ok(())
        }
        Some(validator) => validator
            .validate_definition(definition)
            .map_err(Status::invalid_argument),
    }
}

/// Validates a payload against a registered schema.
pub(crate) fn validate_message(
    validators: &HashMap<String, std::sync::Arc<dyn SchemaValidator>>,
    schema: &Schema,
    data: &[u8],
    encoding: Encoding,
) -> Result<(), Status> {
    match validators.get(schema.schema_type.validator_name()) {
        None => Err(Status::unimplemented(format!(
            "no validator registered for {} schemas",
            schema.schema_type.validator_name()
        ))),
        Some(validator) => validator
            .validate_message(&schema.definition, data, encoding)
            .map_err(|e| Status::invalid_argument(format!("schema validation failed for {}: {e}", schema.name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HashMap<String, std::sync::Arc<dyn SchemaValidator>> {
        default_validators()
    }

    fn json_schema(definition: &str) -> Schema {
        Schema {
            name: "projects/p/schemas/s".to_string(),
            schema_type: SchemaType::Json,
            definition: definition.to_string(),
            create_time: SystemTime::now(),
        }
    }

    #[test]
    fn test_definition_validation() {
        assert!(validate_definition(&registry(), SchemaType::Json, r#"{"type":"object"}"#).is_ok());
        assert!(validate_definition(&registry(), SchemaType::Json, "{not json").is_err());
        // No validator installed: accepted as-is.
        assert!(validate_definition(&registry(), SchemaType::Avro, "whatever").is_ok());
    }

    #[test]
    fn test_json_message_validation() {
        let schema = json_schema(r#"{"type":"object","required":["name"]}"#);
        assert!(validate_message(&registry(), &schema, br#"{"name":"a"}"#, Encoding::Json).is_ok());
        assert!(validate_message(&registry(), &schema, br#"{"other":1}"#, Encoding::Json).is_err());
        assert!(validate_message(&registry(), &schema, br#"[1,2]"#, Encoding::Json).is_err());
        assert!(validate_message(&registry(), &schema, b"not json", Encoding::Json).is_err());
    }

    #[test]
    fn test_unvalidated_types_fail_message_validation() {
        let schema = Schema {
            name: "projects/p/schemas/avro".to_string(),
            schema_type: SchemaType::Avro,
            definition: "{}".to_string(),
            create_time: SystemTime::now(),
        };
        let err = validate_message(&registry(), &schema, b"{}", Encoding::Binary).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Unimplemented);
    }
}
