//! Minimal JSON-schema validation for task inputs.
//!
//! Covers the subset workflow documents actually use: `type`, `const`,
//! `enum`, `required`, `properties`, `additionalProperties` and `items`.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::TaskError;

type Document = serde_json::Map<String, Json>;

/// Input/output schemas attached to a workflow. Output schemas are carried
/// for documentation; only the input side is enforced.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Schema {
    #[serde(default)]
    pub input: Document,
    #[serde(default)]
    pub output: Document,
}

impl Schema {
    /// Validates a root input map against the input schema. An empty schema
    /// validates everything.
    pub fn validate(&self, input: &Document) -> Result<(), TaskError> {
        if self.input.is_empty() {
            return Ok(());
        }
        validate_value(
            &Json::Object(input.clone()),
            &Json::Object(self.input.clone()),
            "$",
        )
        .map_err(TaskError::Schema)
    }
}

fn validate_value(value: &Json, schema: &Json, path: &str) -> Result<(), String> {
    let schema = schema
        .as_object()
        .ok_or_else(|| format!("schema at '{path}' must be an object"))?;

    if let Some(type_spec) = schema.get("type") {
        validate_type(value, type_spec, path)?;
    }

    if let Some(constant) = schema.get("const") {
        if value != constant {
            return Err(format!("{path} expected const {constant}"));
        }
    }

    if let Some(variants) = schema.get("enum").and_then(Json::as_array) {
        if !variants.iter().any(|candidate| candidate == value) {
            return Err(format!("{path} is not one of the allowed enum values"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Json::as_array) {
        let object = value
            .as_object()
            .ok_or_else(|| format!("{path} must be an object"))?;
        for key in required.iter().filter_map(Json::as_str) {
            if !object.contains_key(key) {
                return Err(format!("{path} missing required field '{key}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Json::as_object) {
        let object = value
            .as_object()
            .ok_or_else(|| format!("{path} must be an object"))?;
        for (key, property_schema) in properties {
            if let Some(child) = object.get(key) {
                validate_value(child, property_schema, &format!("{path}.{key}"))?;
            }
        }

        if schema.get("additionalProperties").and_then(Json::as_bool) == Some(false) {
            for key in object.keys() {
                if !properties.contains_key(key) {
                    return Err(format!("{path} contains unknown field '{key}'"));
                }
            }
        }
    }

    if let Some(item_schema) = schema.get("items") {
        let items = value
            .as_array()
            .ok_or_else(|| format!("{path} must be an array"))?;
        for (index, item) in items.iter().enumerate() {
            validate_value(item, item_schema, &format!("{path}[{index}]"))?;
        }
    }

    Ok(())
}

fn validate_type(value: &Json, type_spec: &Json, path: &str) -> Result<(), String> {
    let matches = |name: &str, value: &Json| match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    };

    match type_spec {
        Json::String(name) => {
            if matches(name, value) {
                Ok(())
            } else {
                Err(format!("{path} expected type '{name}'"))
            }
        }
        Json::Array(names) => {
            if names
                .iter()
                .filter_map(Json::as_str)
                .any(|name| matches(name, value))
            {
                Ok(())
            } else {
                Err(format!("{path} did not match any allowed types"))
            }
        }
        _ => Err(format!("{path} schema.type must be a string or an array")),
    }
}
