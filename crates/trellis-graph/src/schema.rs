//! Block input/output schemas.
//!
//! Schemas are plain JSON Schema objects. Only the subset the scheduler needs
//! is interpreted: top-level `properties` with a `type` each, and the
//! `required` list. Complex schemas (anyOf, oneOf, nested constraints) are
//! accepted but not enforced.
//!
//! ```json
//! {
//!   "type": "object",
//!   "properties": {
//!     "text": { "type": "string" },
//!     "count": { "type": "integer" }
//!   },
//!   "required": ["text"]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::block::BlockInput;

/// JSON Schema type of a single property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
  String,
  Number,
  Integer,
  Boolean,
  Null,
  Array,
  Object,
  /// No `type` given, or a type this validator does not know.
  Any,
}

impl SchemaType {
  fn from_type_str(type_str: &str) -> Self {
    match type_str {
      "string" => SchemaType::String,
      "number" => SchemaType::Number,
      "integer" => SchemaType::Integer,
      "boolean" => SchemaType::Boolean,
      "null" => SchemaType::Null,
      "array" => SchemaType::Array,
      "object" => SchemaType::Object,
      _ => SchemaType::Any,
    }
  }

  /// Check whether a JSON value has this type.
  pub fn matches(&self, value: &Value) -> bool {
    match self {
      SchemaType::String => value.is_string(),
      SchemaType::Number => value.is_number(),
      SchemaType::Integer => value.is_i64() || value.is_u64(),
      SchemaType::Boolean => value.is_boolean(),
      SchemaType::Null => value.is_null(),
      SchemaType::Array => value.is_array(),
      SchemaType::Object => value.is_object(),
      SchemaType::Any => true,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SchemaType::String => "string",
      SchemaType::Number => "number",
      SchemaType::Integer => "integer",
      SchemaType::Boolean => "boolean",
      SchemaType::Null => "null",
      SchemaType::Array => "array",
      SchemaType::Object => "object",
      SchemaType::Any => "any",
    }
  }
}

impl fmt::Display for SchemaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A field whose value does not match its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
  pub field: String,
  pub expected: SchemaType,
  pub actual: &'static str,
}

impl fmt::Display for SchemaViolation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "'{}' expected {}, got {}",
      self.field, self.expected, self.actual
    )
  }
}

/// A block's input or output schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockSchema {
  schema: Value,
}

impl BlockSchema {
  pub fn new(schema: Value) -> Self {
    Self { schema }
  }

  /// An object schema with no properties and nothing required.
  pub fn empty() -> Self {
    Self::new(json!({ "type": "object", "properties": {} }))
  }

  /// The raw JSON Schema.
  pub fn as_json(&self) -> &Value {
    &self.schema
  }

  /// Declared property types, keyed by property name.
  pub fn property_types(&self) -> BTreeMap<String, SchemaType> {
    let mut types = BTreeMap::new();

    if let Some(properties) = self.schema.get("properties").and_then(|p| p.as_object()) {
      for (name, prop_schema) in properties {
        let schema_type = prop_schema
          .get("type")
          .and_then(|t| t.as_str())
          .map(SchemaType::from_type_str)
          .unwrap_or(SchemaType::Any);
        types.insert(name.clone(), schema_type);
      }
    }

    types
  }

  /// Names listed in the schema's `required` array.
  pub fn required_fields(&self) -> BTreeSet<String> {
    self
      .schema
      .get("required")
      .and_then(|r| r.as_array())
      .map(|fields| {
        fields
          .iter()
          .filter_map(|f| f.as_str().map(str::to_string))
          .collect()
      })
      .unwrap_or_default()
  }

  /// Validate the values present in `data` against their declared types.
  ///
  /// Presence of required fields is not checked here; see
  /// [`BlockSchema::required_fields`]. Properties not declared in the schema
  /// are allowed.
  pub fn validate(&self, data: &BlockInput) -> Result<(), Vec<SchemaViolation>> {
    let violations: Vec<SchemaViolation> = self
      .property_types()
      .into_iter()
      .filter_map(|(field, expected)| {
        let value = data.get(&field)?;
        if expected.matches(value) {
          None
        } else {
          Some(SchemaViolation {
            field,
            expected,
            actual: json_type_name(value),
          })
        }
      })
      .collect();

    if violations.is_empty() {
      Ok(())
    } else {
      Err(violations)
    }
  }
}

impl Default for BlockSchema {
  fn default() -> Self {
    Self::empty()
  }
}

fn json_type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(n) if n.is_f64() => "number",
    Value::Number(_) => "integer",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
