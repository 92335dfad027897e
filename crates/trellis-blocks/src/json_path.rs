use futures::StreamExt;
use serde_json::{Value, json};
use trellis_graph::{Block, BlockError, BlockInput, BlockOutput, BlockSchema};

/// Selects a value out of `data` by a dot-separated `path`.
///
/// Segments index into objects by key and into arrays by position, so
/// `users.0.name` reads the name of the first user. An empty path selects
/// `data` itself.
pub struct JsonPathBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl JsonPathBlock {
  pub fn new() -> Self {
    Self {
      input_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": {
          "data": {},
          "path": { "type": "string" }
        },
        "required": ["data", "path"]
      })),
      output_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": { "output": {} }
      })),
    }
  }
}

impl Default for JsonPathBlock {
  fn default() -> Self {
    Self::new()
  }
}

fn select<'a>(data: &'a Value, path: &str) -> Result<&'a Value, BlockError> {
  let mut current = data;
  for segment in path.split('.').filter(|s| !s.is_empty()) {
    let next = match current {
      Value::Object(map) => map.get(segment),
      Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
      _ => None,
    };
    current = next.ok_or_else(|| BlockError::new("KeyError", format!("'{segment}' not found in path '{path}'")))?;
  }
  Ok(current)
}

impl Block for JsonPathBlock {
  fn id(&self) -> &str {
    "json_path"
  }

  fn name(&self) -> &str {
    "JSON Path"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, input: BlockInput) -> BlockOutput {
    let data = input.get("data").unwrap_or(&Value::Null);
    let path = input.get("path").and_then(Value::as_str).unwrap_or_default();
    let result = select(data, path).map(|value| ("output".to_string(), value.clone()));
    futures::stream::iter([result]).boxed()
  }
}
