use futures::StreamExt;
use serde_json::{Value, json};
use trellis_graph::{Block, BlockError, BlockInput, BlockOutput, BlockSchema};

/// Collects a list, usually assembled from dynamic `items_$_N` pins.
///
/// Emits the list on `list`, then its length on `count`.
pub struct ListCollectBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl ListCollectBlock {
  pub fn new() -> Self {
    Self {
      input_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": { "items": { "type": "array" } },
        "required": ["items"]
      })),
      output_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": {
          "list": { "type": "array" },
          "count": { "type": "integer" }
        }
      })),
    }
  }
}

impl Default for ListCollectBlock {
  fn default() -> Self {
    Self::new()
  }
}

impl Block for ListCollectBlock {
  fn id(&self) -> &str {
    "list_collect"
  }

  fn name(&self) -> &str {
    "List Collect"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, mut input: BlockInput) -> BlockOutput {
    let items = match input.remove("items") {
      Some(Value::Array(items)) => items,
      _ => {
        let err = BlockError::new("ValueError", "'items' must be a list");
        return futures::stream::iter([Err(err)]).boxed();
      }
    };

    let count = items.len();
    futures::stream::iter([
      Ok(("list".to_string(), Value::Array(items))),
      Ok(("count".to_string(), json!(count))),
    ])
    .boxed()
  }
}
