use futures::StreamExt;
use serde_json::json;
use trellis_graph::{Block, BlockInput, BlockOutput, BlockSchema};

/// Emits its `value` input unchanged on `output`.
pub struct ValueBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl ValueBlock {
  pub fn new() -> Self {
    Self {
      input_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": { "value": {} },
        "required": ["value"]
      })),
      output_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": { "output": {} }
      })),
    }
  }
}

impl Default for ValueBlock {
  fn default() -> Self {
    Self::new()
  }
}

impl Block for ValueBlock {
  fn id(&self) -> &str {
    "value"
  }

  fn name(&self) -> &str {
    "Value"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, mut input: BlockInput) -> BlockOutput {
    let value = input.remove("value").unwrap_or_default();
    futures::stream::iter([Ok(("output".to_string(), value))]).boxed()
  }
}
