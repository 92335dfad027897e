use futures::StreamExt;
use minijinja::Environment;
use serde_json::{Value, json};
use trellis_graph::{Block, BlockError, BlockInput, BlockOutput, BlockSchema};

/// Renders a minijinja template against a map of values.
///
/// ```json
/// { "format": "Hello {{ name | title }}!", "values": { "name": "ada" } }
/// ```
pub struct TextFormatBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl TextFormatBlock {
  pub fn new() -> Self {
    Self {
      input_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": {
          "format": { "type": "string" },
          "values": { "type": "object" }
        },
        "required": ["format"]
      })),
      output_schema: BlockSchema::new(json!({
        "type": "object",
        "properties": { "output": { "type": "string" } }
      })),
    }
  }
}

impl Default for TextFormatBlock {
  fn default() -> Self {
    Self::new()
  }
}

fn render(input: &BlockInput) -> Result<String, BlockError> {
  let template = input
    .get("format")
    .and_then(Value::as_str)
    .ok_or_else(|| BlockError::new("ValueError", "'format' must be a string"))?;
  let values = input.get("values").cloned().unwrap_or_else(|| json!({}));

  Environment::new()
    .render_str(template, minijinja::Value::from_serialize(&values))
    .map_err(|e| BlockError::new("TemplateError", e.to_string()))
}

impl Block for TextFormatBlock {
  fn id(&self) -> &str {
    "text_format"
  }

  fn name(&self) -> &str {
    "Text Format"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, input: BlockInput) -> BlockOutput {
    let result = render(&input).map(|text| ("output".to_string(), Value::String(text)));
    futures::stream::iter([result]).boxed()
  }
}
