//! Input resolution for node executions.
//!
//! A node's input is accumulated from three places: the node's defaults, the
//! run input (starting nodes), and values delivered along incoming links.
//!
//! # Dynamic pins
//!
//! Several links may write into one collection-valued pin by addressing a
//! part of it:
//!
//! | pin name | merged into |
//! |---|---|
//! | `items_$_0`, `items_$_1` | `items: [v0, v1]` (gaps padded with `null`) |
//! | `config_#_host` | `config: { "host": v }` |
//! | `user_@_name` | `user: { "name": v }` |
//!
//! The same delimiters select part of an output when they appear in a link's
//! source pin: `result_$_1` carries element 1 of a list emitted on `result`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use trellis_graph::{BlockData, BlockInput, BlockRegistry, Node};

use crate::error::{ValidationError, ValidationKind};

/// Delimiter for list element pins: `name_$_<index>`.
pub const LIST_SPLIT: &str = "_$_";
/// Delimiter for dictionary entry pins: `name_#_<key>`.
pub const DICT_SPLIT: &str = "_#_";
/// Delimiter for object field pins: `name_@_<field>`.
pub const OBJC_SPLIT: &str = "_@_";

/// Longest list a dynamic list pin may address. `name_$_<index>` is rejected
/// unless `index < MAX_DYNAMIC_LIST_LEN`.
pub const MAX_DYNAMIC_LIST_LEN: usize = 1 << 16;

/// Collapse dynamic pins into their aggregate values.
///
/// Sub-keys are kept alongside the aggregate, which starts from the existing
/// value under its name when that value already has the right shape.
/// Returns the set of list pins whose index is not a non-negative integer
/// below [`MAX_DYNAMIC_LIST_LEN`].
pub fn merge_execution_input(mut data: BlockInput) -> Result<BlockInput, BTreeSet<String>> {
  let mut invalid = BTreeSet::new();
  let mut lists: BTreeMap<String, Vec<(usize, Value)>> = BTreeMap::new();
  let mut maps: BTreeMap<String, Vec<(String, Value)>> = BTreeMap::new();

  for (key, value) in &data {
    if let Some((name, index)) = key.split_once(LIST_SPLIT) {
      match index.parse::<usize>() {
        Ok(index) if index < MAX_DYNAMIC_LIST_LEN => lists
          .entry(name.to_string())
          .or_default()
          .push((index, value.clone())),
        _ => {
          invalid.insert(key.clone());
        }
      }
    } else if let Some((name, field)) = key
      .split_once(DICT_SPLIT)
      .or_else(|| key.split_once(OBJC_SPLIT))
    {
      maps
        .entry(name.to_string())
        .or_default()
        .push((field.to_string(), value.clone()));
    }
  }

  if !invalid.is_empty() {
    return Err(invalid);
  }

  for (name, mut items) in lists {
    items.sort_by_key(|(index, _)| *index);
    let mut list = match data.remove(&name) {
      Some(Value::Array(list)) => list,
      _ => Vec::new(),
    };
    for (index, value) in items {
      if list.len() <= index {
        list.resize(index + 1, Value::Null);
      }
      list[index] = value;
    }
    data.insert(name, Value::Array(list));
  }

  for (name, entries) in maps {
    let mut object = match data.remove(&name) {
      Some(Value::Object(object)) => object,
      _ => Map::new(),
    };
    object.extend(entries);
    data.insert(name, Value::Object(object));
  }

  Ok(data)
}

/// Select the part of `output` a link with source pin `name` carries.
///
/// Returns `None` when the link does not read this output, or when its
/// selector does not match the output's shape.
pub fn parse_execution_output(output: &BlockData, name: &str) -> Option<Value> {
  let (output_name, data) = output;
  if name == output_name {
    return Some(data.clone());
  }

  let selector = name.strip_prefix(output_name.as_str())?;
  if let Some(index) = selector.strip_prefix(LIST_SPLIT) {
    let index = index.parse::<usize>().ok()?;
    return data.as_array()?.get(index).cloned();
  }
  if let Some(key) = selector
    .strip_prefix(DICT_SPLIT)
    .or_else(|| selector.strip_prefix(OBJC_SPLIT))
  {
    return data.as_object()?.get(key).cloned();
  }
  None
}

/// Resolve and validate the input of a node execution.
///
/// 1. every pin fed by an incoming link must be present in `data`
/// 2. `data` is laid over the node's defaults
/// 3. dynamic pins are merged, when `resolve_dynamic` is set
/// 4. every field the block schema requires must be present
/// 5. present values must match their schema types
///
/// Pure apart from the registry lookup; safe to call repeatedly.
pub fn validate_exec(
  node: &Node,
  registry: &BlockRegistry,
  data: &BlockInput,
  resolve_dynamic: bool,
) -> Result<BlockInput, ValidationError> {
  let Some(block) = registry.get(&node.block_id) else {
    return Err(ValidationError::new(
      &node.id,
      ValidationKind::UnknownBlock,
      BTreeSet::new(),
      format!("block '{}' not found", node.block_id),
    ));
  };

  let missing: BTreeSet<String> = node
    .required_upstream_pins()
    .into_iter()
    .filter(|pin| !data.contains_key(pin))
    .collect();
  if !missing.is_empty() {
    return Err(ValidationError::new(
      &node.id,
      ValidationKind::MissingUpstream,
      missing.clone(),
      format!("input data missing for {}: {}", block.name(), join(&missing)),
    ));
  }

  let mut merged = node.input_default.clone();
  merged.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));

  if resolve_dynamic {
    merged = merge_execution_input(merged).map_err(|invalid| {
      ValidationError::new(
        &node.id,
        ValidationKind::InvalidDynamicPin,
        invalid.clone(),
        format!("invalid dynamic pin index for {}: {}", block.name(), join(&invalid)),
      )
    })?;
  }

  let missing: BTreeSet<String> = block
    .input_schema()
    .required_fields()
    .into_iter()
    .filter(|field| !merged.contains_key(field))
    .collect();
  if !missing.is_empty() {
    return Err(ValidationError::new(
      &node.id,
      ValidationKind::MissingRequired,
      missing.clone(),
      format!("input data missing for {}: {}", block.name(), join(&missing)),
    ));
  }

  if let Err(violations) = block.input_schema().validate(&merged) {
    let fields = violations.iter().map(|v| v.field.clone()).collect();
    let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
    return Err(ValidationError::new(
      &node.id,
      ValidationKind::SchemaMismatch,
      fields,
      format!("input data doesn't match {}: {}", block.name(), details.join("; ")),
    ));
  }

  Ok(merged)
}

fn join(fields: &BTreeSet<String>) -> String {
  fields.iter().cloned().collect::<Vec<_>>().join(", ")
}
