use crate::block::{Block, Input};
use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const UNPACK_SLOT: &str = "**";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgRef {
    Positional(usize),
    Keyword(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinTemplate {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Input>,
    #[serde(
        default,
        rename = "extraState",
        skip_serializing_if = "Map::is_empty"
    )]
    pub extra_state: Map<String, Value>,
    // Fields filled from literal arguments; never copied to the output.
    #[serde(
        default,
        rename = "fieldMappings",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub field_mappings: BTreeMap<String, ArgRef>,
}

impl BuiltinTemplate {
    pub fn new(block_type: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into(),
            fields: Map::new(),
            inputs: BTreeMap::new(),
            extra_state: Map::new(),
            field_mappings: BTreeMap::new(),
        }
    }

    pub fn with_empty_slot(mut self, name: &str) -> Self {
        self.inputs.insert(name.to_string(), Input::Block(None));
        self
    }

    pub fn with_shadow(mut self, name: &str, shadow: Block) -> Self {
        self.inputs
            .insert(name.to_string(), Input::Shadow(Box::new(shadow)));
        self
    }

    pub fn with_field_mapping(mut self, field: &str, arg: ArgRef) -> Self {
        self.field_mappings.insert(field.to_string(), arg);
        self
    }

    pub fn instantiate(&self, positional: Vec<Block>, keywords: Vec<(String, Block)>) -> Block {
        let mut block = Block {
            block_type: self.block_type.clone(),
            fields: self.fields.clone(),
            inputs: self.inputs.clone(),
            extra_state: self.extra_state.clone(),
            next: None,
        };

        for (field, arg_ref) in &self.field_mappings {
            let arg = match arg_ref {
                ArgRef::Positional(index) => positional.get(*index),
                ArgRef::Keyword(name) => keywords
                    .iter()
                    .find(|(keyword, _)| keyword == name)
                    .map(|(_, block)| block),
            };
            if let Some(value) = arg.and_then(Block::literal_value) {
                block.fields.insert(field.clone(), value.clone());
            }
        }

        for (index, arg) in positional.into_iter().enumerate() {
            bind_slot(&mut block, format!("ARG{}", index), arg);
        }
        for (name, arg) in keywords {
            bind_slot(&mut block, name, arg);
        }
        block
    }
}

// A shadow of the same type keeps its shape and takes the argument's values
// for the fields it already declares; anything else is replaced outright.
fn bind_slot(block: &mut Block, slot: String, arg: Block) {
    if let Some(Input::Shadow(shadow)) = block.inputs.get_mut(&slot) {
        if shadow.block_type == arg.block_type {
            for (key, value) in shadow.fields.iter_mut() {
                if let Some(replacement) = arg.fields.get(key) {
                    *value = replacement.clone();
                }
            }
            return;
        }
    }
    block.set_input(slot, Some(arg));
}

#[derive(Debug, Clone, Default)]
pub struct BuiltinTable {
    templates: HashMap<String, BuiltinTemplate>,
}

impl BuiltinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register("print", BuiltinTemplate::new("print_block").with_empty_slot("ARG0"));
        table
    }

    pub fn merge_json_str(&mut self, json: &str) -> Result<usize, ConvertError> {
        let entries: BTreeMap<String, BuiltinTemplate> = serde_json::from_str(json)?;
        let count = entries.len();
        for (key, template) in entries {
            self.register(key, template);
        }
        Ok(count)
    }

    pub fn register(&mut self, key: impl Into<String>, template: BuiltinTemplate) {
        let key = key.into();
        debug!(key = %key, block_type = %template.block_type, "registered builtin");
        self.templates.insert(key, template);
    }

    pub fn get(&self, key: &str) -> Option<&BuiltinTemplate> {
        self.templates.get(key)
    }
}
