use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SLOT_INDEX_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Next>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Input {
    Block(Option<Box<Block>>),
    Shadow(Box<Block>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Next {
    pub block: Box<Block>,
}

impl Block {
    pub fn new(block_type: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into(),
            fields: Map::new(),
            inputs: BTreeMap::new(),
            extra_state: Map::new(),
            next: None,
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, block: Block) -> Self {
        self.set_input(name, Some(block));
        self
    }

    pub fn with_extra_state(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra_state.insert(name.to_string(), value.into());
        self
    }

    // Sets `inputs[name]` to `{"block": block}`; `None` writes the explicit
    // `{"block": null}` placeholder.
    pub fn set_input(&mut self, name: impl Into<String>, block: Option<Block>) {
        self.inputs
            .insert(name.into(), Input::Block(block.map(Box::new)));
    }

    pub fn set_next(&mut self, block: Block) {
        self.next = Some(Next {
            block: Box::new(block),
        });
    }

    pub fn input_block(&self, name: &str) -> Option<&Block> {
        match self.inputs.get(name)? {
            Input::Block(block) => block.as_deref(),
            Input::Shadow(block) => Some(block),
        }
    }

    pub fn next_block(&self) -> Option<&Block> {
        self.next.as_ref().map(|next| next.block.as_ref())
    }

    pub fn literal_value(&self) -> Option<&Value> {
        if !self.inputs.is_empty() {
            return None;
        }
        self.fields
            .get("value")
            .filter(|value| !value.is_array() && !value.is_object())
    }

    pub fn chain_len(&self) -> usize {
        let mut count = 1;
        let mut cursor = self.next_block();
        while let Some(block) = cursor {
            count += 1;
            cursor = block.next_block();
        }
        count
    }
}

pub fn slot_name(prefix: &str, index: usize) -> String {
    format!("{}_{:0width$}", prefix, index, width = SLOT_INDEX_WIDTH)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub blocks: Workspace,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: Workspace { blocks },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slot_names_are_zero_padded() {
        assert_eq!(slot_name("input", 1), "input_000001");
        assert_eq!(slot_name("arg", 42), "arg_000042");
        assert_eq!(slot_name("kwarg", 1234567), "kwarg_1234567");
    }

    #[test]
    fn empty_parts_are_left_out() {
        let value = serde_json::to_value(Block::new("Pass")).unwrap();
        assert_eq!(value, json!({"type": "Pass"}));
    }

    #[test]
    fn inputs_serialize_as_block_or_shadow() {
        let mut block = Block::new("print_block");
        block.set_input("ARG0", None);
        block.inputs.insert(
            "end".to_string(),
            Input::Shadow(Box::new(Block::new("str").with_field("value", "\n"))),
        );
        block.set_next(Block::new("Pass"));
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "print_block",
                "inputs": {
                    "ARG0": {"block": null},
                    "end": {"shadow": {"type": "str", "fields": {"value": "\n"}}}
                },
                "next": {"block": {"type": "Pass"}}
            })
        );
    }

    #[test]
    fn extra_state_uses_camel_case_key() {
        let block = Block::new("List").with_extra_state("items", 0);
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value, json!({"type": "List", "extraState": {"items": 0}}));
    }

    #[test]
    fn deserializes_template_shaped_json() {
        let block: Block = serde_json::from_value(json!({
            "type": "text_join",
            "inputs": {"A": {"shadow": {"type": "str", "fields": {"value": ""}}}, "B": {"block": null}}
        }))
        .unwrap();
        assert_eq!(block.block_type, "text_join");
        assert!(matches!(block.inputs.get("A"), Some(Input::Shadow(_))));
        assert!(matches!(block.inputs.get("B"), Some(Input::Block(None))));
    }

    #[test]
    fn literal_value_requires_scalar_leaf() {
        assert!(Block::new("int").with_field("value", 3).literal_value().is_some());
        assert!(Block::new("JoinedStr")
            .with_field("value", json!([]))
            .literal_value()
            .is_none());
        assert!(Block::new("Name").with_field("id", "x").literal_value().is_none());
    }

    #[test]
    fn chain_len_counts_next_links() {
        let mut first = Block::new("Pass");
        let mut second = Block::new("Pass");
        second.set_next(Block::new("Break"));
        first.set_next(second);
        assert_eq!(first.chain_len(), 3);
    }
}
