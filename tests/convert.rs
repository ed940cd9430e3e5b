use proptest::prelude::*;
use py2blocks_core::{
    py2blocks, Block, BuiltinTemplate, Converter, FunctionRegistry, Input,
};
use serde_json::{json, Value};

fn convert(source: &str) -> Value {
    serde_json::from_str(&py2blocks(source)).expect("output is JSON")
}

fn top_level(source: &str) -> Vec<Block> {
    Converter::new()
        .convert(source)
        .expect("source converts")
        .blocks
        .blocks
}

#[test]
fn function_without_arguments() {
    assert_eq!(
        convert("def f():\n    pass"),
        json!({
            "blocks": {"blocks": [{
                "type": "FunctionDef",
                "fields": {"name": "f"},
                "extraState": {"create": true, "name": "f", "params": []},
                "inputs": {"body": {"block": {"type": "Pass"}}}
            }]}
        })
    );
}

#[test]
fn function_body_is_one_chain() {
    assert_eq!(
        convert("def test_function():\n    x = 1\n    return x"),
        json!({
            "blocks": {"blocks": [{
                "type": "FunctionDef",
                "fields": {"name": "test_function"},
                "extraState": {"create": true, "name": "test_function", "params": []},
                "inputs": {"body": {"block": {
                    "type": "Assign",
                    "fields": {"id": "x"},
                    "inputs": {"value": {"block": {"type": "int", "fields": {"value": 1}}}},
                    "next": {"block": {
                        "type": "Return",
                        "inputs": {"value": {"block": {"type": "Name", "fields": {"id": "x"}}}}
                    }}
                }}}
            }]}
        })
    );
}

#[test]
fn function_parameters_become_argument_slots() {
    assert_eq!(
        convert("def test_function(x, y=2):\n    return x + y"),
        json!({
            "blocks": {"blocks": [{
                "type": "FunctionDef",
                "fields": {"name": "test_function"},
                "extraState": {
                    "create": true,
                    "name": "test_function",
                    "params": [{"name": "x"}, {"name": "y"}]
                },
                "inputs": {
                    "param_000001": {"block": {"type": "Argument", "fields": {"name": "x"}}},
                    "param_000002": {"block": {
                        "type": "Argument",
                        "fields": {"name": "y"},
                        "inputs": {"default": {"block": {"type": "int", "fields": {"value": 2}}}}
                    }},
                    "body": {"block": {
                        "type": "Return",
                        "inputs": {"value": {"block": {
                            "type": "BinOp",
                            "fields": {"op": "Add"},
                            "inputs": {
                                "left": {"block": {"type": "Name", "fields": {"id": "x"}}},
                                "right": {"block": {"type": "Name", "fields": {"id": "y"}}}
                            }
                        }}}
                    }}
                }
            }]}
        })
    );
}

#[test]
fn chained_comparison_folds_right() {
    assert_eq!(
        convert("1 < 2 > 5"),
        json!({
            "blocks": {"blocks": [{
                "type": "Compare",
                "fields": {"op": "Lt"},
                "inputs": {
                    "left": {"block": {"type": "int", "fields": {"value": 1}}},
                    "right": {"block": {
                        "type": "Compare",
                        "fields": {"op": "Gt"},
                        "inputs": {
                            "left": {"block": {"type": "int", "fields": {"value": 2}}},
                            "right": {"block": {"type": "int", "fields": {"value": 5}}}
                        }
                    }}
                }
            }]}
        })
    );
}

#[test]
fn syntax_error_envelope() {
    assert_eq!(
        convert("def f():\n    return 1 +\n"),
        json!({"error": {
            "lineno": 2,
            "offset": 15,
            "text": "    return 1 +\n",
            "message": "invalid syntax"
        }})
    );
}

#[test]
fn dangling_operator_on_last_line() {
    assert_eq!(
        convert("return 1 +"),
        json!({"error": {
            "lineno": 1,
            "offset": 11,
            "text": "return 1 +",
            "message": "invalid syntax"
        }})
    );
}

#[test]
fn missing_indented_block() {
    assert_eq!(
        convert("if x:\npass\n"),
        json!({"error": {
            "lineno": 2,
            "offset": 1,
            "text": "pass\n",
            "message": "expected an indented block after 'if' statement on line 1"
        }})
    );
    assert_eq!(
        convert("def f():\nreturn 1\n"),
        json!({"error": {
            "lineno": 2,
            "offset": 1,
            "text": "return 1\n",
            "message": "expected an indented block after function definition on line 1"
        }})
    );
}

#[test]
fn unexpected_indent() {
    assert_eq!(
        convert("x = 1\n  y = 2\n"),
        json!({"error": {
            "lineno": 2,
            "offset": 3,
            "text": "  y = 2\n",
            "message": "unexpected indent"
        }})
    );
    let value = convert("x = 1\n    \ty\n");
    assert_eq!(value["error"]["lineno"], 2);
    assert_eq!(value["error"]["message"], "unexpected indent");

    let value = convert("def f():\n    a = 1\n      b = 2\n");
    assert_eq!(value["error"]["lineno"], 3);
    assert_eq!(value["error"]["message"], "unexpected indent");
}

#[test]
fn indentation_checks_allow_one_line_suites() {
    let blocks = top_level("if x: a = 1; b = 2\nelse: pass\nc = 3  # done\n");
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].chain_len(), 2);
}

#[test]
fn unparenthesized_generator_among_arguments() {
    assert_eq!(
        convert("f(x for x in y, 1)\n"),
        json!({"error": {
            "lineno": 1,
            "offset": 3,
            "text": "f(x for x in y, 1)\n",
            "message": "Generator expression must be parenthesized"
        }})
    );
    // A lone generator argument needs no parentheses of its own.
    assert_eq!(top_level("sum(x for x in y)")[0].block_type, "catch_all");
}

#[test]
fn deep_nesting_is_a_message_envelope() {
    let source = format!("x = {}\n", vec!["1"; 5000].join(" + "));
    // Lowering walks up to the depth limit before giving up.
    let value = std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(move || convert(&source))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(
        value,
        json!({"error": "maximum recursion depth exceeded during compilation (limit 1000)"})
    );
}

#[test]
fn moderate_nesting_converts() {
    let source = format!("x = {}\n", vec!["1"; 100].join(" + "));
    let blocks = top_level(&source);
    let mut depth = 0;
    let mut node = blocks[0].input_block("value");
    while let Some(block) = node {
        depth += 1;
        node = block.input_block("left");
    }
    assert_eq!(depth, 100);
}

#[test]
fn python2_print_statement_is_reported() {
    let value = convert("print 'hello'\n");
    let message = value["error"]["message"].as_str().unwrap();
    assert!(message.starts_with("Missing parentheses in call to 'print'"));
    assert_eq!(value["error"]["lineno"], 1);
}

#[test]
fn dict_items_and_unpacks() {
    assert_eq!(
        convert(r#"{"a": 1, **d}"#),
        json!({
            "blocks": {"blocks": [{
                "type": "Dict",
                "extraState": {"items": 2},
                "inputs": {
                    "input_000001": {"block": {
                        "type": "dict_item",
                        "inputs": {
                            "key": {"block": {"type": "str", "fields": {"value": "a"}}},
                            "value": {"block": {"type": "int", "fields": {"value": 1}}}
                        }
                    }},
                    "input_000002": {"block": {
                        "type": "dict_unpack",
                        "inputs": {"value": {"block": {"type": "Name", "fields": {"id": "d"}}}}
                    }}
                }
            }]}
        })
    );
}

#[test]
fn print_uses_default_builtin() {
    assert_eq!(
        convert(r#"print("hi")"#),
        json!({
            "blocks": {"blocks": [{
                "type": "print_block",
                "inputs": {"ARG0": {"block": {"type": "str", "fields": {"value": "hi"}}}}
            }]}
        })
    );
}

#[test]
fn print_without_arguments_keeps_empty_slot() {
    assert_eq!(
        convert("print()"),
        json!({"blocks": {"blocks": [{"type": "print_block", "inputs": {"ARG0": {"block": null}}}]}})
    );
}

#[test]
fn registered_template_merges_matching_shadow() {
    let mut converter = Converter::new();
    converter.register_builtin(
        "turtle.forward",
        BuiltinTemplate::new("turtle_forward").with_shadow(
            "ARG0",
            Block::new("int").with_field("value", 10).with_field("min", 0),
        ),
    );
    let document = converter.convert("turtle.forward(25)\nturtle.forward(n)").unwrap();
    let first = &document.blocks.blocks[0];
    match first.inputs.get("ARG0") {
        Some(Input::Shadow(shadow)) => {
            assert_eq!(shadow.block_type, "int");
            assert_eq!(shadow.fields["value"], 25);
            assert_eq!(shadow.fields["min"], 0);
        }
        other => panic!("expected shadow, got {:?}", other),
    }
    let second = first.next_block().unwrap();
    assert!(matches!(second.inputs.get("ARG0"), Some(Input::Block(Some(b))) if b.block_type == "Name"));
}

#[test]
fn template_file_json_shape() {
    let mut converter = Converter::new();
    let template: BuiltinTemplate = serde_json::from_value(json!({
        "type": "math_round",
        "fieldMappings": {"DIGITS": 1, "MODE": "mode"},
        "inputs": {"ARG0": {"block": null}}
    }))
    .unwrap();
    converter.register_builtin("round", template);
    assert_eq!(
        serde_json::to_value(converter.convert("round(x, 2, mode='up')").unwrap()).unwrap(),
        json!({
            "blocks": {"blocks": [{
                "type": "math_round",
                "fields": {"DIGITS": 2, "MODE": "up"},
                "inputs": {
                    "ARG0": {"block": {"type": "Name", "fields": {"id": "x"}}},
                    "ARG1": {"block": {"type": "int", "fields": {"value": 2}}},
                    "mode": {"block": {"type": "str", "fields": {"value": "up"}}}
                }
            }]}
        })
    );
}

#[test]
fn call_to_declared_function() {
    let value = convert("def f(a, b):\n    pass\nf(1, b=2, **rest)");
    let call = &value["blocks"]["blocks"][0]["next"]["block"];
    assert_eq!(
        call,
        &json!({
            "type": "Call",
            "extraState": {"name": "f", "args": 1, "kwargs": 2},
            "inputs": {
                "arg_000001": {"block": {"type": "int", "fields": {"value": 1}}},
                "kwarg_000001": {"block": {
                    "type": "keyword",
                    "fields": {"arg": "b"},
                    "inputs": {"value": {"block": {"type": "int", "fields": {"value": 2}}}}
                }},
                "kwarg_000002": {"block": {
                    "type": "keyword_unpack",
                    "inputs": {"value": {"block": {"type": "Name", "fields": {"id": "rest"}}}}
                }}
            }
        })
    );
}

#[test]
fn arity_is_not_checked() {
    let blocks = top_level("def f(a):\n    pass\nf(1, 2, 3)");
    let call = blocks[0].next_block().unwrap();
    assert_eq!(call.block_type, "Call");
    assert_eq!(call.extra_state["args"], 3);
}

#[test]
fn unknown_calls_keep_their_source_text() {
    for source in ["foo(1,  2)", "a.b.c()", "make()()", "items[0](x)"] {
        assert_eq!(
            convert(source),
            json!({"blocks": {"blocks": [{"type": "catch_all", "fields": {"code": source}}]}}),
            "source: {}",
            source
        );
    }
}

#[test]
fn unsupported_statements_fall_back() {
    let source = "import os\nclass A:\n    pass\nx = lambda y: y";
    let blocks = top_level(source);
    let first = &blocks[0];
    assert_eq!(first.block_type, "catch_all");
    assert_eq!(first.fields["code"], "import os");
    let second = first.next_block().unwrap();
    assert_eq!(second.fields["code"], "class A:\n    pass");
    let third = second.next_block().unwrap();
    assert_eq!(third.block_type, "Assign");
    assert_eq!(third.input_block("value").unwrap().fields["code"], "lambda y: y");
}

#[test]
fn fstring_flattens_into_value_array() {
    assert_eq!(
        convert(r#"f"Hello {name!r}!""#),
        json!({
            "blocks": {"blocks": [{
                "type": "JoinedStr",
                "fields": {"value": [
                    {"type": "str", "fields": {"value": "Hello "}},
                    {
                        "type": "FormattedValue",
                        "fields": {"conversion": "r"},
                        "inputs": {
                            "value": {"block": {"type": "Name", "fields": {"id": "name"}}},
                            "format_spec": {"block": null}
                        }
                    },
                    {"type": "str", "fields": {"value": "!"}}
                ]}
            }]}
        })
    );
}

#[test]
fn fstring_format_spec_is_nested_joined_str() {
    let value = convert(r#"f"{pi:.2f}""#);
    let formatted = &value["blocks"]["blocks"][0]["fields"]["value"][0];
    assert_eq!(formatted["type"], "FormattedValue");
    assert!(formatted["fields"].get("conversion").is_none());
    assert_eq!(
        formatted["inputs"]["format_spec"]["block"],
        json!({"type": "JoinedStr", "fields": {"value": [{"type": "str", "fields": {"value": ".2f"}}]}})
    );
}

#[test]
fn slice_keeps_null_placeholders() {
    assert_eq!(
        convert("a[1:]"),
        json!({
            "blocks": {"blocks": [{
                "type": "Subscript",
                "inputs": {
                    "value": {"block": {"type": "Name", "fields": {"id": "a"}}},
                    "slice": {"block": {
                        "type": "Slice",
                        "inputs": {
                            "lower": {"block": {"type": "int", "fields": {"value": 1}}},
                            "upper": {"block": null},
                            "step": {"block": null}
                        }
                    }}
                }
            }]}
        })
    );
}

#[test]
fn constants_carry_python_values() {
    let value = convert("[True, None, 2.5, 'x', ...]");
    let inputs = &value["blocks"]["blocks"][0]["inputs"];
    assert_eq!(inputs["input_000001"]["block"], json!({"type": "bool", "fields": {"value": "True"}}));
    assert_eq!(inputs["input_000002"]["block"], json!({"type": "NoneType", "fields": {"value": null}}));
    assert_eq!(inputs["input_000003"]["block"], json!({"type": "float", "fields": {"value": 2.5}}));
    assert_eq!(inputs["input_000004"]["block"], json!({"type": "str", "fields": {"value": "x"}}));
    assert_eq!(inputs["input_000005"]["block"], json!({"type": "ellipsis", "fields": {"value": "..."}}));
}

#[test]
fn not_and_unary_operators() {
    assert_eq!(
        convert("not -x"),
        json!({
            "blocks": {"blocks": [{
                "type": "Not",
                "inputs": {"value": {"block": {
                    "type": "UnaryOp",
                    "fields": {"op": "USub"},
                    "inputs": {"value": {"block": {"type": "Name", "fields": {"id": "x"}}}}
                }}}
            }]}
        })
    );
}

#[test]
fn if_elif_else() {
    let value = convert("if a:\n    pass\nelif b:\n    break\nelse:\n    continue");
    let root = &value["blocks"]["blocks"][0];
    assert_eq!(root["type"], "If");
    assert_eq!(root["inputs"]["body"]["block"]["type"], "Pass");
    let elif = &root["inputs"]["orelse"]["block"];
    assert_eq!(elif["type"], "If");
    assert_eq!(elif["inputs"]["test"]["block"]["fields"]["id"], "b");
    assert_eq!(elif["inputs"]["orelse"]["block"]["type"], "Continue");
}

#[test]
fn loops_without_else_have_null_orelse() {
    let value = convert("for i in range(3):\n    print(i)\nwhile x:\n    x -= 1");
    let for_loop = &value["blocks"]["blocks"][0];
    assert_eq!(for_loop["type"], "For");
    assert_eq!(for_loop["inputs"]["orelse"], json!({"block": null}));
    assert_eq!(for_loop["inputs"]["iter"]["block"]["type"], "catch_all");
    assert_eq!(for_loop["inputs"]["body"]["block"]["type"], "print_block");
    let while_loop = &for_loop["next"]["block"];
    assert_eq!(while_loop["type"], "While");
    assert_eq!(while_loop["inputs"]["body"]["block"]["type"], "AugAssign");
    assert_eq!(while_loop["inputs"]["body"]["block"]["fields"]["op"], "Sub");
}

#[test]
fn multiple_assignment_targets() {
    let value = convert("a, b = c = 1");
    let root = &value["blocks"]["blocks"][0];
    assert_eq!(root["type"], "Assign");
    assert_eq!(root["extraState"]["targets"], 2);
    assert_eq!(root["inputs"]["target_000001"]["block"]["type"], "Tuple");
    assert_eq!(root["inputs"]["target_000002"]["block"]["fields"]["id"], "c");
}

#[test]
fn list_comprehension_slots() {
    assert_eq!(
        convert("[x * 2 for x in xs]"),
        json!({
            "blocks": {"blocks": [{
                "type": "ListComp",
                "extraState": {"items": 1},
                "inputs": {
                    "elt": {"block": {
                        "type": "BinOp",
                        "fields": {"op": "Mult"},
                        "inputs": {
                            "left": {"block": {"type": "Name", "fields": {"id": "x"}}},
                            "right": {"block": {"type": "int", "fields": {"value": 2}}}
                        }
                    }},
                    "target_000001": {"block": {"type": "Name", "fields": {"id": "x"}}},
                    "iter_000001": {"block": {"type": "Name", "fields": {"id": "xs"}}},
                    "if_000001": {"block": null}
                }
            }]}
        })
    );
}

#[test]
fn registry_is_per_conversion_unless_shared() {
    let converter = Converter::new();
    let isolated = converter.convert("f()").unwrap();
    assert_eq!(isolated.blocks.blocks[0].block_type, "catch_all");

    converter.convert("def f():\n    pass").unwrap();
    let still_isolated = converter.convert("f()").unwrap();
    assert_eq!(still_isolated.blocks.blocks[0].block_type, "catch_all");

    let mut shared = FunctionRegistry::new();
    converter
        .convert_with_registry("def f():\n    pass", &mut shared)
        .unwrap();
    let resolved = converter.convert_with_registry("f()", &mut shared).unwrap();
    assert_eq!(resolved.blocks.blocks[0].block_type, "Call");
}

#[test]
fn redefinition_replaces_signature() {
    let mut registry = FunctionRegistry::new();
    Converter::new()
        .convert_with_registry("def f(a):\n    pass\ndef f(a, b):\n    pass", &mut registry)
        .unwrap();
    assert_eq!(registry.get("f").unwrap().parameters.len(), 2);
}

#[test]
fn empty_source_has_no_blocks() {
    assert_eq!(convert(""), json!({"blocks": {"blocks": []}}));
}

proptest! {
    #[test]
    fn collections_index_every_element(values in prop::collection::vec(0i64..1000, 0..20)) {
        let items = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        let source = format!("[{}]", items.join(", "));
        let blocks = top_level(&source);
        let list = &blocks[0];
        prop_assert_eq!(list.block_type.as_str(), "List");
        prop_assert_eq!(&list.extra_state["items"], &json!(values.len()));
        prop_assert_eq!(list.inputs.len(), values.len());
        for (index, value) in values.iter().enumerate() {
            let slot = format!("input_{:06}", index + 1);
            let element = list.input_block(&slot).expect("slot present");
            prop_assert_eq!(&element.fields["value"], &json!(value));
        }
    }

    #[test]
    fn bool_chains_fold_to_depth(count in 2usize..12) {
        let names = (0..count).map(|i| format!("v{}", i)).collect::<Vec<_>>();
        let blocks = top_level(&names.join(" or "));
        let mut node = &blocks[0];
        for name in &names[..count - 1] {
            prop_assert_eq!(node.block_type.as_str(), "BoolOp");
            prop_assert_eq!(&node.fields["op"], &json!("Or"));
            prop_assert_eq!(&node.input_block("left").unwrap().fields["id"], &json!(name));
            node = node.input_block("right").unwrap();
        }
        prop_assert_eq!(&node.fields["id"], &json!(names[count - 1]));
    }

    #[test]
    fn statements_chain_in_order(count in 1usize..30) {
        let source = (0..count).map(|i| format!("x{} = {}", i, i)).collect::<Vec<_>>().join("\n");
        let blocks = top_level(&source);
        prop_assert_eq!(blocks.len(), 1);
        prop_assert_eq!(blocks[0].chain_len(), count);
        let mut node = Some(&blocks[0]);
        let mut index = 0;
        while let Some(block) = node {
            prop_assert_eq!(&block.fields["id"], &json!(format!("x{}", index)));
            index += 1;
            node = block.next_block();
        }
    }

    #[test]
    fn unknown_calls_are_catch_all(name in "q[a-z]{0,6}", arg in 0u32..100) {
        let source = format!("{}({})", name, arg);
        let value = convert(&source);
        prop_assert_eq!(
            value,
            json!({"blocks": {"blocks": [{"type": "catch_all", "fields": {"code": source}}]}})
        );
    }
}
