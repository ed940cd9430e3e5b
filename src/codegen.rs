use crate::ast::{
    BoolOperator, CmpOperator, Comprehension, Constant, DictEntry, Expr, ExprKind, Keyword,
    Module, Parameter, Span, Stmt, StmtKind, UnaryOperator,
};
use crate::block::{slot_name, Block};
use crate::builtins::{BuiltinTable, UNPACK_SLOT};
use crate::error::ConvertError;
use crate::registry::{FunctionRegistry, FunctionSignature};
use serde_json::{json, Number, Value};
use tracing::{debug, trace};

pub const CATCH_ALL: &str = "catch_all";

pub struct Codegen<'a> {
    source: &'a str,
    builtins: &'a BuiltinTable,
    functions: &'a mut FunctionRegistry,
}

impl<'a> Codegen<'a> {
    pub fn new(
        source: &'a str,
        builtins: &'a BuiltinTable,
        functions: &'a mut FunctionRegistry,
    ) -> Self {
        Self {
            source,
            builtins,
            functions,
        }
    }

    pub fn emit_module(&mut self, module: &Module) -> Result<Vec<Block>, ConvertError> {
        Ok(self.emit_statement_chain(&module.body)?.into_iter().collect())
    }

    pub fn emit_statement_chain(
        &mut self,
        statements: &[Stmt],
    ) -> Result<Option<Block>, ConvertError> {
        let blocks = statements
            .iter()
            .map(|stmt| self.emit_statement(stmt))
            .collect::<Result<Vec<_>, _>>()?;
        let mut head: Option<Block> = None;
        for mut block in blocks.into_iter().rev() {
            if let Some(next) = head.take() {
                block.set_next(next);
            }
            head = Some(block);
        }
        Ok(head)
    }

    pub fn emit_statement(&mut self, stmt: &Stmt) -> Result<Block, ConvertError> {
        trace!(kind = stmt.kind.name(), line = stmt.span.pos.line, "statement");
        match &stmt.kind {
            StmtKind::Expr { value } => self.emit_expr(value),
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {
                Ok(Block::new(stmt.kind.name()))
            }
            StmtKind::Return { value } => {
                let mut block = Block::new("Return");
                block.set_input("value", self.emit_optional(value.as_ref())?);
                Ok(block)
            }
            StmtKind::Assign { targets, value } => self.emit_assign_stmt(targets, value),
            StmtKind::AugAssign { target, op, value } => Ok(Block::new("AugAssign")
                .with_field("op", op.name())
                .with_input("target", self.emit_expr(target)?)
                .with_input("value", self.emit_expr(value)?)),
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
            } => {
                let mut block = Block::new("AnnAssign")
                    .with_input("target", self.emit_expr(target)?)
                    .with_input("annotation", self.emit_expr(annotation)?);
                block.set_input("value", self.emit_optional(value.as_ref())?);
                Ok(block)
            }
            StmtKind::If { test, body, orelse } => {
                self.emit_branch_stmt("If", &[("test", test)], body, orelse)
            }
            StmtKind::While { test, body, orelse } => {
                self.emit_branch_stmt("While", &[("test", test)], body, orelse)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async: false,
            } => self.emit_branch_stmt("For", &[("target", target), ("iter", iter)], body, orelse),
            StmtKind::FunctionDef {
                name,
                params,
                body,
                decorated: false,
                is_async: false,
            } => self.emit_function_definition(name, params, body),
            _ => Ok(self.catch_all(stmt.span, stmt.kind.name())),
        }
    }

    fn emit_assign_stmt(&mut self, targets: &[Expr], value: &Expr) -> Result<Block, ConvertError> {
        let mut block = Block::new("Assign");
        match targets {
            [Expr {
                kind: ExprKind::Name { id },
                ..
            }] => block = block.with_field("id", id.as_str()),
            _ => {
                block = block.with_extra_state("targets", targets.len());
                for (index, target) in targets.iter().enumerate() {
                    block.set_input(slot_name("target", index + 1), Some(self.emit_expr(target)?));
                }
            }
        }
        block.set_input("value", Some(self.emit_expr(value)?));
        Ok(block)
    }

    fn emit_branch_stmt(
        &mut self,
        block_type: &str,
        heads: &[(&str, &Expr)],
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> Result<Block, ConvertError> {
        let mut block = Block::new(block_type);
        for (slot, expr) in heads {
            block.set_input(*slot, Some(self.emit_expr(expr)?));
        }
        block.set_input("body", self.emit_statement_chain(body)?);
        block.set_input("orelse", self.emit_statement_chain(orelse)?);
        Ok(block)
    }

    fn emit_function_definition(
        &mut self,
        name: &str,
        params: &[Parameter],
        body: &[Stmt],
    ) -> Result<Block, ConvertError> {
        // Registered before the body so recursive calls resolve.
        self.functions.register(FunctionSignature::new(
            name,
            params.iter().map(|param| param.name.clone()),
        ));

        let param_state = params
            .iter()
            .map(|param| json!({ "name": param.name }))
            .collect::<Vec<_>>();
        let mut block = Block::new("FunctionDef")
            .with_field("name", name)
            .with_extra_state("create", true)
            .with_extra_state("name", name)
            .with_extra_state("params", param_state);
        for (index, param) in params.iter().enumerate() {
            let mut argument = Block::new("Argument").with_field("name", param.name.as_str());
            if let Some(annotation) = &param.annotation {
                argument.set_input("annotation", Some(self.emit_expr(annotation)?));
            }
            if let Some(default) = &param.default {
                argument.set_input("default", Some(self.emit_expr(default)?));
            }
            block.set_input(slot_name("param", index + 1), Some(argument));
        }
        block.set_input("body", self.emit_statement_chain(body)?);
        Ok(block)
    }

    fn emit_optional(&mut self, expr: Option<&Expr>) -> Result<Option<Block>, ConvertError> {
        expr.map(|expr| self.emit_expr(expr)).transpose()
    }

    fn emit_optional_boxed(
        &mut self,
        expr: &Option<Box<Expr>>,
    ) -> Result<Option<Block>, ConvertError> {
        self.emit_optional(expr.as_deref())
    }

    pub fn emit_expr(&mut self, expr: &Expr) -> Result<Block, ConvertError> {
        trace!(kind = expr.kind.name(), line = expr.span.pos.line, "expression");
        match &expr.kind {
            ExprKind::Name { id } => Ok(Block::new("Name").with_field("id", id.as_str())),
            ExprKind::Constant(constant) => Ok(self.emit_constant(constant, expr.span)),
            ExprKind::BinOp { left, op, right } => Ok(Block::new("BinOp")
                .with_field("op", op.name())
                .with_input("left", self.emit_expr(left)?)
                .with_input("right", self.emit_expr(right)?)),
            ExprKind::UnaryOp {
                op: UnaryOperator::Not,
                operand,
            } => Ok(Block::new("Not").with_input("value", self.emit_expr(operand)?)),
            ExprKind::UnaryOp { op, operand } => Ok(Block::new("UnaryOp")
                .with_field("op", op.name())
                .with_input("value", self.emit_expr(operand)?)),
            ExprKind::BoolOp { op, values } => self.emit_bool_fold(*op, values),
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.emit_compare_fold(left, ops, comparators),
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.emit_call_expr(expr, func, args, keywords),
            ExprKind::Attribute { value, attr } => Ok(Block::new("Attribute")
                .with_field("attr", attr.as_str())
                .with_input("value", self.emit_expr(value)?)),
            ExprKind::Subscript { value, slice } => Ok(Block::new("Subscript")
                .with_input("value", self.emit_expr(value)?)
                .with_input("slice", self.emit_expr(slice)?)),
            ExprKind::Slice { lower, upper, step } => {
                let mut block = Block::new("Slice");
                block.set_input("lower", self.emit_optional_boxed(lower)?);
                block.set_input("upper", self.emit_optional_boxed(upper)?);
                block.set_input("step", self.emit_optional_boxed(step)?);
                Ok(block)
            }
            ExprKind::List { elts } => self.emit_collection("List", elts),
            ExprKind::Tuple { elts } => self.emit_collection("Tuple", elts),
            ExprKind::Set { elts } => self.emit_collection("Set", elts),
            ExprKind::Dict { entries } => self.emit_dict(entries),
            ExprKind::JoinedStr { values } => self.emit_joined_str(values),
            ExprKind::FormattedValue {
                value,
                conversion,
                format_spec,
            } => {
                let mut block = Block::new("FormattedValue");
                if let Some(conversion) = conversion {
                    block = block.with_field("conversion", conversion.as_str());
                }
                block.set_input("value", Some(self.emit_expr(value)?));
                block.set_input("format_spec", self.emit_optional_boxed(format_spec)?);
                Ok(block)
            }
            ExprKind::ListComp { generators, .. }
            | ExprKind::SetComp { generators, .. }
            | ExprKind::GeneratorExp { generators, .. }
            | ExprKind::DictComp { generators, .. }
                if generators.iter().any(|generator| generator.is_async) =>
            {
                Ok(self.catch_all(expr.span, expr.kind.name()))
            }
            ExprKind::ListComp { elt, generators } => {
                self.emit_comprehension("ListComp", &[("elt", elt.as_ref())], generators)
            }
            ExprKind::SetComp { elt, generators } => {
                self.emit_comprehension("SetComp", &[("elt", elt.as_ref())], generators)
            }
            ExprKind::GeneratorExp { elt, generators } => {
                self.emit_comprehension("GeneratorExp", &[("elt", elt.as_ref())], generators)
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.emit_comprehension("DictComp", &[("key", key.as_ref()), ("value", value.as_ref())], generators),
            ExprKind::IfExp { test, body, orelse } => Ok(Block::new("IfExp")
                .with_input("test", self.emit_expr(test)?)
                .with_input("body", self.emit_expr(body)?)
                .with_input("orelse", self.emit_expr(orelse)?)),
            ExprKind::NamedExpr { target, value } => Ok(Block::new("NamedExpr")
                .with_input("target", self.emit_expr(target)?)
                .with_input("value", self.emit_expr(value)?)),
            ExprKind::Starred { value } => {
                Ok(Block::new("Starred").with_input("value", self.emit_expr(value)?))
            }
            ExprKind::Lambda | ExprKind::Await | ExprKind::Yield | ExprKind::YieldFrom => {
                Ok(self.catch_all(expr.span, expr.kind.name()))
            }
        }
    }

    fn emit_constant(&self, constant: &Constant, span: Span) -> Block {
        let value = match constant {
            Constant::Int(value) => Value::from(*value),
            Constant::Float(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(span.text(self.source).to_string())),
            Constant::BigInt(text)
            | Constant::Complex(text)
            | Constant::Bytes(text)
            | Constant::Str(text) => Value::String(text.clone()),
            Constant::Bool(true) => Value::from("True"),
            Constant::Bool(false) => Value::from("False"),
            Constant::None => Value::Null,
            Constant::Ellipsis => Value::from("..."),
        };
        Block::new(constant.kind_name()).with_field("value", value)
    }

    // `a or b or c` becomes `Or(a, Or(b, c))`.
    fn emit_bool_fold(&mut self, op: BoolOperator, values: &[Expr]) -> Result<Block, ConvertError> {
        match values {
            [] => Err(ConvertError::malformed("BoolOp", "no operands")),
            [only] => self.emit_expr(only),
            [first, rest @ ..] => Ok(Block::new("BoolOp")
                .with_field("op", op.name())
                .with_input("left", self.emit_expr(first)?)
                .with_input("right", self.emit_bool_fold(op, rest)?)),
        }
    }

    // `1 < 2 > 5` becomes `Lt(1, Gt(2, 5))`.
    fn emit_compare_fold(
        &mut self,
        left: &Expr,
        ops: &[CmpOperator],
        comparators: &[Expr],
    ) -> Result<Block, ConvertError> {
        let (Some((op, rest_ops)), Some((first, rest))) =
            (ops.split_first(), comparators.split_first())
        else {
            return Err(ConvertError::malformed("Compare", "no comparators"));
        };
        let right = if rest_ops.is_empty() {
            self.emit_expr(first)?
        } else {
            self.emit_compare_fold(first, rest_ops, rest)?
        };
        Ok(Block::new("Compare")
            .with_field("op", op.name())
            .with_input("left", self.emit_expr(left)?)
            .with_input("right", right))
    }

    fn emit_call_expr(
        &mut self,
        call: &Expr,
        func: &Expr,
        args: &[Expr],
        keywords: &[Keyword],
    ) -> Result<Block, ConvertError> {
        let Some(key) = call_target_key(func) else {
            return Ok(self.catch_all(call.span, "Call"));
        };

        let builtins = self.builtins;
        if let Some(template) = builtins.get(&key) {
            if keywords.iter().filter(|kw| kw.arg.is_none()).count() > 1 {
                debug!(key = %key, "builtin call with several ** unpacks");
                return Ok(self.catch_all(call.span, "Call"));
            }
            let positional = args
                .iter()
                .map(|arg| self.emit_expr(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let named = keywords
                .iter()
                .map(|kw| {
                    let slot = kw.arg.clone().unwrap_or_else(|| UNPACK_SLOT.to_string());
                    Ok((slot, self.emit_expr(&kw.value)?))
                })
                .collect::<Result<Vec<_>, ConvertError>>()?;
            return Ok(template.instantiate(positional, named));
        }

        if self.functions.contains(&key) {
            return self.emit_function_call(&key, args, keywords);
        }

        Ok(self.catch_all(call.span, "Call"))
    }

    fn emit_function_call(
        &mut self,
        name: &str,
        args: &[Expr],
        keywords: &[Keyword],
    ) -> Result<Block, ConvertError> {
        let mut block = Block::new("Call")
            .with_extra_state("name", name)
            .with_extra_state("args", args.len())
            .with_extra_state("kwargs", keywords.len());
        for (index, arg) in args.iter().enumerate() {
            block.set_input(slot_name("arg", index + 1), Some(self.emit_expr(arg)?));
        }
        for (index, keyword) in keywords.iter().enumerate() {
            let value = self.emit_expr(&keyword.value)?;
            let wrapped = match &keyword.arg {
                Some(arg) => Block::new("keyword")
                    .with_field("arg", arg.as_str())
                    .with_input("value", value),
                None => Block::new("keyword_unpack").with_input("value", value),
            };
            block.set_input(slot_name("kwarg", index + 1), Some(wrapped));
        }
        Ok(block)
    }

    fn emit_collection(&mut self, block_type: &str, elts: &[Expr]) -> Result<Block, ConvertError> {
        let mut block = Block::new(block_type).with_extra_state("items", elts.len());
        for (index, elt) in elts.iter().enumerate() {
            block.set_input(slot_name("input", index + 1), Some(self.emit_expr(elt)?));
        }
        Ok(block)
    }

    fn emit_dict(&mut self, entries: &[DictEntry]) -> Result<Block, ConvertError> {
        let mut block = Block::new("Dict").with_extra_state("items", entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let value = self.emit_expr(&entry.value)?;
            let item = match &entry.key {
                Some(key) => Block::new("dict_item")
                    .with_input("key", self.emit_expr(key)?)
                    .with_input("value", value),
                None => Block::new("dict_unpack").with_input("value", value),
            };
            block.set_input(slot_name("input", index + 1), Some(item));
        }
        Ok(block)
    }

    fn emit_joined_str(&mut self, values: &[Expr]) -> Result<Block, ConvertError> {
        let parts = values
            .iter()
            .map(|value| Ok(serde_json::to_value(self.emit_expr(value)?)?))
            .collect::<Result<Vec<Value>, ConvertError>>()?;
        Ok(Block::new("JoinedStr").with_field("value", parts))
    }

    fn emit_comprehension(
        &mut self,
        block_type: &str,
        heads: &[(&str, &Expr)],
        generators: &[Comprehension],
    ) -> Result<Block, ConvertError> {
        let mut block = Block::new(block_type).with_extra_state("items", generators.len());
        for (slot, expr) in heads {
            block.set_input(*slot, Some(self.emit_expr(expr)?));
        }
        for (index, generator) in generators.iter().enumerate() {
            let index = index + 1;
            block.set_input(
                slot_name("target", index),
                Some(self.emit_expr(&generator.target)?),
            );
            block.set_input(slot_name("iter", index), Some(self.emit_expr(&generator.iter)?));
            let condition = match generator.ifs.as_slice() {
                [] => None,
                ifs => Some(self.emit_bool_fold(BoolOperator::And, ifs)?),
            };
            block.set_input(slot_name("if", index), condition);
        }
        Ok(block)
    }

    fn catch_all(&self, span: Span, kind: &str) -> Block {
        debug!(kind, line = span.pos.line, "no block rule; emitting catch_all");
        Block::new(CATCH_ALL).with_field("code", span.text(self.source))
    }
}

// `f` for `f(...)`, `obj.method` for `obj.method(...)`; nothing for deeper callees.
fn call_target_key(func: &Expr) -> Option<String> {
    match &func.kind {
        ExprKind::Name { id } => Some(id.clone()),
        ExprKind::Attribute { value, attr } => value
            .as_name()
            .map(|object| format!("{}.{}", object, attr)),
        _ => None,
    }
}
