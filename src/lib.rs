pub mod ast;
pub mod block;
pub mod builtins;
pub mod cli;
pub mod codegen;
pub mod error;
pub mod literal;
pub mod parser;
pub mod registry;

pub use block::{Block, Document, Input};
pub use builtins::{ArgRef, BuiltinTable, BuiltinTemplate};
pub use error::{ConvertError, ErrorEnvelope, SyntaxError};
pub use registry::{FunctionRegistry, FunctionSignature};

use anyhow::{Context, Result};
use codegen::Codegen;
use serde_json::{json, Value};
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Converter {
    builtins: BuiltinTable,
}

impl Default for Converter {
    fn default() -> Self {
        Self::with_builtins(BuiltinTable::with_defaults())
    }
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(builtins: BuiltinTable) -> Self {
        Self { builtins }
    }

    pub fn register_builtin(&mut self, key: impl Into<String>, template: BuiltinTemplate) {
        self.builtins.register(key, template);
    }

    pub fn convert(&self, source: &str) -> Result<Document, ConvertError> {
        let mut functions = FunctionRegistry::new();
        self.convert_with_registry(source, &mut functions)
    }

    // Like [`Converter::convert`], but functions declared by earlier
    // conversions sharing `functions` resolve as calls here.
    pub fn convert_with_registry(
        &self,
        source: &str,
        functions: &mut FunctionRegistry,
    ) -> Result<Document, ConvertError> {
        debug!(bytes = source.len(), "converting source");
        let module = parser::parse_module(source)?;
        let blocks = Codegen::new(source, &self.builtins, functions).emit_module(&module)?;
        debug!(
            statements = module.body.len(),
            functions = functions.len(),
            "conversion finished"
        );
        Ok(Document::new(blocks))
    }

    pub fn convert_to_value(&self, source: &str) -> Value {
        match self
            .convert(source)
            .and_then(|document| Ok(serde_json::to_value(document)?))
        {
            Ok(value) => value,
            Err(err) => envelope_value(&err),
        }
    }

    pub fn convert_to_string(&self, source: &str) -> String {
        self.convert_to_value(source).to_string()
    }
}

fn envelope_value(err: &ConvertError) -> Value {
    debug!(error = %err, "conversion failed");
    serde_json::to_value(ErrorEnvelope::from(err))
        .unwrap_or_else(|_| json!({ "error": err.to_string() }))
}

pub fn py2blocks(source: &str) -> String {
    Converter::new().convert_to_string(source)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliOutcome {
    Document,
    ErrorEnvelope,
}

impl CliOutcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            CliOutcome::Document => ExitCode::SUCCESS,
            CliOutcome::ErrorEnvelope => ExitCode::from(1),
        }
    }
}

pub fn run_cli(args: &cli::Args) -> Result<CliOutcome> {
    let total_stages = 3 + usize::from(args.builtins.is_some());
    let progress = CliProgress::new("Convert", total_stages, args.quiet);
    let mut stage = 0usize;

    stage += 1;
    progress.emit(stage, "Reading input");
    let source = read_source(&args.input)?;

    let mut builtins = if args.no_default_builtins {
        BuiltinTable::new()
    } else {
        BuiltinTable::with_defaults()
    };
    if let Some(path) = &args.builtins {
        stage += 1;
        progress.emit(stage, "Loading builtin templates");
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read builtin templates '{}'.", path.display()))?;
        let count = builtins
            .merge_json_str(&json)
            .with_context(|| format!("Invalid builtin templates in '{}'.", path.display()))?;
        debug!(count, path = %path.display(), "loaded builtin templates");
    }

    stage += 1;
    progress.emit(stage, "Converting");
    let converter = Converter::with_builtins(builtins);
    let (value, outcome) = match converter.convert(&source) {
        Ok(document) => (serde_json::to_value(&document)?, CliOutcome::Document),
        Err(err) => {
            warn!(error = %err, "conversion failed");
            (
                serde_json::to_value(ErrorEnvelope::from(&err))?,
                CliOutcome::ErrorEnvelope,
            )
        }
    };

    stage += 1;
    progress.emit(stage, "Writing output");
    let text = if args.compact {
        serde_json::to_string(&value)?
    } else {
        serde_json::to_string_pretty(&value)?
    };
    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, format!("{}\n", text))
                .with_context(|| format!("Failed to write '{}'.", path.display()))?;
        }
        None => println!("{}", text),
    }
    Ok(outcome)
}

fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read source from stdin.")?;
        return Ok(source);
    }
    if !path.is_file() {
        anyhow::bail!("Input file not found: '{}'.", path.display());
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read '{}'.", path.display()))
}

struct CliProgress {
    prefix: &'static str,
    total: usize,
    quiet: bool,
}

impl CliProgress {
    fn new(prefix: &'static str, total: usize, quiet: bool) -> Self {
        Self {
            prefix,
            total: total.max(1),
            quiet,
        }
    }

    fn emit(&self, step: usize, label: &str) {
        if self.quiet {
            return;
        }
        let step = step.clamp(1, self.total);
        let bar = render_progress_bar(step, self.total, 14);
        eprintln!(
            "[{}] {}... ({}/{}) {}",
            self.prefix, label, step, self.total, bar
        );
    }
}

fn render_progress_bar(step: usize, total: usize, width: usize) -> String {
    let width = width.max(1);
    let filled = ((step * width) + (total / 2)) / total;
    (0..width)
        .map(|i| if i < filled { '=' } else { '-' })
        .fold(String::from("["), |mut bar, c| {
            bar.push(c);
            bar
        })
        + "]"
}
