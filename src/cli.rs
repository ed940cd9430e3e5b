use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "py2blocks",
    about = "Convert Python source into Blockly workspace JSON."
)]
pub struct Args {
    #[arg(value_name = "INPUT", help = "Python source file, or '-' for stdin.")]
    pub input: PathBuf,

    #[arg(value_name = "OUTPUT", help = "Where to write the JSON (stdout when omitted).")]
    pub output: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "JSON object of extra builtin templates, keyed by call target."
    )]
    pub builtins: Option<PathBuf>,

    #[arg(long, help = "Do not register the default builtin templates (print).")]
    pub no_default_builtins: bool,

    #[arg(long, help = "Write single-line JSON instead of pretty-printed JSON.")]
    pub compact: bool,

    #[arg(long, short, help = "Suppress progress lines on stderr.")]
    pub quiet: bool,
}
