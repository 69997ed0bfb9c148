mod builtins;
mod comp;
mod error;
mod eval;
mod function;
mod instr;
mod locals;
mod parser;
mod source;
mod value;

use clap::Parser;
use eval::Env;
use rustyline::error::ReadlineError;
use rustyline::{Config, DefaultEditor};
use std::path::{Path, PathBuf};
use value::Value;

/// Scheme programming on an instruction-stream virtual machine
#[derive(Parser, Debug)]
#[command(name = "schemer")]
#[command(about = "Scheme programming.")]
struct CliArgs {
    /// Script files to run in order (none starts the REPL)
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Trace the compiler: dump compiled instruction trees
    #[arg(long)]
    verbose_compile: bool,

    /// Trace the evaluator: log every executed instruction
    #[arg(long)]
    verbose_eval: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    init_logging(&args);

    let mut env = Env::new();
    builtins::register_builtins(&mut env)?;

    if !args.files.is_empty() {
        for file in &args.files {
            run_file(file, &mut env);
        }
        return Ok(());
    }

    repl(&mut env)
}

fn init_logging(args: &CliArgs) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log::LevelFilter::Warn);
    if args.verbose_compile {
        builder.filter_module("schemer::comp", log::LevelFilter::Trace);
    }
    if args.verbose_eval {
        builder.filter_module("schemer::eval", log::LevelFilter::Trace);
    }
    builder.init();
}

/// Compile and evaluate every form of one script file. Any error is fatal.
fn run_file(path: &Path, env: &mut Env) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: cannot read {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };
    let name = path.display().to_string();
    let mut reader = parser::Reader::new(&name, &text);
    loop {
        match reader
            .next_value()
            .and_then(|form| comp::compile_expr_global(&form, env, true))
            .and_then(|ins| env.eval_result(ins))
        {
            Ok(_) => {}
            Err(e) if e.is_no_value() => return,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

/// The read-eval-print loop. Parse errors and evaluation errors are printed
/// with their source position; the loop continues until EOF.
fn repl(env: &mut Env) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::builder().auto_add_history(true).build();
    let mut rl = DefaultEditor::with_config(config)?;
    let history_file = ".schemer_history";
    let _ = rl.load_history(history_file);

    let mut line_no = 0u64;
    loop {
        match rl.readline("schemer> ") {
            Ok(line) => {
                line_no += 1;
                let name = format!("REPL#{}", line_no);
                match read_eval(&name, &line, env) {
                    Ok(Some(value)) => println!("=> {}", value),
                    Ok(None) => {}
                    Err(e) => eprintln!("{}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("error: {}", e);
                break;
            }
        }
    }

    let _ = rl.save_history(history_file);
    Ok(())
}

/// Parse and compile one REPL line. Evaluation errors are printed by
/// `Env::eval` and surface as a first-class `#error` value.
fn read_eval(name: &str, line: &str, env: &mut Env) -> error::Result<Option<Value>> {
    let form = match parser::parse_one(name, line) {
        Ok(form) => form,
        Err(e) if e.is_no_value() || matches!(e.kind, error::ErrorKind::SingleLine) => {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };
    let ins = comp::compile_expr_global(&form, env, true)?;
    Ok(Some(env.eval(ins)))
}
