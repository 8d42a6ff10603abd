use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use rand::Rng;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use emberlisp::extension::ExtContext;
use emberlisp::{image, Runtime, RuntimeConfig, Value};

#[derive(Parser)]
#[command(name = "emberlisp", version, about = "An embeddable Lisp interpreter")]
struct Args {
    /// Source files evaluated before the prompt.
    #[arg(long = "load", value_name = "FILE")]
    load: Vec<String>,

    /// Evaluate one expression and exit.
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    eval: Option<String>,

    /// Boot from a saved heap image before loading anything.
    #[arg(long, value_name = "FILE")]
    image: Option<String>,

    /// Cons heap size in cells.
    #[arg(long, default_value_t = 16 * 1024)]
    heap_cells: usize,

    /// Auxiliary memory size in words.
    #[arg(long, default_value_t = 8 * 1024)]
    aux_words: usize,

    /// Reductions per scheduling slice.
    #[arg(long, default_value_t = 128)]
    quantum: u32,
}

/// `(random)` or `(random n)` — a sample host extension.
fn ext_random(_ext: &mut ExtContext, args: &[Value]) -> Value {
    let mut rng = rand::thread_rng();
    match args.first() {
        None => Value::Uint(rng.gen()),
        Some(&Value::Int(n)) if n > 0 => Value::Int(rng.gen_range(0..n)),
        Some(&Value::Uint(n)) if n > 0 => Value::Uint(rng.gen_range(0..n)),
        _ => Value::Symbol(emberlisp::sym::TYPE_ERROR),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut rt = match Runtime::new(RuntimeConfig {
        heap_cells: args.heap_cells,
        aux_words: args.aux_words,
        quantum: args.quantum,
        ..RuntimeConfig::default()
    }) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("init failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    rt.set_critical_error_callback(Box::new(|msg| {
        eprintln!("CRITICAL: {}", msg);
    }));
    rt.add_extension("random", ext_random);

    if let Some(path) = &args.image {
        match image::boot(&mut rt, Path::new(path)) {
            Ok(_) => eprintln!("booted image {}", path),
            Err(e) => {
                eprintln!("image boot failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    for path in &args.load {
        let src = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("cannot read {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        };
        match rt.eval_program(&src) {
            Ok(_) => eprintln!("loaded {}", path),
            Err(e) => {
                eprintln!("error in {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(expr) = &args.eval {
        return match rt.eval_program(expr) {
            Ok(v) => {
                println!("{}", rt.print_value(v));
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    repl(&mut rt)
}

fn repl(rt: &mut Runtime) -> ExitCode {
    println!(
        "emberlisp | heap: {} cells free, mem: {} words free, {} symbols",
        rt.heap_num_free(),
        rt.mem_num_free(),
        rt.num_symbols()
    );
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("cannot start line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut buf = String::new();
    loop {
        let prompt = if buf.is_empty() { "> " } else { "  " };
        match editor.readline(prompt) {
            Ok(line) => {
                buf.push_str(&line);
                buf.push('\n');
                if paren_depth(&buf) > 0 {
                    continue;
                }
                let input = std::mem::take(&mut buf);
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(input);
                match rt.eval_program(input) {
                    Ok(v) => println!("{}", rt.print_value(v)),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                buf.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("read failed: {}", e);
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Unclosed paren count, ignoring strings and comments well enough for
/// interactive continuation lines.
fn paren_depth(src: &str) -> i32 {
    let mut depth = 0;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;
    for c in src.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            '"' => in_string = true,
            ';' => in_comment = true,
            _ => {}
        }
    }
    depth
}
