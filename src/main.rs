use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::process;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

use ember::reader;
use ember::{Engine, EngineConfig, Value};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = EngineConfig::from_env();
    let mut load_files: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--load" => {
                let Some(path) = args.get(i + 1) else {
                    eprintln!("--load requires a file path");
                    process::exit(1);
                };
                load_files.push(path.clone());
                i += 2;
            }
            "--heap" => {
                let Some(words) = args.get(i + 1).and_then(|w| w.parse().ok()) else {
                    eprintln!("--heap requires a word count");
                    process::exit(1);
                };
                config.heap_words = words;
                i += 2;
            }
            "--no-compile" => {
                config.compile_threshold = 0;
                i += 1;
            }
            "--help" | "-h" => {
                println!("Usage: ember [OPTIONS]");
                println!();
                println!("Options:");
                println!("  --load <file>    Evaluate a source file before reading stdin");
                println!("  --heap <words>   Heap capacity in words (default {})", config.heap_words);
                println!("  --no-compile     Keep every closure interpreted");
                println!("  --help, -h       Show this help message");
                println!();
                println!("Environment variables:");
                println!("  EMBER_HEAP_WORDS, EMBER_MAX_CALL_DEPTH, EMBER_COMPILE_THRESHOLD");
                println!("  RUST_LOG=ember=debug   Log collections and compilation");
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Try 'ember --help' for usage information.");
                process::exit(1);
            }
        }
    }

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            process::exit(1);
        }
    };

    for path in &load_files {
        load_file(&mut engine, path);
    }

    if io::stdin().is_terminal() {
        println!("Ember Scheme");
        println!(
            "  Heap: {} of {} words used",
            ember::Mutator::heap(&engine).used_words(),
            engine.config().heap_words
        );
        println!("Ready.\n");
        run_interactive(&mut engine);
    } else {
        run_piped(&mut engine);
    }
}

fn load_file(engine: &mut Engine, path: &str) {
    let input = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading {}: {}", path, e);
            process::exit(1);
        }
    };

    let start = Instant::now();
    let mut pos = 0;
    let mut count = 0;
    loop {
        match reader::read_one_at(engine, &input, pos) {
            Ok(Some((expr, new_pos))) => {
                pos = new_pos;
                count += 1;
                if let Err(e) = engine.evaluate(expr) {
                    eprintln!("Error at expression {} of {}: {}", count, path, e);
                    process::exit(1);
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("Read error in {} at byte {}: {}", path, pos, e);
                process::exit(1);
            }
        }
    }

    let stats = engine.stats();
    eprintln!(
        "Loaded {} expressions from {} in {:.2}s ({} collections, {} closures compiled)",
        count,
        path,
        start.elapsed().as_secs_f64(),
        stats.collections,
        stats.compiled
    );
}

/// Interactive REPL: accumulate lines until parens are balanced.
fn run_interactive(engine: &mut Engine) {
    let stdin = io::stdin();
    let mut buf = String::new();

    loop {
        if buf.is_empty() {
            print!("> ");
        } else {
            print!("  ");
        }
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Read error: {}", e);
                break;
            }
        }
        buf.push_str(&line);

        if reader::paren_depth(&buf) <= 0 {
            let input = std::mem::take(&mut buf);
            if input.trim().is_empty() {
                continue;
            }
            eval_and_print(&input, engine);
        }
    }
}

/// Piped mode: read everything, then evaluate one expression at a time so
/// unread text never holds heap references.
fn run_piped(engine: &mut Engine) {
    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        eprintln!("Read error: {}", e);
        process::exit(1);
    }
    eval_and_print(&input, engine);
}

/// Evaluate every expression in `input`, printing results. An error is
/// reported and cleared so the session can continue.
fn eval_and_print(input: &str, engine: &mut Engine) {
    let mut pos = 0;
    loop {
        match reader::read_one_at(engine, input, pos) {
            Ok(Some((expr, new_pos))) => {
                pos = new_pos;
                match engine.evaluate(expr) {
                    Ok(Value::Unspecified) => {}
                    Ok(val) => println!("{}", engine.render(val)),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        engine.reset();
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}", e);
                break;
            }
        }
    }
}
