//! Pascal compiler driver.
//!
//! Commands: `lex` (token dump), `parse` (AST dump), `build`
//! (object + link), `run` (build, execute, clean up). Verbosity:
//! `-v` dumps tokens while compiling, `-vv` additionally dumps the
//! AST and global symbol information.

use std::env;
use std::fs;
use std::path::Path;
use std::process::{self, Command};

use pascal_lexer::{Lexer, TokenKind};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: pascal <command> <file.pas> [-o output] [-v[v]]");
        eprintln!("Commands: lex, parse, build, run");
        process::exit(1);
    }

    let command = &args[1];
    let file = &args[2];
    let verbosity = verbosity_level(&args);

    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", file, e);
            process::exit(1);
        }
    };

    match command.as_str() {
        "lex" => cmd_lex(file, &source),
        "parse" => cmd_parse(file, &source),
        "build" => {
            let output = get_output_path(&args, file);
            cmd_build(file, &source, &output, verbosity);
        }
        "run" => {
            let output = get_output_path(&args, file);
            cmd_build(file, &source, &output, verbosity);
            cmd_run(&output);
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            process::exit(1);
        }
    }
}

fn verbosity_level(args: &[String]) -> u32 {
    for a in &args[3..] {
        match a.as_str() {
            "-v" => return 1,
            "-vv" => return 2,
            _ => {}
        }
    }
    0
}

fn get_output_path(args: &[String], input: &str) -> String {
    for i in 3..args.len() {
        if args[i] == "-o" && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    // Default: strip the .pas extension.
    let p = Path::new(input);
    let stem = p.file_stem().unwrap_or_default().to_str().unwrap_or("a");
    let parent = p.parent().unwrap_or(Path::new("."));
    parent.join(stem).to_str().unwrap().to_string()
}

fn dump_tokens(file: &str, source: &str) -> bool {
    let mut lexer = Lexer::new(file, source);
    let mut count = 0usize;
    loop {
        match lexer.next_token() {
            Ok(tok) => {
                println!("{}: {:?}", tok.loc, tok.kind);
                count += 1;
                if tok.kind == TokenKind::EndOfFile {
                    break;
                }
            }
            Err(e) => {
                eprintln!("Lexer error: {}", e);
                return false;
            }
        }
    }
    println!("({} tokens)", count);
    true
}

fn cmd_lex(file: &str, source: &str) {
    if !dump_tokens(file, source) {
        process::exit(1);
    }
}

fn cmd_parse(file: &str, source: &str) {
    match pascal_parser::parse(file, source) {
        Ok(unit) => {
            println!("{:#?}", unit.program);
            println!("({} function(s))", unit.program.functions.len());
        }
        Err(e) => {
            eprintln!("Parse error: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_build(file: &str, source: &str, output_path: &str, verbosity: u32) {
    if verbosity > 0 && !dump_tokens(file, source) {
        process::exit(1);
    }

    // Parse (the lexer is driven from inside the parser).
    let mut unit = match pascal_parser::parse(file, source) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            process::exit(1);
        }
    };

    // Nested procedures become explicit before emission.
    pascal_sema::closure_transform(&mut unit.program);

    if verbosity > 1 {
        println!("{:#?}", unit.program);
        println!("{:?}", unit.arena);
    }

    // Generate the object file.
    let obj_bytes = match pascal_codegen::compile(&unit.program, &unit.arena) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Compilation failed: {}", e);
            process::exit(1);
        }
    };

    let obj_path = format!("{}.o", output_path);
    fs::write(&obj_path, &obj_bytes).unwrap_or_else(|e| {
        eprintln!("Error writing {}: {}", obj_path, e);
        process::exit(1);
    });

    let runtime_lib = find_runtime_lib();

    // Link against the runtime; the math builtins need libm.
    let status = Command::new("cc")
        .args([&obj_path, &runtime_lib, "-o", output_path, "-lm", "-lpthread"])
        .status();

    let _ = fs::remove_file(&obj_path);

    match status {
        Ok(s) if s.success() => {
            eprintln!("Built: {}", output_path);
        }
        Ok(s) => {
            eprintln!("Linker failed with exit code: {}", s);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to run linker: {}", e);
            process::exit(1);
        }
    }
}

fn cmd_run(output_path: &str) {
    let runnable = if Path::new(output_path).is_absolute() {
        output_path.to_string()
    } else {
        format!("./{}", output_path)
    };
    let status = Command::new(&runnable).status();
    let _ = fs::remove_file(output_path);
    match status {
        Ok(s) => {
            process::exit(s.code().unwrap_or(1));
        }
        Err(e) => {
            eprintln!("Failed to run {}: {}", runnable, e);
            process::exit(1);
        }
    }
}

/// Locate `libpascal_runtime.a` next to our own build artifacts.
fn find_runtime_lib() -> String {
    let mut candidates = vec![
        "target/debug/libpascal_runtime.a".to_string(),
        "target/release/libpascal_runtime.a".to_string(),
    ];
    // Also look next to the running executable.
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.insert(0, dir.join("libpascal_runtime.a").display().to_string());
        }
    }
    for c in &candidates {
        if Path::new(c).exists() {
            return c.clone();
        }
    }
    eprintln!("Cannot find libpascal_runtime.a; build the pascal-runtime crate first");
    process::exit(1);
}
