use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use monkey_eval::{define_macros, expand_macros};
use monkey_parser::{parse_program_with_errors, ParseError};
use monkey_vm::{Bytecode, Compiler, Environment, Loader, Serializer, Value, Vm};

const MONKEY_FACE: &str = r#"            __,__
   .--.  .-"     "-.  .--.
  / .. \/  .-. .-.  \/ .. \
 | |  '|  /   Y   \  |'  | |
 | \   \  \ 0 | 0 /  /   / |
  \ '- ,\.-"""""""-./, -' /
   ''-' /_   ^ ^   _\ '-''
       |  \._   _./  |
       \   \ '~' /   /
        '._ '-=-' _.'
           '-----'
"#;

fn print_usage() {
    eprintln!("monkey - the Monkey programming language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  monkey                       Start the REPL (also: repl, eval, console)");
    eprintln!("  monkey s|script <file>       Compile and run a script in-process");
    eprintln!("  monkey c|compile <file>      Compile a script to <basename>.mky");
    eprintln!("  monkey r|run <file[.mky]>    Run a compiled bytecode file");
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("repl");

    match command {
        "-h" | "--help" => {
            print_usage();
            process::exit(0);
        }
        "repl" | "eval" | "console" => {
            run_repl();
            process::exit(0);
        }
        "s" | "script" => {
            let filename = require_filename(&args, "script");
            run_script(&filename);
        }
        "c" | "compile" => {
            let filename = require_filename(&args, "compile");
            compile_script(&filename);
        }
        "r" | "run" => {
            let filename = require_filename(&args, "run");
            run_bytecode(&filename);
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(-1);
        }
    }
    process::exit(0);
}

fn require_filename(args: &[String], command: &str) -> String {
    match args.get(2) {
        Some(filename) => filename.clone(),
        None => {
            eprintln!("the {command} command requires you to specify a file.");
            eprintln!("Like this: monkey {command} chimp.monkey");
            process::exit(-1);
        }
    }
}

/// Falls back to `<filename><extension>` when the given name does not
/// exist on disk.
fn resolve_path(filename: &str, extension: &str) -> PathBuf {
    let path = PathBuf::from(filename);
    if path.exists() {
        return path;
    }
    let with_extension = PathBuf::from(format!("{filename}{extension}"));
    if with_extension.exists() {
        return with_extension;
    }
    eprintln!("Can't find '{filename}({extension})'");
    process::exit(-1);
}

fn load_script(path: &Path) -> Bytecode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Can't read from {}: {err}", path.display());
            process::exit(-1);
        }
    };

    let (mut program, errors) = parse_program_with_errors(&source);
    if !errors.is_empty() {
        eprintln!("Error(s) parsing the script:");
        for error in &errors {
            eprintln!("{error}");
        }
        process::exit(-1);
    }

    let macro_env = Environment::new();
    define_macros(&mut program, &macro_env);
    let expanded = match expand_macros(program, &macro_env) {
        Ok(expanded) => expanded,
        Err(err) => {
            eprintln!("Error expanding macros: {err}");
            process::exit(-1);
        }
    };

    let mut compiler = Compiler::new();
    if let Err(err) = compiler.compile(&expanded) {
        eprintln!("Error while compiling script: {err}");
        process::exit(-1);
    }
    compiler.bytecode()
}

fn run_script(filename: &str) {
    let path = resolve_path(filename, ".monkey");
    let bytecode = load_script(&path);

    let mut vm = Vm::new(bytecode);
    if let Err(err) = vm.run() {
        eprintln!("Error in execution: {err}");
        process::exit(-1);
    }
}

fn compile_script(filename: &str) {
    let path = resolve_path(filename, ".monkey");
    let out_path = path.with_extension("mky");
    println!(
        "compiling {} into {} ...",
        path.display(),
        out_path.display()
    );

    let bytecode = load_script(&path);
    let mut serializer = Serializer::new();
    if let Err(err) = serializer.write(&bytecode) {
        eprintln!("Error serializing program: {err}");
        process::exit(-1);
    }

    if let Err(err) = fs::write(&out_path, &serializer.output) {
        eprintln!("Error writing results: {err}");
        process::exit(-1);
    }
}

fn run_bytecode(filename: &str) {
    let path = resolve_path(filename, ".mky");
    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("Can't read from {}: {err}", path.display());
            process::exit(-1);
        }
    };

    let bytecode = match Loader::new(&contents).load() {
        Ok(bytecode) => bytecode,
        Err(err) => {
            eprintln!("Error loading program: {err}");
            process::exit(-1);
        }
    };

    let mut vm = Vm::new(bytecode);
    if let Err(err) = vm.run() {
        eprintln!("Runtime error: {err}");
        process::exit(-1);
    }
}

fn run_repl() {
    let username = env::var("USER").unwrap_or_else(|_| "there".to_string());
    println!("Hello {username}! This is the Monkey programming language!");
    println!("Feel free to type in commands");

    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".monkey_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    // Macro definitions, global bindings and the globals array all survive
    // from line to line.
    let macro_env = Environment::new();
    let mut compiler = Compiler::new();
    let mut vm = Vm::new(compiler.bytecode());

    loop {
        let mut line = match rl.readline(">> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line.trim_end());

        if let Some(rest) = line.strip_prefix(':') {
            let (command, argument) = match rest.split_once(' ') {
                Some((command, argument)) => (command, argument.trim()),
                None => (rest.trim(), ""),
            };
            match command {
                "load" => {
                    if argument.is_empty() {
                        println!("USAGE: load [filename]");
                        continue;
                    }
                    match fs::read_to_string(argument) {
                        Ok(contents) => line = contents,
                        Err(err) => {
                            println!("ERROR reading {argument}: {err}");
                            continue;
                        }
                    }
                }
                "macros" => {
                    for (name, value) in macro_env.all() {
                        if let Value::Macro(_) = &value {
                            println!("{name}: {}", value.inspect());
                        }
                    }
                    continue;
                }
                _ => {}
            }
        }

        let (mut program, errors) = parse_program_with_errors(&line);
        if !errors.is_empty() {
            print_parser_errors(&errors);
            continue;
        }

        define_macros(&mut program, &macro_env);
        let expanded = match expand_macros(program, &macro_env) {
            Ok(expanded) => expanded,
            Err(err) => {
                println!("Woops! Expanding macros failed:\n {err}");
                continue;
            }
        };

        compiler.reset();
        if let Err(err) = compiler.compile(&expanded) {
            println!("Woops! Compilation failed:\n {err}");
            continue;
        }

        vm.recode(compiler.bytecode());
        if let Err(err) = vm.run() {
            println!("Woops! Executing bytecode failed:\n {err}");
            continue;
        }

        println!("{}", vm.last_popped().inspect());
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}

fn print_parser_errors(errors: &[ParseError]) {
    print!("{MONKEY_FACE}");
    println!("Woops! We ran into some monkey business here!");
    println!(" parser errors:");
    for error in errors {
        println!("\t{error}");
    }
}
