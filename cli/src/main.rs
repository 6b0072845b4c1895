//! Command line driver: an interactive REPL plus two batch modes (`--run`,
//! `--compile`). The teacher ships two binaries, an assembler and a VM;
//! there's no VM here (out of scope — see the workspace's design notes), so
//! this single binary plays assembler-and-prompt both, the way the language's
//! own front end always has.

use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use eightball::bytecode;
use eightball::engine::Engine;
use eightball::error::Abort;
use eightball::program::PendingEdit;

#[derive(Parser, Debug)]
#[command(name = "eightball", about = "An interactive 8-bit BASIC-like language")]
struct Cli {
    /// Load a program from FILE and run it non-interactively.
    #[arg(long, value_name = "FILE")]
    run: Option<PathBuf>,

    /// Load a program from FILE, compile it to byte code, and exit.
    #[arg(long, value_name = "FILE")]
    compile: Option<PathBuf>,

    /// Output path for --compile (defaults to the input path with its
    /// extension replaced by `.ebc`).
    #[arg(short, long, value_name = "OUT")]
    output: Option<PathBuf>,

    /// Don't colorize error output.
    #[arg(long)]
    no_color: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(path) = cli.run.clone() {
        return run_file(&cli, &path);
    }
    if let Some(path) = cli.compile.clone() {
        return compile_file(&cli, &path);
    }
    repl(&cli);
    ExitCode::SUCCESS
}

fn load_program(engine: &mut Engine, path: &PathBuf) -> Result<(), ExitCode> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        eprintln!("{}: {}", path.display(), err);
        ExitCode::FAILURE
    })?;
    engine.program_mut().load(&text).map_err(|err| {
        eprintln!("{}", err);
        ExitCode::FAILURE
    })
}

fn run_file(cli: &Cli, path: &PathBuf) -> ExitCode {
    let mut engine = Engine::new();
    if let Err(code) = load_program(&mut engine, path) {
        return code;
    }
    match engine.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(abort) => {
            print_abort(cli, &engine, &abort);
            ExitCode::FAILURE
        }
    }
}

fn compile_file(cli: &Cli, path: &PathBuf) -> ExitCode {
    let mut engine = Engine::new();
    if let Err(code) = load_program(&mut engine, path) {
        return code;
    }
    if let Err(err) = engine.compile() {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }
    let out_path = cli.output.clone().unwrap_or_else(|| path.with_extension("ebc"));
    match File::create(&out_path).and_then(|mut f| bytecode::write_bytecode(engine.code_mut().bytes(), &mut f)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {}", out_path.display(), err);
            ExitCode::FAILURE
        }
    }
}

fn print_abort(cli: &Cli, engine: &Engine, abort: &Abort) {
    let line = engine.current_line();
    if cli.no_color {
        eprintln!("{} at {}", abort, line);
    } else {
        eprintln!("\x1b[31m{} at {}\x1b[0m", abort, line);
    }
}

/// The interactive driver: a `>` prompt reading one line at a time. A line
/// is, in order of precedence: a continuation of an open `:a`/`:i`/`:c` edit,
/// a `:`-prefixed editor command, one of the three bare meta-commands
/// (`run`, `comp "name"`, `quit`), or an immediate-mode statement.
fn repl(cli: &Cli) {
    let mut engine = Engine::new();
    let stdin = io::stdin();
    prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if !dispatch_line(cli, &mut engine, &line) {
            break;
        }
        prompt();
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Returns `false` when the REPL should exit (`quit`).
fn dispatch_line(cli: &Cli, engine: &mut Engine, line: &str) -> bool {
    if engine.program().edit_mode {
        handle_edit_mode_line(engine, line);
        return true;
    }
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix(':') {
        handle_editor_command(engine, rest.trim());
        return true;
    }
    match trimmed {
        "quit" => return false,
        "run" => {
            if let Err(abort) = engine.run() {
                print_abort(cli, engine, &abort);
                engine.warm_reset();
            }
            return true;
        }
        _ => {}
    }
    if let Some(name) = parse_comp_command(trimmed) {
        handle_comp_command(engine, name);
        return true;
    }
    if let Err(abort) = engine.run_immediate(trimmed) {
        print_abort(cli, engine, &abort);
        engine.warm_reset();
    }
    true
}

fn parse_comp_command(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix("comp")?.trim();
    rest.strip_prefix('"')?.strip_suffix('"')
}

fn handle_comp_command(engine: &mut Engine, name: &str) {
    if let Err(err) = engine.compile() {
        eprintln!("{}", err);
        return;
    }
    let out_path = PathBuf::from(format!("{}.ebc", name));
    let result = File::create(&out_path)
        .and_then(|mut f| bytecode::write_bytecode(engine.code_mut().bytes(), &mut f));
    if let Err(err) = result {
        eprintln!("{}: {}", out_path.display(), err);
    }
}

fn handle_edit_mode_line(engine: &mut Engine, line: &str) {
    if line.trim() == "." {
        engine.program_mut().edit_mode = false;
        engine.program_mut().pending_edit = None;
        return;
    }
    match engine.program().pending_edit {
        Some(PendingEdit::AppendAfter(n)) => {
            match engine.program_mut().append_after(n, line) {
                Ok(()) => engine.program_mut().pending_edit = Some(PendingEdit::AppendAfter(n + 1)),
                Err(err) => eprintln!("{}", err),
            }
        }
        Some(PendingEdit::InsertBefore(n)) => {
            match engine.program_mut().insert_before(n, line) {
                Ok(()) => engine.program_mut().pending_edit = Some(PendingEdit::InsertBefore(n + 1)),
                Err(err) => eprintln!("{}", err),
            }
        }
        Some(PendingEdit::Replace(n)) => {
            if let Err(err) = engine.program_mut().replace(n, line) {
                eprintln!("{}", err);
            }
            engine.program_mut().edit_mode = false;
            engine.program_mut().pending_edit = None;
        }
        None => engine.program_mut().edit_mode = false,
    }
}

fn handle_editor_command(engine: &mut Engine, cmd: &str) {
    let mut parts = cmd.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("").trim();
    match name {
        "a" => {
            let n = arg.parse::<usize>().unwrap_or_else(|_| engine.program().line_count());
            engine.program_mut().pending_edit = Some(PendingEdit::AppendAfter(n));
            engine.program_mut().edit_mode = true;
        }
        "i" => match arg.parse::<usize>() {
            Ok(n) => {
                engine.program_mut().pending_edit = Some(PendingEdit::InsertBefore(n));
                engine.program_mut().edit_mode = true;
            }
            Err(_) => eprintln!("?bad line number"),
        },
        "c" => match arg.parse::<usize>() {
            Ok(n) => {
                engine.program_mut().pending_edit = Some(PendingEdit::Replace(n));
                engine.program_mut().edit_mode = true;
            }
            Err(_) => eprintln!("?bad line number"),
        },
        "d" => {
            let (from, to) = parse_range(arg);
            match from {
                Some(f) => {
                    if let Err(err) = engine.program_mut().delete(f, to) {
                        eprintln!("{}", err);
                    }
                }
                None => eprintln!("?bad line number"),
            }
        }
        "l" => {
            let (from, to) = parse_range(arg);
            match engine.program().list_range(from, to) {
                Ok(lines) => {
                    for (n, text) in lines {
                        println!("{:4} {}", n, text);
                    }
                }
                Err(err) => eprintln!("{}", err),
            }
        }
        "r" => {
            if arg.is_empty() {
                eprintln!("?bad line");
                return;
            }
            match std::fs::read_to_string(arg) {
                Ok(text) => {
                    if let Err(err) = engine.program_mut().load(&text) {
                        eprintln!("{}", err);
                    }
                }
                Err(err) => eprintln!("{}: {}", arg, err),
            }
        }
        "w" => {
            if arg.is_empty() {
                eprintln!("?bad line");
                return;
            }
            if let Err(err) = std::fs::write(arg, engine.program().save_text()) {
                eprintln!("{}: {}", arg, err);
            }
        }
        _ => eprintln!("?unknown editor command: {}", name),
    }
}

/// Parses `""`, `"n"` or `"n,m"` into an inclusive (from, to) pair.
fn parse_range(arg: &str) -> (Option<usize>, Option<usize>) {
    if arg.is_empty() {
        return (None, None);
    }
    let mut it = arg.splitn(2, ',');
    let from = it.next().and_then(|s| s.trim().parse::<usize>().ok());
    let to = it.next().and_then(|s| s.trim().parse::<usize>().ok());
    (from, to)
}
