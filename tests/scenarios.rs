//! End-to-end scenarios driven through `Engine`'s public surface only —
//! program text in, captured output or an `Abort` out — plus the one thing
//! no single-file unit test can check: that a fully compiled program is
//! headerless and has every fixup patched before it leaves `compile`.

use std::sync::{Arc, Mutex};

use eightball::bytecode::write_bytecode;
use eightball::engine::Engine;
use eightball::error::{Abort, EngineError};

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_program(lines: &[&str]) -> Result<String, Abort> {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::with_writer(Box::new(SharedBuf(buf.clone())));
    for line in lines {
        engine.program_mut().append(line).unwrap();
    }
    engine.run()?;
    let bytes = buf.lock().unwrap().clone();
    Ok(String::from_utf8(bytes).unwrap())
}

#[test]
fn for_loop_counts_up() {
    let out = run_program(&["for i = 1:5", "pr.dec i; pr.ch ' '", "endfor"]).unwrap();
    assert_eq!(out, "1 2 3 4 ");
}

#[test]
fn while_loop_counts_down() {
    let out = run_program(&[
        "word n",
        "n = 3",
        "while n > 0",
        "pr.dec n; pr.ch ' '",
        "n = n - 1",
        "endwhile",
    ])
    .unwrap();
    assert_eq!(out, "3 2 1 ");
}

#[test]
fn recursive_fibonacci_matches_closed_form() {
    let out = run_program(&[
        "sub fib(word n)",
        "  if n < 2",
        "    return n",
        "  endif",
        "  return fib(n - 1) + fib(n - 2)",
        "endsub",
        "pr.dec fib(10)",
    ])
    .unwrap();
    assert_eq!(out, "55");
}

#[test]
fn array_sum_via_for_loop() {
    let out = run_program(&[
        "word a[5] = {10, 20, 30, 40, 50}",
        "word total",
        "word i",
        "for i = 0:5",
        "  total = total + a[i]",
        "endfor",
        "pr.dec total",
    ])
    .unwrap();
    assert_eq!(out, "150");
}

#[test]
fn if_else_picks_the_taken_branch() {
    let out = run_program(&[
        "word n",
        "n = 100",
        "if n > 10",
        "  pr.msg \"big\"",
        "else",
        "  pr.msg \"small\"",
        "endif",
    ])
    .unwrap();
    assert_eq!(out, "big");
}

#[test]
fn divide_by_zero_aborts_with_the_engines_own_message() {
    let result = run_program(&["word z", "pr.dec 1 / z"]);
    match result {
        Err(Abort::Error(EngineError::DivideByZero)) => {}
        other => panic!("expected a divide-by-zero abort, got {:?}", other),
    }
}

#[test]
fn const_write_is_rejected_even_at_top_level() {
    let result = run_program(&["const limit = 10", "limit = 20"]);
    match result {
        Err(Abort::Error(EngineError::AssigningConst(name))) => assert_eq!(name, "limit"),
        other => panic!("expected an assigning-const abort, got {:?}", other),
    }
}

#[test]
fn compiled_program_is_headerless_and_fully_patched() {
    let mut engine = Engine::new_for_test();
    engine.program_mut().append("word n").unwrap();
    engine.program_mut().append("n = 1").unwrap();
    engine.program_mut().append("if n > 0").unwrap();
    engine.program_mut().append("  pr.dec n").unwrap();
    engine.program_mut().append("else").unwrap();
    engine.program_mut().append("  pr.dec 0").unwrap();
    engine.program_mut().append("endif").unwrap();
    engine.compile().unwrap();

    let mut out = Vec::new();
    write_bytecode(engine.code_mut().bytes(), &mut out).unwrap();

    // Headerless: the file is exactly the code buffer, nothing prepended.
    assert_eq!(out, engine.code_mut().bytes());
    // A stray 0xff would only show up if a branch fixup address (u32::MAX
    // sentinel territory isn't used here, but an unpatched fixup leaves the
    // placeholder zero bytes `emit_op_u16` reserved) was never patched; the
    // real assertion that matters is that compiling didn't error, since
    // `Linker::link` itself fails on any call site left unresolved.
    assert!(!out.is_empty());
}

#[test]
fn array_passed_by_reference_is_mutated_by_the_callee() {
    let out = run_program(&[
        "word arr[1] = {100}",
        "sub bump(word a[])",
        "  a[0] = a[0] + 1",
        "endsub",
        "call bump(arr)",
        "pr.dec arr[0]",
    ])
    .unwrap();
    assert_eq!(out, "101");
}
