//! EightBall: lexer, shunting-yard expression engine, statement dispatcher,
//! symbol table and one-pass compiler for a small interactive BASIC-like
//! language, plus the byte-code wire format its compiler targets.
//!
//! The public surface is [`engine::Engine`]: drive it with [`engine::Engine::run`]
//! (interpret the stored program), [`engine::Engine::run_immediate`] (one
//! line, REPL-style), or [`engine::Engine::compile`] (emit byte code, then
//! [`bytecode::write_bytecode`] it out). Everything else — lexing, the
//! expression engine, the symbol table, control-flow frames, code
//! generation and linkage — is implementation detail the engine drives on
//! the caller's behalf.

pub mod arena;
pub mod bytecode;
pub mod codegen;
pub mod engine;
pub mod error;
pub mod expr;
pub mod frame;
pub mod lexer;
pub mod linker;
pub mod opcode;
pub mod program;
pub mod statement;
pub mod symtab;
pub mod token;
pub mod variable;
