//! The engine: ties the symbol table, code generator, linker and program
//! store together and drives one line (or one whole program) at a time.
//! Statement dispatch itself lives in `crate::statement`; this module owns
//! the shared state every statement handler needs plus the handful of
//! operations the expression engine re-enters (`array_get`, `deref_word`,
//! subroutine calls, ...).

use std::io::{self, Write};

use log::{debug, warn};

use crate::arena::{Arena, Direction};
use crate::codegen::CodeBuffer;
use crate::error::{Abort, EngineError, Result};
use crate::frame::Frame;
use crate::linker::Linker;
use crate::program::ProgramStore;
use crate::symtab::SymbolTable;
use crate::variable::{ArrayStorage, ElemType, Location, VarKind, Variable};

const DEFAULT_VARIABLE_ARENA: usize = 16 * 1024;
const DEFAULT_CODE_CAPACITY: usize = 32 * 1024;
const DEFAULT_VALUE_STORE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Interpret,
    Compile,
}

/// Position within the program store: a line number (1-based) plus a byte
/// offset into that line's text. Saved wholesale by call frames and loop
/// frames so that resuming never needs to re-derive "where was I" from a
/// separately tracked line/offset pair — the REDESIGN FLAGS note in
/// spec.md 9 that an implementation "should treat each call as explicitly
/// saving both the text pointer and the line contents"; a `Cursor` is
/// exactly that pair, and our line storage is never paged out from under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub line: usize,
    pub pos: usize,
}

pub(crate) enum StepOutcome {
    Continue,
    Returned,
    ProgramEnd,
}

/// Arena-V (spec.md 2.2): flat byte storage for interpret-mode array bodies,
/// addressed by the `u32` a `Location::Absolute` carries. Compile-mode
/// arrays never touch this; they describe VM-side addresses that this
/// crate never materialises.
pub struct ValueStore {
    arena: Arena,
    bytes: Vec<u8>,
}

impl ValueStore {
    fn new(capacity: usize) -> ValueStore {
        ValueStore { arena: Arena::new(capacity, Direction::Up), bytes: vec![0; capacity] }
    }

    pub(crate) fn alloc(&mut self, len: usize) -> Result<u32> {
        let addr = self.arena.alloc(len)?;
        Ok(addr as u32)
    }

    pub(crate) fn read_word(&self, addr: u32) -> i32 {
        let a = addr as usize;
        i16::from_le_bytes([self.bytes[a], self.bytes[a + 1]]) as i32
    }

    pub(crate) fn write_word(&mut self, addr: u32, v: i32) {
        let a = addr as usize;
        let bytes = (v as i16).to_le_bytes();
        self.bytes[a] = bytes[0];
        self.bytes[a + 1] = bytes[1];
    }

    pub(crate) fn read_byte(&self, addr: u32) -> u8 {
        self.bytes[addr as usize]
    }

    pub(crate) fn write_byte(&mut self, addr: u32, v: u8) {
        self.bytes[addr as usize] = v;
    }
}

pub struct Engine {
    pub(crate) symtab: SymbolTable,
    pub(crate) code: CodeBuffer,
    pub(crate) linker: Linker,
    pub(crate) program: ProgramStore,
    pub(crate) values: ValueStore,
    pub(crate) frames: Vec<Frame>,
    pub(crate) mode: Mode,
    pub(crate) cursor: Cursor,
    pub(crate) return_value: i32,
    pub(crate) local_offset: i32,
    pub(crate) interrupted: bool,
    /// Stashed `Fixup`s for the unconditional jump a compiled `sub` header
    /// emits to leap over its own body; patched to the body's end once the
    /// matching `endsub` is reached. A `Vec` rather than a single slot only
    /// because nothing stops one `sub` header from starting before the
    /// previous one's `endsub` is seen in a malformed program; resolved in
    /// strict stack order like everything else in this file.
    pub(crate) pending_sub_skips: Vec<crate::codegen::Fixup>,
    out: Box<dyn Write>,
    pub(crate) input: Box<dyn std::io::Read>,
}

impl Engine {
    pub fn new() -> Engine {
        Engine::with_io(Box::new(io::stdout()), Box::new(io::stdin()))
    }

    pub fn with_writer(out: Box<dyn Write>) -> Engine {
        Engine::with_io(out, Box::new(io::empty()))
    }

    pub fn with_io(out: Box<dyn Write>, input: Box<dyn std::io::Read>) -> Engine {
        Engine {
            symtab: SymbolTable::new(DEFAULT_VARIABLE_ARENA),
            code: CodeBuffer::new(DEFAULT_CODE_CAPACITY),
            linker: Linker::new(),
            program: ProgramStore::new(),
            values: ValueStore::new(DEFAULT_VALUE_STORE),
            frames: Vec::new(),
            mode: Mode::Interpret,
            cursor: Cursor { line: 1, pos: 0 },
            return_value: 0,
            local_offset: 0,
            interrupted: false,
            pending_sub_skips: Vec::new(),
            out,
            input,
        }
    }

    /// A minimal engine for standalone expression-engine unit tests: no
    /// program text, no subroutines, just a symbol table and value store.
    pub fn new_for_test() -> Engine {
        Engine::with_writer(Box::new(io::sink()))
    }

    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    pub fn symtab_mut(&mut self) -> &mut SymbolTable {
        &mut self.symtab
    }

    pub fn code_mut(&mut self) -> &mut CodeBuffer {
        &mut self.code
    }

    pub fn linker_mut(&mut self) -> &mut Linker {
        &mut self.linker
    }

    pub fn program(&self) -> &ProgramStore {
        &self.program
    }

    pub fn program_mut(&mut self) -> &mut ProgramStore {
        &mut self.program
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn request_interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn write_out(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
    }

    pub fn flush_out(&mut self) {
        let _ = self.out.flush();
    }

    /// Non-local-only lookup: searches the current frame, then every
    /// enclosing frame out to the globals, exactly as spec.md 5 describes
    /// for ordinary name resolution (only `define`'s redefinition check is
    /// local-only).
    pub fn resolve_var(&self, name: &str) -> Result<usize> {
        self.symtab.index_of(name, false).ok_or(EngineError::ExpectedVariable)
    }

    /// Allocates storage for a new scalar and returns its `Location`.
    /// Globals get a bump-allocated absolute address in the value store;
    /// locals (inside a subroutine's frame) get a negative frame-relative
    /// offset, growing down from FP exactly as parameters grow up from it.
    pub(crate) fn alloc_scalar_storage(&mut self, elem: ElemType) -> Result<Location> {
        let width = match elem {
            ElemType::Word => 2,
            ElemType::Byte => 1,
        };
        if self.symtab.frame_depth() > 1 {
            self.local_offset -= width;
            Ok(Location::FrameRelative(self.local_offset))
        } else {
            let addr = self.values.alloc(width as usize)?;
            Ok(Location::Absolute(addr))
        }
    }

    pub(crate) fn alloc_array_storage(&mut self, elem: ElemType, len: u16) -> Result<Location> {
        let width: u16 = match elem {
            ElemType::Word => 2,
            ElemType::Byte => 1,
        };
        let addr = self.values.alloc(width as usize * len as usize)?;
        Ok(Location::Absolute(addr))
    }

    fn scalar_addr(&self, loc: Location) -> u32 {
        match loc {
            Location::Absolute(a) => a,
            // Interpret mode never builds a real call stack for the value
            // store; locals resolve through `Variable::value` directly
            // (see `SymbolTable::set_scalar_value`), so this path is only
            // exercised by the compiled code generator, which never reads
            // it back through `ValueStore`.
            Location::FrameRelative(_) => 0,
        }
    }

    pub fn array_get(&self, var_index: usize, index: i32) -> Result<i32> {
        let var = self.symtab.get(var_index);
        match &var.kind {
            VarKind::Array { elem, storage } => {
                self.check_subscript(storage, index)?;
                let body = self.resolve_array_body(storage);
                let width = elem_width(*elem);
                let addr = body + (index as u32) * width as u32;
                Ok(match elem {
                    ElemType::Word => self.values.read_word(addr),
                    ElemType::Byte => self.values.read_byte(addr) as i32,
                })
            }
            VarKind::Scalar { .. } => Err(EngineError::Type),
        }
    }

    pub fn array_set(&mut self, var_index: usize, index: i32, value: i32) -> Result<()> {
        let var = self.symtab.get(var_index);
        if var.is_const {
            return Err(EngineError::AssigningConst(var.name.clone()));
        }
        let (elem, storage) = match &var.kind {
            VarKind::Array { elem, storage } => (*elem, *storage),
            VarKind::Scalar { .. } => return Err(EngineError::Type),
        };
        self.check_subscript(&storage, index)?;
        let body = self.resolve_array_body(&storage);
        let width = elem_width(elem);
        let addr = body + (index as u32) * width as u32;
        match elem {
            ElemType::Word => self.values.write_word(addr, value),
            ElemType::Byte => self.values.write_byte(addr, value as u8),
        }
        Ok(())
    }

    /// Rejects a subscript outside `[0, len)` before it ever reaches
    /// `resolve_array_body`'s address arithmetic, so an out-of-range index
    /// is always the recoverable `BadSubscript` rather than a `ValueStore`
    /// panic or a silently wrapped-around address.
    fn check_subscript(&self, storage: &ArrayStorage, index: i32) -> Result<()> {
        let len = self.array_len(storage);
        if index < 0 || index as u32 >= len as u32 {
            return Err(EngineError::BadSubscript);
        }
        Ok(())
    }

    fn array_len(&self, storage: &ArrayStorage) -> u16 {
        match storage {
            ArrayStorage::Owned { len, .. } => *len,
            ArrayStorage::ByRef { body } => match body {
                Location::Absolute(pseudo_addr) => {
                    let owner = self.symtab.get(*pseudo_addr as usize);
                    match &owner.kind {
                        VarKind::Array { storage, .. } => self.array_len(storage),
                        VarKind::Scalar { .. } => 0,
                    }
                }
                Location::FrameRelative(_) => 0,
            },
        }
    }

    /// `ByRef` arrays store, at their own body location, a pointer to the
    /// real body (the caller's array). `var_index` itself doubles as that
    /// pointer in interpret mode (`Evaluator::push_array_address`), so a
    /// by-ref body's "address" is really another variable's absolute body.
    pub(crate) fn resolve_array_body(&self, storage: &ArrayStorage) -> u32 {
        match storage {
            ArrayStorage::Owned { body, .. } => self.scalar_addr(*body),
            ArrayStorage::ByRef { body } => match body {
                Location::Absolute(pseudo_addr) => {
                    // The pseudo-address is a symbol-table index (see
                    // `push_array_address`); chase it one level to the real
                    // owner's body.
                    let owner = self.symtab.get(*pseudo_addr as usize);
                    match &owner.kind {
                        VarKind::Array { storage, .. } => self.resolve_array_body(storage),
                        VarKind::Scalar { .. } => 0,
                    }
                }
                Location::FrameRelative(_) => 0,
            },
        }
    }

    pub fn deref_word(&self, addr: i32) -> Result<i32> {
        if addr < 0 {
            return Err(EngineError::BadValue);
        }
        Ok(self.values.read_word(addr as u32))
    }

    pub fn deref_byte(&self, addr: i32) -> Result<u8> {
        if addr < 0 {
            return Err(EngineError::BadValue);
        }
        Ok(self.values.read_byte(addr as u32))
    }

    /// Defines a scalar variable with an already-evaluated initial value,
    /// allocating backing storage appropriate to the current mode.
    pub(crate) fn define_scalar(
        &mut self,
        name: String,
        elem: ElemType,
        is_const: bool,
        value: i32,
    ) -> Result<usize> {
        let loc = self.alloc_scalar_storage(elem)?;
        let idx = self.symtab.define(Variable { name, kind: VarKind::Scalar { elem, loc }, is_const, value })?;
        for w in self.symtab.warnings.drain(..) {
            warn!("{}", w);
        }
        Ok(idx)
    }

    pub(crate) fn define_array(
        &mut self,
        name: String,
        elem: ElemType,
        len: u16,
    ) -> Result<usize> {
        let body = self.alloc_array_storage(elem, len)?;
        let storage = ArrayStorage::Owned { body, len };
        let idx = self.symtab.define(Variable {
            name,
            kind: VarKind::Array { elem, storage },
            is_const: false,
            value: 0,
        })?;
        for w in self.symtab.warnings.drain(..) {
            warn!("{}", w);
        }
        Ok(idx)
    }

    pub(crate) fn define_array_by_ref(&mut self, name: String, elem: ElemType, owner_index: usize) -> Result<usize> {
        let storage = ArrayStorage::ByRef { body: Location::Absolute(owner_index as u32) };
        self.symtab.define(Variable { name, kind: VarKind::Array { elem, storage }, is_const: false, value: 0 })
    }

    /// Resets all runtime state (control-flow frames, local scopes, source
    /// position) back to top level. Called after any error or interrupt
    /// reaches the REPL boundary, matching the language's "warm reset"
    /// (spec.md 7): globals and the compiled program survive, everything
    /// else is discarded.
    pub fn warm_reset(&mut self) {
        self.frames.clear();
        while self.symtab.frame_depth() > 1 {
            let _ = self.symtab.pop_frame();
        }
        self.local_offset = 0;
        self.cursor = Cursor { line: 1, pos: 0 };
        self.interrupted = false;
    }

    /// The program-store line the cursor currently sits on, for error
    /// reporting (`Brk at <line>`, `?<msg> at <line>`).
    pub fn current_line(&self) -> i64 {
        self.cursor.line as i64
    }

    /// Runs the whole program from line 1 in interpret mode until it falls
    /// off the end, hits `quit`, errors, or is interrupted.
    pub fn run(&mut self) -> std::result::Result<(), Abort> {
        self.mode = Mode::Interpret;
        self.cursor = Cursor { line: 1, pos: 0 };
        self.frames.clear();
        loop {
            if self.interrupted {
                self.interrupted = false;
                return Err(Abort::Interrupt);
            }
            match self.step()? {
                StepOutcome::Continue => continue,
                StepOutcome::Returned => {
                    // A top-level RETURN with no enclosing call is a
                    // dangling frame pop; `step` already turned this into
                    // `EngineError::NoSub` before it could get here.
                    continue;
                }
                StepOutcome::ProgramEnd => return Ok(()),
            }
        }
    }

    /// Executes a single line of text as if it were the whole program,
    /// ignoring the stored program entirely. Used by the REPL's immediate
    /// mode. Any control-flow construct in `text` must be fully self
    /// contained: there is no following line to jump into.
    pub fn run_immediate(&mut self, text: &str) -> std::result::Result<(), Abort> {
        let saved_program = std::mem::take(&mut self.program);
        self.program.append(text).map_err(Abort::from)?;
        self.mode = Mode::Interpret;
        self.cursor = Cursor { line: 1, pos: 0 };
        self.frames.clear();
        let result = loop {
            match self.step() {
                Ok(StepOutcome::Continue) | Ok(StepOutcome::Returned) => continue,
                Ok(StepOutcome::ProgramEnd) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        self.program = saved_program;
        result
    }

    /// Compiles the whole program into `self.code`, linking subroutine
    /// calls once at the end, exactly as spec.md 4.5 describes.
    pub fn compile(&mut self) -> Result<()> {
        self.mode = Mode::Compile;
        self.cursor = Cursor { line: 1, pos: 0 };
        self.frames.clear();
        loop {
            match self.step()? {
                StepOutcome::Continue | StepOutcome::Returned => continue,
                StepOutcome::ProgramEnd => break,
            }
        }
        self.code.emit_op(crate::opcode::Opcode::End)?;
        let code = &mut self.code;
        self.linker.link(code)?;
        debug!("compiled {} bytes", self.code.pc());
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

fn elem_width(elem: ElemType) -> u16 {
    match elem {
        ElemType::Word => 2,
        ElemType::Byte => 1,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn array_get_set_round_trip() {
        let mut e = Engine::new_for_test();
        let idx = e.define_array("arr".into(), ElemType::Word, 4).unwrap();
        e.array_set(idx, 2, 42).unwrap();
        assert_eq!(e.array_get(idx, 2).unwrap(), 42);
    }

    #[test]
    fn warm_reset_clears_local_frames() {
        let mut e = Engine::new_for_test();
        e.symtab.push_frame();
        e.frames.push(Frame::Call(crate::frame::CallPayload::Compile));
        e.warm_reset();
        assert_eq!(e.symtab.frame_depth(), 1);
        assert!(e.frames.is_empty());
    }
}
