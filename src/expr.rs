//! The expression engine: Dijkstra shunting-yard with an explicit operator
//! stack, driving one of two `ExprSink` implementations (REDESIGN FLAGS:
//! "two-mode duality is cleaner as two implementations of the same
//! expression-sink abstraction"). `Evaluator` folds `i32` values for
//! immediate-mode execution; `Emitter` emits VM opcodes for compilation.
//! Neither sink borrows the engine; every sink method takes the engine as
//! an explicit `ctx` parameter, so the same `&mut Engine` can be re-entered
//! for call-in-expression without fighting the borrow checker.

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::lexer::Lexer;
use crate::opcode::Opcode;
use crate::token::{BinOp, Keyword, Token, UnaryOp};
use crate::variable::{ElemType, Location, VarKind};

pub trait ExprSink {
    fn push_const(&mut self, ctx: &mut Engine, value: i32) -> Result<()>;
    fn push_scalar(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()>;
    /// Subscripted access `name[expr]`. The index expression has already
    /// been parsed into this same sink by the caller before this is
    /// invoked, so for `Evaluator` the index sits on top of its value
    /// stack; for `Emitter` the index is already on the VM's eval stack.
    fn index_array(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()>;
    /// Bare array name (`a` meaning `&a[0]`) and explicit `&name`.
    fn push_array_address(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()>;
    fn call(&mut self, ctx: &mut Engine, name: &str, argc: usize) -> Result<()>;
    fn apply_unary(&mut self, ctx: &mut Engine, op: UnaryOp) -> Result<()>;
    fn apply_binary(&mut self, ctx: &mut Engine, op: BinOp) -> Result<()>;
    /// `kbd.ch` used as an expression primary: reads one byte from the
    /// keyboard stream and yields it.
    fn push_kbd_ch(&mut self, ctx: &mut Engine) -> Result<()>;
}

/// Interpret-mode sink: a plain value stack. `require_const` turns on the
/// check `eval_expr_constant` needs (array sizes, initializer elements, a
/// compiled `for`'s limit) without touching ordinary interpret-mode
/// evaluation, where reading any live variable is completely normal.
#[derive(Default)]
pub struct Evaluator {
    stack: Vec<i32>,
    require_const: bool,
}

impl Evaluator {
    pub fn new() -> Evaluator {
        Evaluator::default()
    }

    pub fn require_const() -> Evaluator {
        Evaluator { require_const: true, ..Evaluator::default() }
    }

    pub fn result(mut self) -> Result<i32> {
        self.stack.pop().ok_or(EngineError::BadExpression)
    }

    fn pop(&mut self) -> Result<i32> {
        self.stack.pop().ok_or(EngineError::BadExpression)
    }
}

impl ExprSink for Evaluator {
    fn push_const(&mut self, _ctx: &mut Engine, value: i32) -> Result<()> {
        self.stack.push(value);
        Ok(())
    }

    fn push_scalar(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()> {
        let var = ctx.symtab().get(var_index);
        if self.require_const && !var.is_const {
            return Err(EngineError::NotConstant);
        }
        self.stack.push(var.value);
        Ok(())
    }

    fn index_array(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()> {
        if self.require_const {
            return Err(EngineError::NotConstant);
        }
        let index = self.pop()?;
        let value = ctx.array_get(var_index, index)?;
        self.stack.push(value);
        Ok(())
    }

    fn push_array_address(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()> {
        // Interpret mode has no real address space; the array's identity
        // (its index in the symbol table) stands in for "address" so that
        // pass-by-reference can still copy a body pointer by value.
        let _ = ctx;
        self.stack.push(var_index as i32);
        Ok(())
    }

    fn call(&mut self, ctx: &mut Engine, name: &str, argc: usize) -> Result<()> {
        if self.require_const {
            return Err(EngineError::NotConstant);
        }
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let result = ctx.call_subroutine_interpret(name, &args)?;
        self.stack.push(result);
        Ok(())
    }

    fn apply_unary(&mut self, ctx: &mut Engine, op: UnaryOp) -> Result<()> {
        let v = self.pop()?;
        let result = match op {
            UnaryOp::Neg => v.wrapping_neg(),
            UnaryOp::Pos => v,
            UnaryOp::Not => (v == 0) as i32,
            UnaryOp::BitNot => !v,
            UnaryOp::DerefWord => ctx.deref_word(v)?,
            UnaryOp::DerefByte => ctx.deref_byte(v)? as i32,
        };
        self.stack.push(result);
        Ok(())
    }

    fn push_kbd_ch(&mut self, ctx: &mut Engine) -> Result<()> {
        if self.require_const {
            return Err(EngineError::NotConstant);
        }
        let c = ctx.read_kbd_char()?;
        self.stack.push(c as i32);
        Ok(())
    }

    fn apply_binary(&mut self, _ctx: &mut Engine, op: BinOp) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match op {
            BinOp::Pow => ipow(a, b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(EngineError::DivideByZero);
                }
                a.wrapping_div(b)
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(EngineError::DivideByZero);
                }
                a.wrapping_rem(b)
            }
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Shl => a.wrapping_shl(b as u32),
            BinOp::Shr => a.wrapping_shr(b as u32),
            BinOp::Lt => (a < b) as i32,
            BinOp::Le => (a <= b) as i32,
            BinOp::Gt => (a > b) as i32,
            BinOp::Ge => (a >= b) as i32,
            BinOp::Eq => (a == b) as i32,
            BinOp::Ne => (a != b) as i32,
            BinOp::BitAnd => a & b,
            BinOp::BitXor => a ^ b,
            BinOp::BitOr => a | b,
            BinOp::And => ((a != 0) && (b != 0)) as i32,
            BinOp::Or => ((a != 0) || (b != 0)) as i32,
        };
        self.stack.push(result);
        Ok(())
    }
}

/// Open question noted in spec.md 9: `_pow` with negative `y` returns 1
/// because of the loop bound in the original. Replicated here rather than
/// rejected, so existing programs that rely on it keep behaving the same
/// way; see DESIGN.md.
fn ipow(base: i32, exp: i32) -> i32 {
    let mut result: i32 = 1;
    let mut i = 0;
    while i < exp {
        result = result.wrapping_mul(base);
        i += 1;
    }
    result
}

/// Compile-mode sink: emits opcodes; operands live on the VM's eval stack,
/// not here.
pub struct Emitter;

impl Emitter {
    pub fn new() -> Emitter {
        Emitter
    }

    fn scalar_location(ctx: &Engine, var_index: usize) -> Result<(Location, ElemType)> {
        match ctx.symtab().get(var_index).kind {
            VarKind::Scalar { elem, loc } => Ok((loc, elem)),
            VarKind::Array { .. } => Err(EngineError::Type),
        }
    }

    fn emit_load(ctx: &mut Engine, loc: Location, elem: ElemType) -> Result<()> {
        let code = ctx.code_mut();
        match (loc, elem) {
            (Location::Absolute(addr), ElemType::Word) => {
                code.emit_op_u16(Opcode::LdaWordImm, addr as u16)?;
            }
            (Location::Absolute(addr), ElemType::Byte) => {
                code.emit_op_u16(Opcode::LdaByteImm, addr as u16)?;
            }
            (Location::FrameRelative(off), ElemType::Word) => {
                code.emit_op_u16_signed(Opcode::LdrWordImm, off as i16)?;
            }
            (Location::FrameRelative(off), ElemType::Byte) => {
                code.emit_op_u16_signed(Opcode::LdrByteImm, off as i16)?;
            }
        }
        Ok(())
    }

    pub(crate) fn emit_array_body_address(ctx: &mut Engine, var_index: usize) -> Result<ElemType> {
        let var = ctx.symtab().get(var_index).clone();
        let (elem, storage) = match var.kind {
            VarKind::Array { elem, storage } => (elem, storage),
            VarKind::Scalar { .. } => return Err(EngineError::Type),
        };
        let body = storage.body();
        if storage.is_by_ref() {
            // One extra indirection: load the stored body pointer first,
            // which leaves an absolute runtime address on the VM stack.
            Self::emit_load(ctx, body, ElemType::Word)?;
        } else {
            match body {
                Location::Absolute(addr) => {
                    ctx.code_mut().emit_op_u16(Opcode::LdImm, addr as u16)?;
                }
                Location::FrameRelative(off) => {
                    ctx.code_mut().emit_op_u16_signed(Opcode::LdImm, off as i16)?;
                    // Convert the frame-relative base into an absolute
                    // address so the index arithmetic below is uniform.
                    ctx.code_mut().emit_op(Opcode::RtoA)?;
                }
            }
        }
        Ok(elem)
    }
}

impl ExprSink for Emitter {
    fn push_const(&mut self, ctx: &mut Engine, value: i32) -> Result<()> {
        ctx.code_mut().emit_op_u16(Opcode::LdImm, value as u16)?;
        Ok(())
    }

    fn push_scalar(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()> {
        let (loc, elem) = Self::scalar_location(ctx, var_index)?;
        Self::emit_load(ctx, loc, elem)
    }

    fn index_array(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()> {
        // Stack already holds the index (from the subscript expression
        // parsed by the caller). Scale it by element width and add the
        // array's base address, then load through the resulting absolute
        // address.
        let elem = Self::emit_array_body_address(ctx, var_index)?;
        let width: i32 = match elem {
            ElemType::Word => 2,
            ElemType::Byte => 1,
        };
        // The index was parsed (and its code emitted) before this method
        // ran; the base address was just pushed above it, so the stack
        // reads [..., index, base]. SWAP puts base beneath index so the
        // scaled index can be added to it.
        let code = ctx.code_mut();
        code.emit_op(Opcode::Swap)?;
        code.emit_op_u16(Opcode::LdImm, width as u16)?;
        code.emit_op(Opcode::Mul)?;
        code.emit_op(Opcode::Add)?;
        let load_op = match elem {
            ElemType::Word => Opcode::LdaWord,
            ElemType::Byte => Opcode::LdaByte,
        };
        ctx.code_mut().emit_op(load_op)?;
        Ok(())
    }

    fn push_array_address(&mut self, ctx: &mut Engine, var_index: usize) -> Result<()> {
        Self::emit_array_body_address(ctx, var_index)?;
        Ok(())
    }

    fn call(&mut self, ctx: &mut Engine, name: &str, argc: usize) -> Result<()> {
        ctx.emit_call(name, argc)
    }

    fn push_kbd_ch(&mut self, ctx: &mut Engine) -> Result<()> {
        ctx.code_mut().emit_op(Opcode::KbdCh)?;
        Ok(())
    }

    fn apply_unary(&mut self, ctx: &mut Engine, op: UnaryOp) -> Result<()> {
        let code = ctx.code_mut();
        match op {
            UnaryOp::Neg => code.emit_op(Opcode::Neg)?,
            UnaryOp::Pos => return Ok(()),
            UnaryOp::Not => code.emit_op(Opcode::Not)?,
            UnaryOp::BitNot => code.emit_op(Opcode::BitNot)?,
            UnaryOp::DerefWord => code.emit_op(Opcode::LdaWord)?,
            UnaryOp::DerefByte => code.emit_op(Opcode::LdaByte)?,
        };
        Ok(())
    }

    fn apply_binary(&mut self, ctx: &mut Engine, op: BinOp) -> Result<()> {
        let code = ctx.code_mut();
        let opcode = match op {
            BinOp::Pow => {
                // No dedicated POW opcode in `Opcode`, and no CALL-based
                // runtime intrinsic stands in for one either, so compiled
                // `**` is rejected outright rather than folded or emulated.
                return Err(EngineError::Complex);
            }
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Mod => Opcode::Mod,
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Shl => Opcode::Lsh,
            BinOp::Shr => Opcode::Rsh,
            BinOp::Lt => Opcode::Lt,
            BinOp::Le => Opcode::Lte,
            BinOp::Gt => Opcode::Gt,
            BinOp::Ge => Opcode::Gte,
            BinOp::Eq => Opcode::Eql,
            BinOp::Ne => Opcode::Neql,
            BinOp::BitAnd => Opcode::BitAnd,
            BinOp::BitXor => Opcode::BitXor,
            BinOp::BitOr => Opcode::BitOr,
            BinOp::And => Opcode::And,
            BinOp::Or => Opcode::Or,
        };
        code.emit_op(opcode)?;
        Ok(())
    }
}

fn token_as_unary(tok: &Token) -> Option<UnaryOp> {
    match tok {
        Token::Minus => Some(UnaryOp::Neg),
        Token::Plus => Some(UnaryOp::Pos),
        Token::Bang => Some(UnaryOp::Not),
        Token::Tilde => Some(UnaryOp::BitNot),
        Token::Star => Some(UnaryOp::DerefWord),
        Token::Caret => Some(UnaryOp::DerefByte),
        _ => None,
    }
}

fn token_as_binary(tok: &Token) -> Option<BinOp> {
    match tok {
        Token::StarStar => Some(BinOp::Pow),
        Token::Star => Some(BinOp::Mul),
        Token::Slash => Some(BinOp::Div),
        Token::Percent => Some(BinOp::Mod),
        Token::Plus => Some(BinOp::Add),
        Token::Minus => Some(BinOp::Sub),
        Token::Shl => Some(BinOp::Shl),
        Token::Shr => Some(BinOp::Shr),
        Token::Lt => Some(BinOp::Lt),
        Token::Le => Some(BinOp::Le),
        Token::Gt => Some(BinOp::Gt),
        Token::Ge => Some(BinOp::Ge),
        Token::EqEq => Some(BinOp::Eq),
        Token::Ne => Some(BinOp::Ne),
        Token::Amp => Some(BinOp::BitAnd),
        Token::Caret => Some(BinOp::BitXor),
        Token::Pipe => Some(BinOp::BitOr),
        Token::AmpAmp => Some(BinOp::And),
        Token::PipePipe => Some(BinOp::Or),
        _ => None,
    }
}

/// Drives one expression, from a `SENTINEL` precedence floor to the first
/// token that cannot extend it. Shared by both sinks; the only mode-
/// specific code lives behind the `ExprSink` methods.
pub struct ExprParser<'a, 'src> {
    lexer: &'a mut Lexer<'src>,
    operators: Vec<BinOp>,
}

impl<'a, 'src> ExprParser<'a, 'src> {
    pub fn parse<S: ExprSink>(
        ctx: &mut Engine,
        sink: &mut S,
        lexer: &'a mut Lexer<'src>,
    ) -> Result<()> {
        let mut parser = ExprParser { lexer, operators: Vec::new() };
        parser.parse_operand(ctx, sink)?;
        loop {
            let save = parser.lexer.pos();
            let tok = parser.lexer.next_token()?;
            match token_as_binary(&tok) {
                Some(op) => {
                    parser.reduce_to(ctx, sink, op)?;
                    parser.operators.push(op);
                    parser.parse_operand(ctx, sink)?;
                }
                None => {
                    // Not an operator continuation; put the token back by
                    // rewinding the lexer to before it.
                    *parser.lexer = Lexer::at(
                        parser.lexer.full_source(),
                        save,
                    );
                    break;
                }
            }
        }
        parser.reduce_all(ctx, sink)?;
        Ok(())
    }


    fn reduce_to<S: ExprSink>(&mut self, ctx: &mut Engine, sink: &mut S, incoming: BinOp) -> Result<()> {
        while let Some(&top) = self.operators.last() {
            let should_pop = if incoming.right_assoc() {
                top.precedence() > incoming.precedence()
            } else {
                top.precedence() >= incoming.precedence()
            };
            if !should_pop {
                break;
            }
            self.operators.pop();
            sink.apply_binary(ctx, top)?;
        }
        Ok(())
    }

    fn reduce_all<S: ExprSink>(&mut self, ctx: &mut Engine, sink: &mut S) -> Result<()> {
        while let Some(op) = self.operators.pop() {
            sink.apply_binary(ctx, op)?;
        }
        Ok(())
    }

    fn parse_operand<S: ExprSink>(&mut self, ctx: &mut Engine, sink: &mut S) -> Result<()> {
        let mut pending_unary = Vec::new();
        loop {
            let save = self.lexer.pos();
            let tok = self.lexer.next_token()?;
            match token_as_unary(&tok) {
                Some(op) => pending_unary.push(op),
                None => {
                    *self.lexer = Lexer::at(
                        self.lexer.full_source(),
                        save,
                    );
                    break;
                }
            }
        }
        self.parse_primary(ctx, sink)?;
        for op in pending_unary.into_iter().rev() {
            sink.apply_unary(ctx, op)?;
        }
        Ok(())
    }

    fn parse_primary<S: ExprSink>(&mut self, ctx: &mut Engine, sink: &mut S) -> Result<()> {
        let tok = self.lexer.next_token()?;
        match tok {
            Token::IntLit(v) => sink.push_const(ctx, v),
            Token::CharLit(c) => sink.push_const(ctx, c as i32),
            Token::LParen => {
                ExprParser::parse(ctx, sink, self.lexer)?;
                self.expect(Token::RParen)
            }
            Token::Amp => {
                // Explicit address-of. Only meaningful for arrays in this
                // language (scalars have no addressable identity visible
                // to the source); the parser still accepts `&scalar` by
                // falling through to a plain load, matching the original's
                // leniency.
                let name = self.expect_ident()?;
                let var_index = ctx.resolve_var(&name)?;
                if ctx.symtab().get(var_index).is_array() {
                    sink.push_array_address(ctx, var_index)
                } else {
                    sink.push_scalar(ctx, var_index)
                }
            }
            Token::Ident(name) => self.parse_ident_primary(ctx, sink, name),
            // `kbd.ch` is the one keyword that doubles as an expression
            // primary: reading a byte from the keyboard and yielding it as
            // a value, rather than only as a standalone statement.
            Token::Keyword(Keyword::KbdCh) => sink.push_kbd_ch(ctx),
            _ => Err(EngineError::BadExpression),
        }
    }

    fn parse_ident_primary<S: ExprSink>(
        &mut self,
        ctx: &mut Engine,
        sink: &mut S,
        name: String,
    ) -> Result<()> {
        let save = self.lexer.pos();
        let tok = self.lexer.next_token()?;
        match tok {
            Token::LParen => {
                let argc = self.parse_call_args(ctx, sink)?;
                sink.call(ctx, &name, argc)
            }
            Token::LBracket => {
                let var_index = ctx.resolve_var(&name)?;
                ExprParser::parse(ctx, sink, self.lexer)?;
                self.expect(Token::RBracket)?;
                sink.index_array(ctx, var_index)
            }
            _ => {
                *self.lexer = Lexer::at(
                    self.lexer.full_source(),
                    save,
                );
                let var_index = ctx.resolve_var(&name)?;
                if ctx.symtab().get(var_index).is_array() {
                    // Bare array name == &name[0] (critical for
                    // pass-by-reference parameter passing).
                    sink.push_array_address(ctx, var_index)
                } else {
                    sink.push_scalar(ctx, var_index)
                }
            }
        }
    }

    fn parse_call_args<S: ExprSink>(&mut self, ctx: &mut Engine, sink: &mut S) -> Result<usize> {
        let mut argc = 0;
        let save = self.lexer.pos();
        let tok = self.lexer.next_token()?;
        if tok == Token::RParen {
            return Ok(0);
        }
        *self.lexer = Lexer::at(self.lexer.full_source(), save);
        loop {
            ExprParser::parse(ctx, sink, self.lexer)?;
            argc += 1;
            let tok = self.lexer.next_token()?;
            match tok {
                Token::Comma => continue,
                Token::RParen => break,
                _ => return Err(EngineError::ExpectedChar(')')),
            }
        }
        Ok(argc)
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let tok = self.lexer.next_token()?;
        if tok == expected {
            Ok(())
        } else {
            Err(EngineError::BadExpression)
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.lexer.next_token()? {
            Token::Ident(s) => Ok(s),
            _ => Err(EngineError::ExpectedVariable),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Engine;

    fn eval(engine: &mut Engine, src: &str) -> i32 {
        let mut lexer = Lexer::new(src);
        let mut sink = Evaluator::new();
        ExprParser::parse(engine, &mut sink, &mut lexer).unwrap();
        sink.result().unwrap()
    }

    #[test]
    fn precedence_mul_before_add() {
        let mut e = Engine::new_for_test();
        assert_eq!(eval(&mut e, "2+3*4"), 14);
    }

    #[test]
    fn left_associative_subtraction() {
        let mut e = Engine::new_for_test();
        assert_eq!(eval(&mut e, "10-3-2"), 5);
    }

    #[test]
    fn power_is_right_associative_by_virtue_of_being_highest() {
        let mut e = Engine::new_for_test();
        assert_eq!(eval(&mut e, "2**3"), 8);
    }

    #[test]
    fn unary_minus_binds_tighter_than_power() {
        let mut e = Engine::new_for_test();
        // -2**2 == (-2)**2 == 4 under this grammar, since unary applies to
        // the immediately following primary before any binary reduction.
        assert_eq!(eval(&mut e, "-2**2"), 4);
    }

    #[test]
    fn divide_by_zero_is_an_error() {
        let mut e = Engine::new_for_test();
        let mut lexer = Lexer::new("1/0");
        let mut sink = Evaluator::new();
        assert!(matches!(
            ExprParser::parse(&mut e, &mut sink, &mut lexer),
            Err(EngineError::DivideByZero)
        ));
    }

    #[test]
    fn parenthesised_expression() {
        let mut e = Engine::new_for_test();
        assert_eq!(eval(&mut e, "(2+3)*4"), 20);
    }
}
