//! The code emitter: a monotonically growing byte buffer plus a target PC,
//! with fixup support for forward branches. This is Arena-C (spec.md 2.2),
//! bottom-up, except that on a host with a real heap "bottom-up" just means
//! "append"; the `Arena` is kept alongside the buffer purely to give the
//! code-size ceiling (and its exhaustion error) real teeth.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::arena::{Arena, Direction};
use crate::error::Result;
use crate::opcode::Opcode;

/// Handle to a 2-byte operand slot recorded for later patching, e.g. the
/// branch target of an `IF`'s `BRNCHIMM` before the matching `ENDIF`/`ELSE`
/// is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup(u32);

impl Fixup {
    pub fn addr(self) -> u32 {
        self.0
    }
}

pub struct CodeBuffer {
    bytes: Vec<u8>,
    arena: Arena,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> CodeBuffer {
        CodeBuffer { bytes: Vec::new(), arena: Arena::new(capacity, Direction::Up) }
    }

    pub fn pc(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        self.arena.alloc(n)?;
        Ok(())
    }

    pub fn emit_op(&mut self, op: Opcode) -> Result<u32> {
        self.reserve(1)?;
        let at = self.pc();
        self.bytes.push(op.as_u8());
        Ok(at)
    }

    /// Emits an opcode followed by a 16-bit little-endian placeholder
    /// operand, returning a `Fixup` addressing that operand so it can be
    /// patched once the real target is known.
    pub fn emit_op_fixup(&mut self, op: Opcode) -> Result<Fixup> {
        debug_assert!(op.has_u16_operand());
        self.reserve(3)?;
        self.bytes.push(op.as_u8());
        let at = self.bytes.len() as u32;
        self.bytes.write_u16::<LittleEndian>(0xFFFF).expect("vec write is infallible");
        Ok(Fixup(at))
    }

    pub fn emit_op_u16(&mut self, op: Opcode, operand: u16) -> Result<u32> {
        debug_assert!(op.has_u16_operand());
        self.reserve(3)?;
        let at = self.pc();
        self.bytes.push(op.as_u8());
        self.bytes.write_u16::<LittleEndian>(operand).expect("vec write is infallible");
        Ok(at)
    }

    pub fn emit_op_u16_signed(&mut self, op: Opcode, operand: i16) -> Result<u32> {
        self.emit_op_u16(op, operand as u16)
    }

    /// Inline, null-terminated byte string for `PRMSG`.
    pub fn emit_msg(&mut self, text: &[u8]) -> Result<u32> {
        self.reserve(1 + text.len() + 1)?;
        let at = self.emit_op(Opcode::PrMsg)?;
        self.bytes.extend_from_slice(text);
        self.bytes.push(0);
        Ok(at)
    }

    /// Rewrites the 2-byte operand recorded by `emit_op_fixup` to `target`.
    pub fn patch(&mut self, fixup: Fixup, target: u32) {
        let at = fixup.0 as usize;
        let bytes = (target as u16).to_le_bytes();
        self.bytes[at] = bytes[0];
        self.bytes[at + 1] = bytes[1];
    }

    pub fn patch_at(&mut self, operand_addr: u32, target: u32) {
        self.patch(Fixup(operand_addr), target);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixup_patches_the_right_bytes() {
        let mut buf = CodeBuffer::new(1024);
        buf.emit_op(Opcode::Not).unwrap();
        let fixup = buf.emit_op_fixup(Opcode::BrnchImm).unwrap();
        let target_pc = buf.pc();
        buf.emit_op(Opcode::End).unwrap();
        buf.patch(fixup, target_pc);
        assert_eq!(&buf.bytes()[2..4], &target_pc.to_le_bytes()[..2]);
    }

    #[test]
    fn msg_is_null_terminated() {
        let mut buf = CodeBuffer::new(1024);
        buf.emit_msg(b"hi").unwrap();
        assert_eq!(buf.bytes(), &[Opcode::PrMsg.as_u8(), b'h', b'i', 0]);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut buf = CodeBuffer::new(1);
        buf.emit_op(Opcode::Not).unwrap();
        assert!(buf.emit_op(Opcode::End).is_err());
    }
}
