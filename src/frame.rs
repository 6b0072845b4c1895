//! Control-flow frames. In the original these are machine words pushed
//! bottom-up onto a return stack with a "magic word" kind tag examined in
//! O(1); in Rust the enum discriminant of `Frame` already *is* that O(1)
//! tag, so the magic words themselves (`IFFRAME`, `FORFRAME_B/W`, ...) are
//! dropped and only the payload survives, split interpret/compile exactly
//! as spec.md's table describes.

use crate::codegen::Fixup;
use crate::variable::ElemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfStatus {
    /// This IF set `skip` itself because its condition was false.
    SkippingBranch,
    /// Condition was true; this IF never touched `skip`.
    TakingBranch,
}

#[derive(Debug)]
pub enum IfPayload {
    Interpret { status: IfStatus },
    Compile { then_fixup: Fixup, else_fixup: Option<Fixup> },
}

#[derive(Debug)]
pub enum WhilePayload {
    Interpret { status: IfStatus, src_line: usize, text_pos: usize },
    Compile { guard_pc: u32, branch_fixup: Fixup },
}

#[derive(Debug)]
pub enum ForPayload {
    Interpret { src_line: usize, text_pos: usize, limit: i32, var_index: usize },
    /// `limit` is baked in as a compile-time constant: the compiler has no
    /// spare temporary to stash a runtime limit across loop iterations, so
    /// `FOR ... : limit` requires `limit` to fold to a constant in compiled
    /// programs (interpreted programs have no such restriction). See
    /// DESIGN.md.
    Compile { loop_pc: u32, var_index: usize, limit: i32, exit_fixup: Fixup },
}

#[derive(Debug)]
pub enum CallPayload {
    /// Interpret mode restores the caller's position from the `Cursor`
    /// `Engine::call_subroutine_interpret` saves and pushes separately;
    /// this variant only marks the frame as a call to pop on `return`.
    Interpret,
    /// Compiled calls return via the VM's own `RTS`; nothing to unwind here.
    Compile,
}

#[derive(Debug)]
pub enum Frame {
    If(IfPayload),
    While(WhilePayload),
    For { elem: ElemType, payload: ForPayload },
    Call(CallPayload),
}

impl Frame {
    pub fn is_call(&self) -> bool {
        matches!(self, Frame::Call(_))
    }
}
