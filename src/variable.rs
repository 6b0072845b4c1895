//! Variable records. Per REDESIGN FLAGS, the `length == -1` tagged-pointer
//! trick used to mark pass-by-reference arrays is replaced by a dedicated
//! `ArrayStorage` variant instead of a sentinel length.

pub const NAME_SIG_CHARS: usize = 4;
pub const SUB_NAME_SIG_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Word,
    Byte,
}

/// Where a variable's storage lives. In interpret mode this is an index
/// into the engine's value store; in compile mode it is the address the
/// code generator will bake into load/store instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Absolute address (global) or interpreter value-slot index.
    Absolute(u32),
    /// Signed, frame-relative offset from FP (local, compile mode only).
    FrameRelative(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayStorage {
    /// This variable owns its backing storage; `body` addresses the first
    /// element directly.
    Owned { body: Location, len: u16 },
    /// This variable was passed `name[]` into a subroutine; `body`
    /// addresses a *pointer* to the first element, so every access needs
    /// one extra indirection. This is the REDESIGN FLAGS replacement for
    /// `length == -1`.
    ByRef { body: Location },
}

impl ArrayStorage {
    pub fn body(&self) -> Location {
        match self {
            ArrayStorage::Owned { body, .. } => *body,
            ArrayStorage::ByRef { body } => *body,
        }
    }

    pub fn is_by_ref(&self) -> bool {
        matches!(self, ArrayStorage::ByRef { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Scalar { elem: ElemType, loc: Location },
    Array { elem: ElemType, storage: ArrayStorage },
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
    pub is_const: bool,
    /// Interpret-mode constant/initial value for a scalar; unused once the
    /// variable has a real storage slot under compile mode.
    pub value: i32,
}

impl Variable {
    pub fn truncated_name(&self) -> &str {
        truncate_name(&self.name, NAME_SIG_CHARS)
    }

    pub fn elem_type(&self) -> ElemType {
        match self.kind {
            VarKind::Scalar { elem, .. } => elem,
            VarKind::Array { elem, .. } => elem,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, VarKind::Array { .. })
    }
}

/// Truncates a name to its first `n` bytes for comparison purposes, exactly
/// as spec.md 4.4 requires ("Names compare on the first 4 characters;
/// subroutine names on the first 8."). Two source names differing only
/// after the truncation point collide; `SymbolTable::define` surfaces a
/// warning when that happens (see SPEC_FULL.md 5).
pub fn truncate_name(name: &str, n: usize) -> &str {
    match name.char_indices().nth(n) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

#[derive(Debug, Clone)]
pub struct SubDef {
    pub name: String,
    /// Entry point in the code buffer (compile mode) or the program-store
    /// line number of the `sub` statement (interpret mode).
    pub addr: u32,
}

impl SubDef {
    pub fn truncated_name(&self) -> &str {
        truncate_name(&self.name, SUB_NAME_SIG_CHARS)
    }
}
