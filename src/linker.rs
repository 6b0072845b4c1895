//! Subroutine linkage: two lists — definitions and call sites — resolved
//! in one pass after the final `END` opcode is emitted (spec.md 4.5).

use crate::codegen::CodeBuffer;
use crate::error::{EngineError, Result};
use crate::variable::{truncate_name, SubDef, SUB_NAME_SIG_CHARS};

#[derive(Debug, Clone)]
pub struct CallSite {
    pub name: String,
    /// Address of the 2-byte operand of the `JSRIMM` to patch.
    pub operand_addr: u32,
}

#[derive(Default)]
pub struct Linker {
    pub definitions: Vec<SubDef>,
    pub call_sites: Vec<CallSite>,
}

impl Linker {
    pub fn new() -> Linker {
        Linker::default()
    }

    pub fn define(&mut self, name: String, addr: u32) -> Result<()> {
        let truncated = truncate_name(&name, SUB_NAME_SIG_CHARS).to_string();
        if self.definitions.iter().any(|d| d.truncated_name() == truncated) {
            return Err(EngineError::Redefined(name));
        }
        self.definitions.push(SubDef { name, addr });
        Ok(())
    }

    pub fn find_definition(&self, name: &str) -> Option<&SubDef> {
        let truncated = truncate_name(name, SUB_NAME_SIG_CHARS);
        self.definitions.iter().find(|d| d.truncated_name() == truncated)
    }

    pub fn record_call(&mut self, name: String, operand_addr: u32) {
        self.call_sites.push(CallSite { name, operand_addr });
    }

    /// Resolves every call site against the definitions list. This runs
    /// once, after the final `END`, as the invariant in spec.md 8 requires:
    /// every call site patched to an address that exists by the time
    /// `writebytecode` begins.
    pub fn link(&self, code: &mut CodeBuffer) -> Result<()> {
        for call in &self.call_sites {
            let def = self
                .find_definition(&call.name)
                .ok_or_else(|| EngineError::Link(call.name.clone()))?;
            code.patch_at(call.operand_addr, def.addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn call_site_is_patched_to_definition_address() {
        let mut code = CodeBuffer::new(1024);
        let mut linker = Linker::new();
        linker.define("fib".to_string(), 0).unwrap();

        let fixup = code.emit_op_fixup(Opcode::JsrImm).unwrap();
        linker.record_call("fib".to_string(), fixup.addr());
        linker.link(&mut code).unwrap();
    }

    #[test]
    fn unresolved_call_is_link_error() {
        let mut code = CodeBuffer::new(1024);
        let mut linker = Linker::new();
        linker.record_call("ghost".to_string(), 0);
        assert!(matches!(linker.link(&mut code), Err(EngineError::Link(_))));
    }

    #[test]
    fn eight_char_truncation_matches_longer_names() {
        let mut linker = Linker::new();
        linker.define("subroutine_one".to_string(), 10).unwrap();
        assert!(linker.find_definition("subroutine_two").is_some());
    }
}
