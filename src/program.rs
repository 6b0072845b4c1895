//! Program store & line editor (spec.md 4.6). Source lives as an ordered,
//! 1-based sequence of lines. On the original hardware this was a singly
//! linked list carved out of Arena-P; here a `Vec<String>` gives the same
//! addressing and command semantics without the arena split being load-
//! bearing for correctness (see `crate::arena` for where that shape is
//! still preserved).

use crate::error::{EngineError, Result};

pub const MAX_LINE_LEN: usize = 254;

#[derive(Default)]
pub struct ProgramStore {
    lines: Vec<String>,
    pub edit_mode: bool,
    /// What `:a`, `:i`, or `:c` will do with the next typed line.
    pub pending_edit: Option<PendingEdit>,
}

#[derive(Debug, Clone, Copy)]
pub enum PendingEdit {
    AppendAfter(usize),
    InsertBefore(usize),
    Replace(usize),
}

fn check_len(text: &str) -> Result<()> {
    if text.len() > MAX_LINE_LEN {
        Err(EngineError::BadLine)
    } else {
        Ok(())
    }
}

impl ProgramStore {
    pub fn new() -> ProgramStore {
        ProgramStore::default()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// 1-based lookup, as every editor command and cursor in this crate
    /// addresses lines.
    pub fn line_text(&self, line: usize) -> Option<&str> {
        self.lines.get(line.checked_sub(1)?).map(|s| s.as_str())
    }

    pub fn append(&mut self, text: &str) -> Result<()> {
        check_len(text)?;
        self.lines.push(text.to_string());
        Ok(())
    }

    /// `:a n` — append after line `n` (0 means "append at start", matching
    /// the editor's behavior for an empty program).
    pub fn append_after(&mut self, n: usize, text: &str) -> Result<()> {
        check_len(text)?;
        let at = n.min(self.lines.len());
        self.lines.insert(at, text.to_string());
        Ok(())
    }

    /// `:i n` — insert before line `n`. Inserting before line 1 of an empty
    /// program is the same as appending.
    pub fn insert_before(&mut self, n: usize, text: &str) -> Result<()> {
        check_len(text)?;
        if n == 0 || n > self.lines.len() + 1 {
            return Err(EngineError::BadLine);
        }
        self.lines.insert(n - 1, text.to_string());
        Ok(())
    }

    pub fn replace(&mut self, n: usize, text: &str) -> Result<()> {
        check_len(text)?;
        let idx = n.checked_sub(1).ok_or(EngineError::BadLine)?;
        let slot = self.lines.get_mut(idx).ok_or(EngineError::BadLine)?;
        *slot = text.to_string();
        Ok(())
    }

    /// `:d n[,m]` — delete the (inclusive) range `[n, m]`, or just `n` if
    /// `m` is `None`.
    pub fn delete(&mut self, from: usize, to: Option<usize>) -> Result<()> {
        let to = to.unwrap_or(from);
        if from == 0 || from > to || to > self.lines.len() {
            return Err(EngineError::BadLine);
        }
        self.lines.drain((from - 1)..to);
        Ok(())
    }

    /// `:l [from[,to]]` — returns the inclusive range of lines to print.
    pub fn list_range(&self, from: Option<usize>, to: Option<usize>) -> Result<Vec<(usize, &str)>> {
        let from = from.unwrap_or(1);
        let to = to.unwrap_or(self.lines.len());
        if self.lines.is_empty() {
            return Ok(Vec::new());
        }
        if from == 0 || from > to || to > self.lines.len() {
            return Err(EngineError::BadLine);
        }
        Ok((from..=to).map(|n| (n, self.lines[n - 1].as_str())).collect())
    }

    /// Loads a whole program from text, trimming `\r`/`\n` line terminators
    /// (spec.md 4.6), discarding any program already present.
    pub fn load(&mut self, contents: &str) -> Result<()> {
        let mut lines = Vec::new();
        for raw in contents.split('\n') {
            let trimmed = raw.strip_suffix('\r').unwrap_or(raw);
            check_len(trimmed)?;
            lines.push(trimmed.to_string());
        }
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        self.lines = lines;
        Ok(())
    }

    /// Serialises with the platform's native newline.
    pub fn save_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_and_list() {
        let mut p = ProgramStore::new();
        p.append("word i").unwrap();
        p.append("pr.dec i").unwrap();
        let listed = p.list_range(None, None).unwrap();
        assert_eq!(listed, vec![(1, "word i"), (2, "pr.dec i")]);
    }

    #[test]
    fn insert_before_line_one_on_empty_program() {
        let mut p = ProgramStore::new();
        p.insert_before(1, "quit").unwrap();
        assert_eq!(p.line_text(1), Some("quit"));
    }

    #[test]
    fn delete_range() {
        let mut p = ProgramStore::new();
        for l in ["a", "b", "c", "d"] {
            p.append(l).unwrap();
        }
        p.delete(2, Some(3)).unwrap();
        assert_eq!(p.list_range(None, None).unwrap(), vec![(1, "a"), (2, "d")]);
    }

    #[test]
    fn replace_line() {
        let mut p = ProgramStore::new();
        p.append("old").unwrap();
        p.replace(1, "new").unwrap();
        assert_eq!(p.line_text(1), Some("new"));
    }

    #[test]
    fn load_trims_crlf() {
        let mut p = ProgramStore::new();
        p.load("a\r\nb\r\n").unwrap();
        assert_eq!(p.list_range(None, None).unwrap(), vec![(1, "a"), (2, "b")]);
    }

    #[test]
    fn line_too_long_is_rejected() {
        let mut p = ProgramStore::new();
        let long = "x".repeat(MAX_LINE_LEN + 1);
        assert!(matches!(p.append(&long), Err(EngineError::BadLine)));
    }
}
