//! Character classification and tokenisation of a single source line.
//!
//! A `Lexer` never looks past the line it was built with: statements are
//! separated by `;` within a line, and the statement dispatcher advances
//! to the next program-store line itself. Maximum line length is 254
//! bytes (spec.md 6); longer lines are rejected by the program store
//! before a `Lexer` ever sees them.

use crate::error::{EngineError, Result};
use crate::token::{Keyword, Token};

pub fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

pub fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.'
}

pub fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

pub fn is_hex_digit(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

pub struct Lexer<'a> {
    text: &'a str,
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer { text: src, src: src.as_bytes(), pos: 0 }
    }

    pub fn at(src: &'a str, pos: usize) -> Lexer<'a> {
        Lexer { text: src, src: src.as_bytes(), pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The full source text this lexer was built from, regardless of how
    /// far `pos` has advanced. Used by the expression parser to rewind
    /// (put back) a token it over-read while checking for a continuation.
    pub fn full_source(&self) -> &'a str {
        self.text
    }

    pub fn remainder(&self) -> &'a [u8] {
        &self.src[self.pos.min(self.src.len())..]
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    pub fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    /// Scans the remainder of the current statement (up to `;` or end of
    /// line) verbatim, for `pr.msg`-style string arguments and the editor's
    /// `FULLLINE` shape. Leading whitespace is skipped first.
    pub fn rest_of_statement(&mut self) -> &'a str {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b';' {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("")
    }

    pub fn at_statement_end(&mut self) -> bool {
        self.skip_whitespace();
        matches!(self.peek(), None | Some(b';'))
    }

    pub fn consume_semicolon(&mut self) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(b';') {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();
        let c = match self.peek() {
            None => return Ok(Token::Eof),
            Some(c) => c,
        };

        if is_ident_start(c) {
            return Ok(self.scan_ident());
        }
        if is_digit(c) {
            return self.scan_decimal();
        }

        match c {
            b'$' => {
                self.bump();
                self.scan_hex()
            }
            b'\'' => self.scan_char_lit(),
            b'"' => self.scan_string_lit(),
            b'(' => { self.bump(); Ok(Token::LParen) }
            b')' => { self.bump(); Ok(Token::RParen) }
            b'[' => { self.bump(); Ok(Token::LBracket) }
            b']' => { self.bump(); Ok(Token::RBracket) }
            b'{' => { self.bump(); Ok(Token::LBrace) }
            b'}' => { self.bump(); Ok(Token::RBrace) }
            b',' => { self.bump(); Ok(Token::Comma) }
            b':' => { self.bump(); Ok(Token::Colon) }
            b';' => { self.bump(); Ok(Token::Semicolon) }
            b'&' => {
                self.bump();
                if self.peek() == Some(b'&') {
                    self.bump();
                    Ok(Token::AmpAmp)
                } else {
                    Ok(Token::Amp)
                }
            }
            b'|' => {
                self.bump();
                if self.peek() == Some(b'|') {
                    self.bump();
                    Ok(Token::PipePipe)
                } else {
                    Ok(Token::Pipe)
                }
            }
            b'*' => {
                self.bump();
                if self.peek() == Some(b'*') {
                    self.bump();
                    Ok(Token::StarStar)
                } else {
                    Ok(Token::Star)
                }
            }
            b'/' => { self.bump(); Ok(Token::Slash) }
            b'%' => { self.bump(); Ok(Token::Percent) }
            b'+' => { self.bump(); Ok(Token::Plus) }
            b'-' => { self.bump(); Ok(Token::Minus) }
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Bang)
                }
            }
            b'~' => { self.bump(); Ok(Token::Tilde) }
            b'^' => { self.bump(); Ok(Token::Caret) }
            b'<' => {
                self.bump();
                match self.peek() {
                    Some(b'=') => { self.bump(); Ok(Token::Le) }
                    Some(b'<') => { self.bump(); Ok(Token::Shl) }
                    _ => Ok(Token::Lt),
                }
            }
            b'>' => {
                self.bump();
                match self.peek() {
                    Some(b'=') => { self.bump(); Ok(Token::Ge) }
                    Some(b'>') => { self.bump(); Ok(Token::Shr) }
                    _ => Ok(Token::Gt),
                }
            }
            b'=' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Ok(Token::EqEq)
                } else {
                    Ok(Token::Assign)
                }
            }
            _ => Err(EngineError::BadExpression),
        }
    }

    fn scan_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        // `pr.` and `kbd.` dotted keywords need the longest match across the
        // dot; plain identifiers never contain a dot so this never shadows
        // a user variable name.
        if let Some(kw) = Keyword::lookup(text) {
            Token::Keyword(kw)
        } else {
            Token::Ident(text.to_string())
        }
    }

    fn scan_decimal(&mut self) -> Result<Token> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_digit(c)) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        text.parse::<i32>()
            .map(Token::IntLit)
            .map_err(|_| EngineError::BadNumber)
    }

    fn scan_hex(&mut self) -> Result<Token> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_hex_digit(c)) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(EngineError::BadNumber);
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        i32::from_str_radix(text, 16)
            .map(Token::IntLit)
            .map_err(|_| EngineError::BadNumber)
    }

    fn scan_char_lit(&mut self) -> Result<Token> {
        self.bump(); // opening quote
        let c = self.bump().ok_or(EngineError::BadExpression)?;
        let value = if c == b'\\' {
            let esc = self.bump().ok_or(EngineError::BadExpression)?;
            match esc {
                b'n' => b'\n',
                b't' => b'\t',
                b'0' => 0,
                b'\\' => b'\\',
                b'\'' => b'\'',
                other => other,
            }
        } else {
            c
        };
        if self.peek() != Some(b'\'') {
            return Err(EngineError::ExpectedChar('\''));
        }
        self.bump();
        Ok(Token::CharLit(value))
    }

    fn scan_string_lit(&mut self) -> Result<Token> {
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None => return Err(EngineError::BadString),
                Some(b'"') => break,
                Some(b'\\') => {
                    let esc = self.bump().ok_or(EngineError::BadString)?;
                    bytes.push(match esc {
                        b'n' => b'\n',
                        b't' => b'\t',
                        other => other,
                    });
                }
                Some(c) => bytes.push(c),
            }
        }
        Ok(Token::StringLit(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lex = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lex.next_token().unwrap();
            if t == Token::Eof {
                break;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn decimal_and_hex() {
        assert_eq!(tokens("42 $2A"), vec![Token::IntLit(42), Token::IntLit(42)]);
    }

    #[test]
    fn char_literal() {
        assert_eq!(tokens("'a'"), vec![Token::CharLit(b'a')]);
    }

    #[test]
    fn two_char_operators_take_priority() {
        assert_eq!(tokens("a<=b"), vec![
            Token::Ident("a".into()),
            Token::Le,
            Token::Ident("b".into()),
        ]);
        assert_eq!(tokens("a<<b"), vec![
            Token::Ident("a".into()),
            Token::Shl,
            Token::Ident("b".into()),
        ]);
    }

    #[test]
    fn dotted_keyword_is_one_token() {
        assert_eq!(tokens("pr.dec"), vec![Token::Keyword(Keyword::PrDec)]);
    }

    #[test]
    fn power_operator() {
        assert_eq!(tokens("2**3"), vec![Token::IntLit(2), Token::StarStar, Token::IntLit(3)]);
    }
}
