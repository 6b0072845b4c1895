use std::fmt;
use std::io;

/// One recoverable error kind, per the language's `?<short-message>` error
/// reporting convention. All of these are caught at the REPL boundary and
/// leave the engine in a well-defined (warm-reset) state.
#[derive(Debug)]
pub enum EngineError {
    NoIf,
    NoFor,
    NoWhile,
    NoSub,
    Stack,
    Complex,
    ExpectedVariable,
    Redefined(String),
    ExpectedChar(char),
    UnexpectedExtra,
    BadDim,
    BadSubscript,
    RanIntoSub,
    BadString,
    File(io::Error),
    BadLine,
    BadExpression,
    BadNumber,
    Argument,
    Type,
    DivideByZero,
    BadValue,
    NotConstant,
    AssigningConst(String),
    InitializerTooLong,
    Link(String),
    ArenaExhausted,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg: String = match self {
            EngineError::NoIf => "no if".into(),
            EngineError::NoFor => "no for".into(),
            EngineError::NoWhile => "no while".into(),
            EngineError::NoSub => "no sub".into(),
            EngineError::Stack => "stack".into(),
            EngineError::Complex => "complex".into(),
            EngineError::ExpectedVariable => "expected variable".into(),
            EngineError::Redefined(name) => format!("redefined {}", name),
            EngineError::ExpectedChar(c) => format!("expected '{}'", c),
            EngineError::UnexpectedExtra => "unexpected extra".into(),
            EngineError::BadDim => "bad dim".into(),
            EngineError::BadSubscript => "bad subscript".into(),
            EngineError::RanIntoSub => "ran into sub".into(),
            EngineError::BadString => "bad string".into(),
            EngineError::File(e) => format!("file: {}", e),
            EngineError::BadLine => "bad line".into(),
            EngineError::BadExpression => "bad expression".into(),
            EngineError::BadNumber => "bad number".into(),
            EngineError::Argument => "argument".into(),
            EngineError::Type => "type".into(),
            EngineError::DivideByZero => "div/0".into(),
            EngineError::BadValue => "bad value".into(),
            EngineError::NotConstant => "not constant".into(),
            EngineError::AssigningConst(name) => format!("assigning const {}", name),
            EngineError::InitializerTooLong => "initializer too long".into(),
            EngineError::Link(name) => format!("link: {}", name),
            EngineError::ArenaExhausted => "out of memory".into(),
        };
        write!(f, "?{}", msg)
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> EngineError {
        EngineError::File(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// What made `run` stop. `Interrupt` is the only variant that is not a plain
/// `EngineError`: a user keystroke aborts the current `run` the same way a
/// fatal error does (warm reset) but is reported as `Brk at <line>` rather
/// than `?<message>`.
#[derive(Debug)]
pub enum Abort {
    Error(EngineError),
    Interrupt,
}

impl From<EngineError> for Abort {
    fn from(err: EngineError) -> Abort {
        Abort::Error(err)
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Abort::Error(err) => write!(f, "{}", err),
            Abort::Interrupt => write!(f, "Brk"),
        }
    }
}
