//! Error codes for kiln diagnostics.

/// Error codes for categorizing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Lexer errors (E0001 - E0099)
    UnexpectedCharacter,
    UnterminatedString,
    InvalidEscape,
    InvalidNumber,

    // Parser errors (E0100 - E0199)
    UnexpectedToken,
    ExpectedExpression,
    ExpectedPattern,
    UnclosedDelimiter,
    DuplicateFormal,

    // Eval errors (E0300 - E0399)
    UnboundVariable,
    TypeError,
    DivisionByZero,
    AssertionFailed,
    MissingAttr,
    InfiniteRecursion,
    NotAFunction,
    WrongArity,
    DuplicateAttr,
    PathContextMismatch,
    Thrown,

    // Build/store errors (E0400 - E0499)
    BuildFailed,
    HashMismatch,
    SubstituteFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnexpectedCharacter => "E0001",
            ErrorCode::UnterminatedString => "E0002",
            ErrorCode::InvalidEscape => "E0003",
            ErrorCode::InvalidNumber => "E0004",

            ErrorCode::UnexpectedToken => "E0100",
            ErrorCode::ExpectedExpression => "E0101",
            ErrorCode::ExpectedPattern => "E0102",
            ErrorCode::UnclosedDelimiter => "E0103",
            ErrorCode::DuplicateFormal => "E0104",

            ErrorCode::UnboundVariable => "E0300",
            ErrorCode::TypeError => "E0301",
            ErrorCode::DivisionByZero => "E0302",
            ErrorCode::AssertionFailed => "E0303",
            ErrorCode::MissingAttr => "E0304",
            ErrorCode::InfiniteRecursion => "E0305",
            ErrorCode::NotAFunction => "E0306",
            ErrorCode::WrongArity => "E0307",
            ErrorCode::DuplicateAttr => "E0308",
            ErrorCode::PathContextMismatch => "E0309",
            ErrorCode::Thrown => "E0310",

            ErrorCode::BuildFailed => "E0400",
            ErrorCode::HashMismatch => "E0401",
            ErrorCode::SubstituteFailed => "E0402",
        }
    }

    /// Get a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::UnexpectedCharacter => "unexpected character in input",
            ErrorCode::UnterminatedString => "string literal is not terminated",
            ErrorCode::InvalidEscape => "invalid escape sequence in string",
            ErrorCode::InvalidNumber => "invalid number literal",

            ErrorCode::UnexpectedToken => "unexpected token",
            ErrorCode::ExpectedExpression => "expected an expression",
            ErrorCode::ExpectedPattern => "expected a pattern",
            ErrorCode::UnclosedDelimiter => "unclosed delimiter",
            ErrorCode::DuplicateFormal => "duplicate formal argument",

            ErrorCode::UnboundVariable => "undefined variable",
            ErrorCode::TypeError => "value is not of the expected type",
            ErrorCode::DivisionByZero => "division by zero",
            ErrorCode::AssertionFailed => "assertion failed",
            ErrorCode::MissingAttr => "attribute missing",
            ErrorCode::InfiniteRecursion => "infinite recursion encountered",
            ErrorCode::NotAFunction => "value is not callable",
            ErrorCode::WrongArity => "function called with wrong number of arguments",
            ErrorCode::DuplicateAttr => "duplicate attribute name",
            ErrorCode::PathContextMismatch => "a string that refers to a store path cannot be appended to a path",
            ErrorCode::Thrown => "explicit throw or abort",

            ErrorCode::BuildFailed => "build of derivation failed",
            ErrorCode::HashMismatch => "hash mismatch",
            ErrorCode::SubstituteFailed => "substituter failed",
        }
    }

    /// Get a suggested fix for the error, if available.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ErrorCode::UnterminatedString => Some("add a closing quote `\"` to terminate the string"),
            ErrorCode::UnclosedDelimiter => Some("add the matching closing delimiter"),
            ErrorCode::UnboundVariable => Some("check the spelling or ensure the variable is in scope"),
            ErrorCode::WrongArity => Some("check the function signature for the expected number of arguments"),
            ErrorCode::MissingAttr => Some("add the missing attribute, or use `or` to supply a default"),
            _ => None,
        }
    }
}
