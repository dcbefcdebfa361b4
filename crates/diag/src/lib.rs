//! Positioned diagnostics shared by every compiler pass.
//!
//! Each pass reports at most one `Diag` (first error wins) and the driver
//! maps the failing pass to a process exit code.

use std::fmt;

/// Stable error identifiers. Tests match on these rather than on message
/// text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagKind {
    // Preprocessor
    IncludeNotFound,
    CyclicMacro,
    MalformedDirective,
    // Lexer
    LexUnterminatedLiteral,
    LexBadNumber,
    LexBadChar,
    // Parser
    ParseUnexpectedToken,
    // Semantic analyzer
    UndefinedSymbol,
    DuplicateDefinition,
    TypeMismatch,
    FieldNotFound,
    ConstAssignment,
    NonLValueAssignment,
    BadBitFieldWidth,
    CircularType,
    ArraySizeNotConstant,
    ArityMismatch,
    // Bytecode generator
    CodegenBranchTooFar,
    // Driver / file system
    Io,
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single compile error with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diag {
    pub kind: DiagKind,
    pub file: Option<String>,
    pub line: u32,
    pub col: u32,
    pub message: String,
}

impl Diag {
    pub fn new(kind: DiagKind, line: u32, col: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: None,
            line,
            col,
            message: message.into(),
        }
    }

    /// Attach the file the error was found in, if not already known.
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        if self.file.is_none() {
            self.file = Some(file.into());
        }
        self
    }
}

impl fmt::Display for Diag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}:", file)?;
        }
        write!(
            f,
            "{}:{}: {}: {}",
            self.line, self.col, self.kind, self.message
        )
    }
}

impl std::error::Error for Diag {}

pub type Result<T> = std::result::Result<T, Diag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_position_and_kind() {
        let d = Diag::new(DiagKind::TypeMismatch, 3, 7, "expected int, got float");
        assert_eq!(d.to_string(), "3:7: TypeMismatch: expected int, got float");
        let d = d.with_file("main.rtmc");
        assert_eq!(
            d.to_string(),
            "main.rtmc:3:7: TypeMismatch: expected int, got float"
        );
    }

    #[test]
    fn with_file_keeps_first_file() {
        let d = Diag::new(DiagKind::IncludeNotFound, 1, 1, "no such file")
            .with_file("a.rtmc")
            .with_file("b.rtmc");
        assert_eq!(d.file.as_deref(), Some("a.rtmc"));
    }
}
