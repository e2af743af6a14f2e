/// Compiler diagnostics: fatal errors and advisory warnings.
///
/// Errors carry a structured kind plus enough source context to render a
/// caret diagnostic. Warnings are collected on the parse result and also
/// emitted through the `tracing` warn channel as they are raised.
use crate::typehint::ValueKind;
use owo_colors::OwoColorize;
use std::fmt;
use std::sync::OnceLock;
use supports_color::Stream;

/// What went wrong. Variants mirror the points of detection in the parser;
/// each formats its own message.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum ErrorKind {
    #[error("unexpected symbol near {0}")]
    UnexpectedToken(String),
    #[error("{expected} expected (got {found})")]
    ExpectedToken { expected: String, found: String },
    #[error("missing '{terminator}' to close {opener} at line {opener_line}")]
    UnterminatedBlock {
        terminator: String,
        opener: String,
        opener_line: u32,
    },
    #[error("unknown type hint '{0}'")]
    UnknownTypeHint(String),
    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),
    #[error("too many {what} (limit is {limit})")]
    TooMany { what: &'static str, limit: u32 },
    #[error("chunk has too many syntax levels")]
    StackOverflow,
    #[error("attempt to reassign constant '{0}'")]
    AssignToConst(String),
    #[error("cannot use '...' outside a vararg function")]
    VarargOutsideVarargFunc,
    #[error("multiple to-be-closed variables in local list")]
    MultipleToBeClosed,
    #[error("unsupported tuple assignment")]
    UnsupportedTupleAssignment,
    #[error("malformed 'case' expression: must be compile-time constant")]
    NonConstantCase,
    #[error("'continue' outside of loop")]
    ContinueOutsideLoop,
    #[error("break outside loop at line {0}")]
    BreakOutsideLoop(u32),
    #[error("no visible label '{name}' for goto at line {line}")]
    UndefinedLabel { name: String, line: u32 },
    #[error("goto jumps into the scope of local '{0}'")]
    JumpIntoScope(String),
    #[error("label '{name}' already defined on line {prior_line}")]
    DuplicateLabel { name: String, prior_line: u32 },
    #[error("unary '-' on non-numeral type")]
    SafeNavOnNonNumeric,
    #[error("control structure too long")]
    ControlStructureTooLong,
    #[error("function arguments expected")]
    FunctionArgumentsExpected,
    #[error("malformed number")]
    MalformedNumber,
    #[error("unterminated string")]
    UnterminatedString,
    #[error("{0}")]
    Syntax(String),
}

impl ErrorKind {
    /// Diagnostic category, per the host error surface.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorKind::AssignToConst(_)
            | ErrorKind::UndefinedLabel { .. }
            | ErrorKind::JumpIntoScope(_)
            | ErrorKind::DuplicateLabel { .. }
            | ErrorKind::BreakOutsideLoop(_)
            | ErrorKind::MultipleToBeClosed
            | ErrorKind::UnknownTypeHint(_)
            | ErrorKind::UnknownAttribute(_) => "semantic error",
            _ => "syntax error",
        }
    }
}

/// A fatal compile error with the context needed for a caret diagnostic.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub line: u32,
    /// Chunk name the error is anchored to.
    pub source_name: String,
    /// Text of the anchored source line, when the lexer still had it.
    pub line_text: Option<String>,
    /// Short "here:" annotation under the caret.
    pub hint: Option<String>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, line: u32, source_name: impl Into<String>) -> Self {
        CompileError {
            kind,
            line,
            source_name: source_name.into(),
            line_text: None,
            hint: None,
        }
    }

    pub fn with_context(mut self, line_text: impl Into<String>, hint: impl Into<String>) -> Self {
        self.line_text = Some(line_text.into());
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = format!(
            "{}:{}: {}: {}",
            self.source_name,
            self.line,
            self.kind.category(),
            self.kind
        );
        if ansi_enabled() {
            write!(f, "{}", head.yellow())?;
        } else {
            write!(f, "{head}")?;
        }
        if let Some(text) = &self.line_text {
            let num = self.line.to_string();
            let pad = " ".repeat(num.len());
            let caret = "^".repeat(text.len().max(1));
            let hint = self.hint.as_deref().unwrap_or("this is invalid syntax.");
            let here = format!("{caret} here: {hint}");
            write!(f, "\n\t{num} | {text}")?;
            if ansi_enabled() {
                write!(f, "\n\t{pad} | {}", here.red())?;
            } else {
                write!(f, "\n\t{pad} | {here}")?;
            }
            write!(f, "\n\t{pad} |")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Advisory diagnostics; parsing continues after each.
#[derive(Clone, Debug, PartialEq)]
pub enum WarningKind {
    DuplicateLocalDeclaration { name: String, prior_line: u32 },
    TypeMismatch { name: String, hinted: ValueKind, actual: ValueKind },
    ReturnTypeMismatch { hinted: ValueKind, actual: ValueKind },
}

#[derive(Clone, Debug)]
pub struct Warning {
    pub kind: WarningKind,
    pub line: u32,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::DuplicateLocalDeclaration { name, prior_line } => write!(
                f,
                "duplicate local declaration: '{name}' shadows the declaration on line {prior_line}"
            ),
            WarningKind::TypeMismatch { name, hinted, actual } => write!(
                f,
                "'{name}' was type-hinted as {hinted} but is assigned a {actual} value"
            ),
            WarningKind::ReturnTypeMismatch { hinted, actual } => write!(
                f,
                "function was hinted to return {hinted} but actually returns {actual}"
            ),
        }
    }
}

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Whether diagnostics should carry ANSI color. Honors `NO_COLOR` and falls
/// back to terminal detection on stderr.
pub fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(|| {
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }
        supports_color::on_cached(Stream::Stderr).is_some()
    })
}
