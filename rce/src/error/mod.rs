//! Error types and reporting

use crate::lexer::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, RceError>;

/// Library error.
///
/// Analysis incompleteness is never an error: the prover answers
/// `Irreducible` and the loop model answers `Opaque`. These variants cover
/// broken inputs and misuse of the optimizer's state.
#[derive(Debug, Error)]
pub enum RceError {
    #[error("Lexer error at {span}: {message}")]
    Lexer { message: String, span: Span },

    #[error("Parser error at {span}: {message}")]
    Parser { message: String, span: Span },

    /// Structurally invalid IR snapshot
    #[error("Malformed IR: {message}")]
    MalformedIr { message: String },

    /// Use of an induction variable derived before the loop shape changed
    #[error("Stale induction variable: {message}")]
    StaleInduction { message: String },

    /// Check state machine misuse
    #[error("Illegal transition: {message}")]
    IllegalTransition { message: String },

    /// Rewrite commands that cannot be applied as a unit
    #[error("Invalid rewrite plan: {message}")]
    InvalidPlan { message: String },

    #[error("Config error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io { message: String },
}

impl RceError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::Lexer {
            message: message.into(),
            span,
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::Parser {
            message: message.into(),
            span,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedIr {
            message: message.into(),
        }
    }

    pub fn stale(message: impl Into<String>) -> Self {
        Self::StaleInduction {
            message: message.into(),
        }
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::IllegalTransition {
            message: message.into(),
        }
    }

    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::InvalidPlan {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Lexer { span, .. } | Self::Parser { span, .. } => Some(*span),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Lexer { message, .. }
            | Self::Parser { message, .. }
            | Self::MalformedIr { message }
            | Self::StaleInduction { message }
            | Self::IllegalTransition { message }
            | Self::InvalidPlan { message }
            | Self::Config { message }
            | Self::Io { message } => message,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Lexer { .. } => "Lexer",
            Self::Parser { .. } => "Parser",
            Self::MalformedIr { .. } => "IR",
            Self::StaleInduction { .. } => "Induction",
            Self::IllegalTransition { .. } => "State",
            Self::InvalidPlan { .. } => "Plan",
            Self::Config { .. } => "Config",
            Self::Io { .. } => "IO",
        }
    }
}

impl From<std::io::Error> for RceError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

/// Report error with ariadne
pub fn report_error(filename: &str, source: &str, error: &RceError) -> std::io::Result<()> {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let kind = error.kind();
    if let Some(span) = error.span() {
        Report::build(ReportKind::Error, (filename, span.range()))
            .with_message(format!("{kind} error"))
            .with_label(
                Label::new((filename, span.range()))
                    .with_message(error.message())
                    .with_color(Color::Red),
            )
            .finish()
            .eprint((filename, Source::from(source)))
    } else {
        Report::build(ReportKind::Error, (filename, 0..0))
            .with_message(format!("{kind} error: {}", error.message()))
            .finish()
            .eprint((filename, Source::from(source)))
    }
}
