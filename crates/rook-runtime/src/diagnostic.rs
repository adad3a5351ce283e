//! Diagnostics for compile-time errors
//!
//! Compile errors are collected, not printed, so one run can report several.
//! The rendered form is line-oriented: `[line N] Error at 'lexeme': message`
//! (`at end` when the error is at EOF). Diagnostics serialize to JSON for
//! machine consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "Error"),
            DiagnosticLevel::Warning => write!(f, "Warning"),
        }
    }
}

/// A single compile diagnostic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    /// Line number (1-based)
    pub line: u32,
    /// The offending lexeme; `Some("")` for end of input, `None` when the
    /// error location is the malformed text itself (scanner errors)
    pub at: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: u32, at: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            line,
            at,
            message: message.into(),
        }
    }

    /// Serialize to a single-line JSON object.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.level)?;
        match &self.at {
            Some(lexeme) if lexeme.is_empty() => write!(f, " at end")?,
            Some(lexeme) => write!(f, " at '{}'", lexeme)?,
            None => {}
        }
        write!(f, ": {}", self.message)
    }
}
