//! Error types for the Mx* compiler

use thiserror::Error;

/// Compiler errors
///
/// All three user-facing classes are fatal to the compile and carry a source
/// position when one is available. Violated IR or back-end invariants are
/// compiler bugs, not user errors; those are enforced with assertions and
/// terminate the process instead of surfacing here.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Front-end contract errors
    /// Lexical error reported by the front end
    ///
    /// **Triggered by:** unterminated string, illegal punctuation, bad escape
    #[error("lexical error at line {line}, column {col}: {message}")]
    Lexical {
        /// Line number where the error occurred
        line: usize,
        /// Column number where the error occurred
        col: usize,
        /// Error description
        message: String,
    },

    /// Syntactic error reported by the front end
    #[error("syntax error at token {token_pos}: {message}")]
    Syntax {
        /// Index of the offending token
        token_pos: usize,
        /// Error description
        message: String,
    },

    /// Semantic error
    ///
    /// **Triggered by:** unresolved symbol, duplicate symbol in a scope, type
    /// mismatch, `break`/`continue` outside a loop, invalid `main` signature,
    /// invalid lvalue target
    #[error("semantic error: {0}")]
    Semantic(String),

    // AST interchange
    /// The annotated-AST input could not be decoded
    #[error("malformed AST input: {0}")]
    AstDecode(String),

    /// Call to a function that is neither defined nor a runtime builtin
    #[error("unresolved call target: {name}")]
    UnresolvedCall {
        /// The function name at the call site
        name: String,
    },

    /// General back-end error
    #[error("codegen error: {0}")]
    Codegen(String),
}

impl Error {
    /// Create a semantic error with a message
    pub fn semantic(msg: impl Into<String>) -> Self {
        Error::Semantic(msg.into())
    }

    /// Create a codegen error with a message
    pub fn codegen(msg: impl Into<String>) -> Self {
        Error::Codegen(msg.into())
    }
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, Error>;
