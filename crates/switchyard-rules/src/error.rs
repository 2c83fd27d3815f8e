use thiserror::Error;

/// Errors produced while parsing a routing rule (E2001–E2006).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// E2001: Rule is empty.
    #[error("E2001: rule is empty")]
    Empty,

    /// E2002: Unexpected token or character.
    #[error("E2002: syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// E2003: Matcher argument is not acceptable.
    #[error("E2003: invalid argument for {matcher}: {message}")]
    InvalidArgument { matcher: String, message: String },

    /// E2004: Rule expands into too many alternatives.
    #[error("E2004: rule is too complex ({0} alternatives)")]
    TooComplex(usize),

    /// E2005: Rule can never match a request.
    #[error("E2005: rule can never match (contradictory host or path constraints)")]
    Unsatisfiable,

    /// E2006: Rule nests too deeply or names too many matchers.
    #[error("E2006: rule is too large: {0}")]
    TooLarge(String),
}
