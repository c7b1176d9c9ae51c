pub type HelpmateResult<T> = std::result::Result<T, HelpmateError>;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    UnexpectedToken {
        expected: String,
        found: String,
    },
    UnexpectedEOF {
        /// Describes what was expected, e.g., "(expected '}}')"
        expected_what: String,
    },
    UnknownKeyword {
        keyword: String,
    },
    Expected {
        description: String,
    },
    Message(String),
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedToken { expected, found } => {
                write!(f, "Expected {}, found {}", expected, found)
            }
            Self::UnexpectedEOF { expected_what } => {
                write!(f, "Unexpected EOF{}", expected_what)
            }
            Self::UnknownKeyword { keyword } => {
                write!(f, "Unknown keyword '{}'", keyword)
            }
            Self::Expected { description } => {
                write!(f, "Expected {}", description)
            }
            Self::Message(msg) => {
                write!(f, "Parser error: {}", msg)
            }
        }
    }
}

impl std::error::Error for ParseErrorKind {}

impl ParseErrorKind {
    pub fn unexpected_eof(expected: Option<String>) -> Self {
        Self::UnexpectedEOF {
            expected_what: expected.map_or_else(String::new, |e| format!(" (expected '{}')", e)),
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub kind: ParseErrorKind,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parse error at line {}, column {}: {}",
            self.line, self.column, self.kind
        )
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HelpmateError {
    /// A template failed to parse. Parse errors are fatal: there is no
    /// partial or degraded AST.
    Parse(ParseError),
    /// `render_precompiled` was called with an id no procedure was
    /// registered under.
    MissingPrecompiled {
        template_id: String,
    },
    /// A precompiled procedure without a `template_id` cannot be
    /// registered for later retrieval.
    MissingTemplateId,
    /// Strict precompilation found a helper reference outside the
    /// `known_helpers` allow-list.
    UnknownHelper {
        helper_name: String,
    },
}

impl std::fmt::Display for HelpmateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(parse_error) => {
                write!(f, "{}", parse_error)
            }
            Self::MissingPrecompiled { template_id } => {
                write!(f, "No precompiled template registered under: {}", template_id)
            }
            Self::MissingTemplateId => {
                write!(f, "Precompiled template has no template_id to register under")
            }
            Self::UnknownHelper { helper_name } => {
                write!(f, "Unknown helper referenced by template: {}", helper_name)
            }
        }
    }
}

impl std::error::Error for HelpmateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(parse_error) => Some(parse_error),
            Self::MissingPrecompiled { .. }
            | Self::MissingTemplateId
            | Self::UnknownHelper { .. } => None,
        }
    }
}

impl From<ParseError> for HelpmateError {
    fn from(error: ParseError) -> Self {
        Self::Parse(error)
    }
}
