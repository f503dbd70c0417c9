use thiserror::Error;

pub type CoefficientResult<T> = std::result::Result<T, CoefficientError>;

/// What went wrong while scanning a template source.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ParseErrorKind {
    #[error("Unexpected `{found}`")]
    UnexpectedChar { found: char },
    #[error("Unknown block type `{tag}`")]
    UnknownBlockType { tag: String },
    #[error("Unknown flag `{flag}`")]
    UnknownModifier { flag: char },
    #[error("Missing block name")]
    MissingName,
    #[error("Missing context")]
    MissingContext,
    #[error("Unspecified context")]
    UnspecifiedContext,
    #[error("Unnamed block")]
    UnnamedBlock,
    #[error("Mismatch closing block")]
    MismatchedClosing,
    #[error("Unexpected closing block")]
    UnexpectedClosing,
    #[error("Cannot set next segment to a non block segment")]
    InvalidSiblingTarget,
    #[error("Next block type mismatch")]
    SiblingTypeMismatch,
    #[error("Invalid sibling block")]
    SiblingNotAllowed,
    #[error("Maximum number of siblings for block reached")]
    TooManySiblings,
    #[error("Block does not accept parameters")]
    ParamsNotAllowed,
    #[error("Missing param value")]
    MissingParamValue,
    #[error("Unclosed literal")]
    UnclosedQuote,
    #[error("Missing closing block for `{tag}`")]
    UnclosedBlock { tag: char },
    #[error("Unexpected end of template")]
    UnexpectedEof,
    #[error("{0}")]
    Message(String),
}

/// A fatal scanning error. Carries the source position and a short
/// excerpt of the offending text so the fault can be located without
/// re-scanning the whole source.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{kind} near `{near_text}` at L{line},C{column},O{offset}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub column: usize,
    pub offset: usize,
    pub near_text: String,
}

/// A well-formed tree that cannot be turned into a renderer program.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum CompileError {
    #[error("Unknown block type `{tag}` at L{line},C{column}")]
    UnknownBlockType { tag: char, line: usize, column: usize },
    #[error("Block `{tag}` does not accept parameters at L{line},C{column}")]
    ParamsNotAllowed { tag: char, line: usize, column: usize },
    #[error("Invalid condition `{expression}`: {message}")]
    InvalidCondition { expression: String, message: String },
    #[error("Invalid `{tag}` block at L{line},C{column}: {message}")]
    InvalidBlock {
        tag: char,
        line: usize,
        column: usize,
        message: String,
    },
}

/// A failure during the execution of a compiled renderer program.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Helper not found: {name}")]
    MissingHelper { name: String },
    #[error("Inline block not found: {name}")]
    MissingBlock { name: String },
    #[error("Partial template not found: {name}")]
    MissingTemplate { name: String },
    #[error("Partial `{name}` failed: {source}")]
    Partial {
        name: String,
        #[source]
        source: Box<CoefficientError>,
    },
    #[error("Output sink error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Rendering error: {0}")]
    Message(String),
}

/// Failures at the engine boundary: template and registry management.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum EngineError {
    #[error("Template already exists: {name}")]
    TemplateExists { name: String },
    #[error("Template not found: {name}")]
    MissingTemplate { name: String },
    #[error("Invalid block identifier `{tag}`")]
    InvalidTag { tag: char },
    #[error("Illegal identifier `{tag}`")]
    TagTaken { tag: char },
    #[error("Invalid block modifier `{flag}`")]
    InvalidModifier { flag: char },
    #[error("Illegal block modifier `{flag}`")]
    ModifierTaken { flag: char },
}

#[derive(Debug, Error)]
pub enum CoefficientError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CoefficientError {
    /// Convenience accessor for callers that expect a scan failure
    /// specifically.
    pub fn as_parse(&self) -> Option<&ParseError> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Compile(_) | Self::Render(_) | Self::Engine(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError {
            kind: ParseErrorKind::UnexpectedChar { found: '~' },
            line: 3,
            column: 14,
            offset: 52,
            near_text: "foo {?{~}} bar".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unexpected `~` near `foo {?{~}} bar` at L3,C14,O52"
        );
    }

    #[test]
    fn test_unclosed_block_display() {
        let kind = ParseErrorKind::UnclosedBlock { tag: '#' };
        assert_eq!(kind.to_string(), "Missing closing block for `#`");
    }

    #[test]
    fn test_umbrella_conversion() {
        let err: CoefficientError = EngineError::MissingTemplate {
            name: "home".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            CoefficientError::Engine(EngineError::MissingTemplate { .. })
        ));
        assert!(err.as_parse().is_none());
    }
}
