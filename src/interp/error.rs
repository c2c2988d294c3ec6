use std::fmt;

use thiserror::Error;

/// Category of a snippet failure, reported as the leading word of the
/// error message (e.g. `ZeroDivisionError: division by zero`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SyntaxError,
    NameError,
    TypeError,
    ValueError,
    ZeroDivisionError,
    IndexError,
    KeyError,
    AttributeError,
    OverflowError,
    RecursionError,
    ImportError,
    OSError,
    RuntimeError,
    /// Raised explicitly by the snippet with `raise Exception(...)`.
    Exception,
    /// The evaluator itself panicked; the panic was contained.
    InternalError,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::NameError => "NameError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::AttributeError => "AttributeError",
            ErrorKind::OverflowError => "OverflowError",
            ErrorKind::RecursionError => "RecursionError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::OSError => "OSError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Exception => "Exception",
            ErrorKind::InternalError => "InternalError",
        }
    }

    /// Kinds that snippets can construct and `raise` by name.
    pub fn from_constructor(name: &str) -> Option<Self> {
        match name {
            "Exception" => Some(ErrorKind::Exception),
            "ValueError" => Some(ErrorKind::ValueError),
            "TypeError" => Some(ErrorKind::TypeError),
            "RuntimeError" => Some(ErrorKind::RuntimeError),
            "KeyError" => Some(ErrorKind::KeyError),
            "IndexError" => Some(ErrorKind::IndexError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error raised while lexing, parsing or running a snippet.
///
/// Displays as `Kind: message`. The source line is kept alongside for
/// logs and tests but is not part of the message.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct EvalError {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based source line, when known.
    pub line: Option<usize>,
}

impl EvalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self {
            kind: ErrorKind::SyntaxError,
            message: message.into(),
            line: Some(line),
        }
    }

    /// Attaches a line number unless one is already recorded.
    pub fn at_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

/// Shorthand constructors used all over the evaluator.
pub(crate) fn type_error(message: impl Into<String>) -> EvalError {
    EvalError::new(ErrorKind::TypeError, message)
}

pub(crate) fn value_error(message: impl Into<String>) -> EvalError {
    EvalError::new(ErrorKind::ValueError, message)
}

pub(crate) type EvalResult<T> = Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_line() {
        let err = EvalError::new(ErrorKind::ZeroDivisionError, "division by zero");
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
    }

    #[test]
    fn test_line_is_not_part_of_message() {
        let err = EvalError::syntax("invalid syntax", 3);
        assert_eq!(err.to_string(), "SyntaxError: invalid syntax");
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_at_line_keeps_first_line() {
        let err = EvalError::new(ErrorKind::NameError, "x").at_line(2).at_line(7);
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn test_constructor_names() {
        assert_eq!(ErrorKind::from_constructor("ValueError"), Some(ErrorKind::ValueError));
        assert_eq!(ErrorKind::from_constructor("Exception"), Some(ErrorKind::Exception));
        assert_eq!(ErrorKind::from_constructor("SyntaxError"), None);
    }
}
