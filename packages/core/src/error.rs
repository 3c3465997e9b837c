//! Failures while reading canonical records out of a [`Value`](crate::Value).

use std::fmt;

use crate::path::PathError;

#[derive(Debug)]
pub enum Error {
    /// A property name failed validation.
    Path(PathError),

    /// A required field was absent.
    Missing { field: String },

    /// A field held the wrong variant.
    Type {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl Error {
    pub fn type_mismatch(field: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        Error::Type {
            field: field.into(),
            expected,
            found,
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Error::Missing {
            field: field.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Path(e) => e.fmt(f),
            Error::Missing { field } => write!(f, "missing field '{}'", field),
            Error::Type {
                field,
                expected,
                found,
            } => write!(f, "field '{}' should be {}, not {}", field, expected, found),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Path(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PathError> for Error {
    fn from(e: PathError) -> Self {
        Error::Path(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Path;
    use std::error::Error as _;

    #[test]
    fn messages_name_the_field() {
        assert_eq!(Error::missing("status").to_string(), "missing field 'status'");
        assert_eq!(
            Error::type_mismatch("body", "bytes", "string").to_string(),
            "field 'body' should be bytes, not string"
        );
    }

    #[test]
    fn only_path_errors_have_a_source() {
        let e: Error = Path::parse("a b").unwrap_err().into();
        assert!(e.source().is_some());
        assert!(Error::missing("x").source().is_none());
    }
}
