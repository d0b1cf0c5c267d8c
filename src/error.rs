use std::fmt;

use serde::Serialize;
use ts_rs::TS;

use crate::dsl::builtins::BuiltinsError;
use crate::dsl::encoder::EncodeError;
use crate::dsl::{CompileError, Diagnostic};

/// Everything the workspace and CLI can report. Tagged so tooling can match
/// on `code` and render `detail` as it sees fit.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "code", content = "detail")]
#[ts(export)]
pub enum AppError {
    NotFound { what: String },
    IoError { message: String },
    ValidationError { message: String },
    BuiltinsError { message: String },
    CompileError { diagnostic: Diagnostic },
    EncodeError { message: String },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound { what } => write!(f, "{what} not found"),
            AppError::IoError { message } => write!(f, "I/O error: {message}"),
            AppError::ValidationError { message } => write!(f, "{message}"),
            AppError::BuiltinsError { message } => write!(f, "Builtins table: {message}"),
            AppError::CompileError { diagnostic } => {
                write!(f, "{}: {}", diagnostic.code, diagnostic.message)
            }
            AppError::EncodeError { message } => write!(f, "Encode error: {message}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::IoError {
            message: e.to_string(),
        }
    }
}

impl From<crate::project::ProjectError> for AppError {
    fn from(e: crate::project::ProjectError) -> Self {
        match e {
            crate::project::ProjectError::Io(io_err) => AppError::IoError {
                message: io_err.to_string(),
            },
            crate::project::ProjectError::Json(json_err) => AppError::ValidationError {
                message: json_err.to_string(),
            },
            crate::project::ProjectError::InvalidProject(msg) => {
                AppError::ValidationError { message: msg }
            }
        }
    }
}

impl From<CompileError> for AppError {
    fn from(e: CompileError) -> Self {
        AppError::CompileError {
            diagnostic: e.to_diagnostic(),
        }
    }
}

impl From<EncodeError> for AppError {
    fn from(e: EncodeError) -> Self {
        AppError::EncodeError {
            message: e.to_string(),
        }
    }
}

impl From<BuiltinsError> for AppError {
    fn from(e: BuiltinsError) -> Self {
        AppError::BuiltinsError {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_serializes_with_code_tag() {
        let err: AppError = CompileError::MissingMain.into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "CompileError");
        assert_eq!(json["detail"]["diagnostic"]["code"], CompileError::MissingMain.code());
        assert!(json["detail"]["diagnostic"]["pos"].is_null());
    }

    #[test]
    fn test_project_error_maps_to_validation() {
        let err: AppError =
            crate::project::ProjectError::InvalidProject("no main.rai in /x".into()).into();
        assert_eq!(err.to_string(), "no main.rai in /x");
    }
}
