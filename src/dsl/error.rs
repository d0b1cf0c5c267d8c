use serde::Serialize;
use ts_rs::TS;

use super::source::SourcePos;

/// A compilation failure. Compilation stops at the first one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("{pos}: {message}")]
    Lex { pos: SourcePos, message: String },

    #[error("{pos}: {message}")]
    Syntax {
        pos: SourcePos,
        found: String,
        message: String,
    },

    #[error("{pos}: cannot evaluate '{text}': {message}")]
    Eval {
        pos: SourcePos,
        text: String,
        message: String,
    },

    #[error("{pos}: too many nested defines while expanding {name}")]
    MacroRecursion { pos: SourcePos, name: String },

    #[error("{pos}: identifier {name} already exists @ {existing}")]
    DuplicateIdentifier {
        pos: SourcePos,
        name: String,
        existing: SourcePos,
    },

    #[error("{pos}: lone identifier {name} is not a statement")]
    HangingIdentifier { pos: SourcePos, name: String },

    #[error("{pos}: trying to call {name} but it does not exist")]
    CallDne { pos: SourcePos, name: String },

    #[error("{pos}: giving {given} arguments but {name} takes {}", arity_text(.expected, .at_least))]
    ArgCountMismatch {
        pos: SourcePos,
        name: String,
        given: usize,
        expected: usize,
        at_least: bool,
    },

    #[error("{pos}: argument {index} of {name} is a reference parameter and needs a variable")]
    RefArgMismatch {
        pos: SourcePos,
        name: String,
        index: usize,
    },

    #[error("{pos}: {name} is a reserved {kind} name")]
    ReservedName {
        pos: SourcePos,
        name: String,
        kind: &'static str,
    },

    #[error("{pos}: {name} does not exist")]
    IdentDne { pos: SourcePos, name: String },

    #[error("missing main script")]
    MissingMain,

    #[error("{pos}: too many {what}")]
    Limit { pos: SourcePos, what: &'static str },
}

fn arity_text(expected: &usize, at_least: &bool) -> String {
    if *at_least {
        format!("at least {expected}")
    } else {
        expected.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub enum ErrorFamily {
    /// Lexing or parsing failed; nothing from the unit can be trusted.
    Structural,
    Semantic,
}

impl CompileError {
    pub fn family(&self) -> ErrorFamily {
        match self {
            CompileError::Lex { .. } | CompileError::Syntax { .. } => ErrorFamily::Structural,
            _ => ErrorFamily::Semantic,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CompileError::Lex { .. } => "LexError",
            CompileError::Syntax { .. } => "SyntaxError",
            CompileError::Eval { .. } => "EvalError",
            CompileError::MacroRecursion { .. } => "MacroRecursionError",
            CompileError::DuplicateIdentifier { .. } => "DuplicateIdentifierError",
            CompileError::HangingIdentifier { .. } => "HangingIdentifierError",
            CompileError::CallDne { .. } => "CallDNEError",
            CompileError::ArgCountMismatch { .. } => "ArgCountMismatchError",
            CompileError::RefArgMismatch { .. } => "RefArgMismatchError",
            CompileError::ReservedName { .. } => "ReservedNameError",
            CompileError::IdentDne { .. } => "IdentDNEError",
            CompileError::MissingMain => "MissingMainError",
            CompileError::Limit { .. } => "LimitError",
        }
    }

    pub fn pos(&self) -> Option<&SourcePos> {
        match self {
            CompileError::Lex { pos, .. }
            | CompileError::Syntax { pos, .. }
            | CompileError::Eval { pos, .. }
            | CompileError::MacroRecursion { pos, .. }
            | CompileError::DuplicateIdentifier { pos, .. }
            | CompileError::HangingIdentifier { pos, .. }
            | CompileError::CallDne { pos, .. }
            | CompileError::ArgCountMismatch { pos, .. }
            | CompileError::RefArgMismatch { pos, .. }
            | CompileError::ReservedName { pos, .. }
            | CompileError::IdentDne { pos, .. }
            | CompileError::Limit { pos, .. } => Some(pos),
            CompileError::MissingMain => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let related = match self {
            CompileError::DuplicateIdentifier { existing, .. } => Some(existing.clone()),
            _ => None,
        };
        Diagnostic {
            code: self.code().to_string(),
            family: self.family(),
            message: self.to_string(),
            pos: self.pos().cloned(),
            related,
        }
    }
}

/// Serializable form of a [`CompileError`] for editor integrations.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct Diagnostic {
    pub code: String,
    pub family: ErrorFamily,
    pub message: String,
    pub pos: Option<SourcePos>,
    /// Earlier declaration for duplicate-identifier errors.
    pub related: Option<SourcePos>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pos(line: u32) -> SourcePos {
        SourcePos {
            file: "/d/main.rai".into(),
            line,
            column: 1,
            end_column: 4,
        }
    }

    #[test]
    fn test_messages() {
        let err = CompileError::ArgCountMismatch {
            pos: pos(2),
            name: "Print".into(),
            given: 0,
            expected: 1,
            at_least: true,
        };
        assert_eq!(err.to_string(), "main.rai:2:1: giving 0 arguments but Print takes at least 1");
        assert_eq!(CompileError::MissingMain.to_string(), "missing main script");
    }

    #[test]
    fn test_families() {
        let lex = CompileError::Lex {
            pos: pos(1),
            message: "x".into(),
        };
        assert_eq!(lex.family(), ErrorFamily::Structural);
        let eval = CompileError::Eval {
            pos: pos(1),
            text: "1+".into(),
            message: "x".into(),
        };
        assert_eq!(eval.family(), ErrorFamily::Semantic);
    }

    #[test]
    fn test_diagnostic_carries_related() {
        let err = CompileError::DuplicateIdentifier {
            pos: pos(5),
            name: "foo".into(),
            existing: pos(1),
        };
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, "DuplicateIdentifierError");
        assert_eq!(diag.related.as_ref().unwrap().line, 1);
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["pos"]["line"], 5);
    }
}
