//! The runtime's fixed vocabulary: opcode-bearing commands and global slots.
//!
//! The table is read from a line-oriented text file:
//!
//! ```text
//! cmd Print: 0x01 value
//! cmd Wait: .. frames
//! glob Health: 0x00
//! glob Speed: ..
//! ```
//!
//! An explicit hex id sets the running counter; `..` (or no id) takes the
//! next value. `cmd` and `glob` lines share one counter. Any other line is
//! ignored.

use indexmap::IndexMap;
use serde::Serialize;
use ts_rs::TS;

/// Name of the one command that accepts any number (at least one) of arguments.
pub const VARIADIC_PRINT: &str = "Print";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct BuiltinCommand {
    pub name: String,
    pub opcode: u16,
    pub params: Vec<String>,
}

impl BuiltinCommand {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_variadic(&self) -> bool {
        self.name == VARIADIC_PRINT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct BuiltinGlobal {
    pub name: String,
    pub slot: u16,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuiltinsError {
    #[error("line {line}: malformed {kind} entry '{text}'")]
    Malformed {
        line: usize,
        kind: &'static str,
        text: String,
    },
    #[error("line {line}: id {id:#x} does not fit in 16 bits")]
    IdOutOfRange { line: usize, id: u64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Builtins {
    commands: IndexMap<String, BuiltinCommand>,
    globals: IndexMap<String, BuiltinGlobal>,
}

impl Builtins {
    pub fn parse(text: &str) -> Result<Self, BuiltinsError> {
        let mut table = Self::default();
        let mut next_id: u64 = 0;
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let (kind, rest) = if let Some(rest) = line.strip_prefix("cmd ") {
                ("cmd", rest)
            } else if let Some(rest) = line.strip_prefix("glob ") {
                ("glob", rest)
            } else {
                continue;
            };
            let malformed = || BuiltinsError::Malformed {
                line: line_no,
                kind,
                text: line.to_string(),
            };

            let (name, rest) = rest.split_once(':').ok_or_else(malformed)?;
            let name = name.trim();
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(malformed());
            }

            let mut words = rest.split_whitespace().peekable();
            match words.peek().copied() {
                Some(word) if word.starts_with("0x") || word.starts_with("0X") => {
                    next_id = u64::from_str_radix(&word[2..], 16).map_err(|_| malformed())?;
                    words.next();
                }
                Some("..") => {
                    words.next();
                }
                _ => {}
            }
            let id = u16::try_from(next_id).map_err(|_| BuiltinsError::IdOutOfRange {
                line: line_no,
                id: next_id,
            })?;
            next_id += 1;

            if kind == "cmd" {
                let params = words.map(str::to_string).collect();
                table.commands.insert(
                    name.to_string(),
                    BuiltinCommand {
                        name: name.to_string(),
                        opcode: id,
                        params,
                    },
                );
            } else {
                table.globals.insert(
                    name.to_string(),
                    BuiltinGlobal {
                        name: name.to_string(),
                        slot: id,
                    },
                );
            }
        }
        tracing::debug!(
            commands = table.commands.len(),
            globals = table.globals.len(),
            "parsed builtins table"
        );
        Ok(table)
    }

    pub fn command(&self, name: &str) -> Option<&BuiltinCommand> {
        self.commands.get(name)
    }

    pub fn global(&self, name: &str) -> Option<&BuiltinGlobal> {
        self.globals.get(name)
    }

    pub fn commands(&self) -> impl Iterator<Item = &BuiltinCommand> {
        self.commands.values()
    }

    pub fn globals(&self) -> impl Iterator<Item = &BuiltinGlobal> {
        self.globals.values()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.globals.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_explicit_and_auto_ids() {
        let table = Builtins::parse(
            "// runtime commands\ncmd Loopback: 0x10\ncmd SetVariable: .. target value\ncmd Print: ..\nglob Health: ..\nglob Speed: 0x02\ncmd Wait: .. frames\n",
        )
        .unwrap();
        assert_eq!(table.command("Loopback").unwrap().opcode, 0x10);
        let set = table.command("SetVariable").unwrap();
        assert_eq!(set.opcode, 0x11);
        assert_eq!(set.params, vec!["target", "value"]);
        assert_eq!(table.command("Print").unwrap().opcode, 0x12);
        assert_eq!(table.global("Health").unwrap().slot, 0x13);
        assert_eq!(table.global("Speed").unwrap().slot, 0x02);
        assert_eq!(table.command("Wait").unwrap().opcode, 0x03);
    }

    #[test]
    fn test_first_auto_id_is_zero() {
        let table = Builtins::parse("glob A: ..\nglob B: ..").unwrap();
        assert_eq!(table.global("A").unwrap().slot, 0);
        assert_eq!(table.global("B").unwrap().slot, 1);
    }

    #[test]
    fn test_variadic_print() {
        let table = Builtins::parse("cmd Print: 0x01 value").unwrap();
        let print = table.command("Print").unwrap();
        assert!(print.is_variadic());
        assert_eq!(print.arity(), 1);
    }

    #[test]
    fn test_order_is_preserved() {
        let table = Builtins::parse("cmd B: ..\ncmd A: ..").unwrap();
        let names: Vec<_> = table.commands().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            Builtins::parse("cmd NoColon 0x1"),
            Err(BuiltinsError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            Builtins::parse("cmd Big: 0x10000"),
            Err(BuiltinsError::IdOutOfRange { line: 1, .. })
        ));
    }
}
