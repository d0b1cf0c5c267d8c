//! Binary image writer.
//!
//! Layout (little-endian):
//!
//! ```text
//! header   globalCount:u8 scriptCount:u8 [ptr:u32; scripts] fnCount:u8 [ptr:u32; fns]
//!          scopeCount:u16 [ptr:u32; scopes]
//! bodies   scripts (main first), then functions, then anonymous scopes
//! callable refCount:u8 argCount:u8 namePtr:u16 scope name\0
//! scope    count:u16 numPtr:u16 strPtr:u16 commands f32* (len:u8 bytes)*
//! command  opcode:u16 args*
//! arg      tag:3 | payload:13, followed by nested args for calls and expressions
//! ```
//!
//! Header pointers are absolute; a null slot is 0. Every body is serialized
//! into its own buffer first so its length is known before anything that
//! points past it is written.

use super::builtins::Builtins;
use super::ir::{CallKind, Command, Operator, PassedArg};
use super::symbols::{Callable, CompilationUnit, Scope};

const TAG_NUMBER: u16 = 0;
const TAG_STRING: u16 = 1;
const TAG_FUNCTION: u16 = 2;
const TAG_VARIABLE: u16 = 3;
const TAG_GLOBAL: u16 = 4;
const TAG_GLOBAL_RELATIVE: u16 = 5;
const TAG_EXPRESSION: u16 = 6;

/// Builtin calls nested in an expression share the absolute-global tag.
const TAG_BUILTIN: u16 = TAG_GLOBAL;

const PAYLOAD_BITS: u16 = 13;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("command '{0}' is not in the builtins table")]
    UnknownCommand(String),
    #[error("{what} {value} does not fit in {PAYLOAD_BITS} bits")]
    PayloadOverflow { what: &'static str, value: u16 },
    #[error("too many {what}: {count}")]
    CountOverflow { what: &'static str, count: usize },
    #[error("string literal of {0} bytes is longer than 255")]
    StringTooLong(usize),
    #[error("{what} offset {offset} does not fit its pointer")]
    PointerOverflow { what: &'static str, offset: usize },
}

/// Encode everything `unit` recorded at `depth` into one image.
pub fn encode(unit: &CompilationUnit, depth: u32, builtins: &Builtins) -> Result<Vec<u8>, EncodeError> {
    let encoder = Encoder { builtins };

    let scripts: Vec<Option<Vec<u8>>> = unit
        .main()
        .into_iter()
        .chain(unit.scripts().values())
        .map(|c| body_at(unit, c, depth).map(|scope| encoder.callable(c, scope)).transpose())
        .collect::<Result<_, _>>()?;
    // main's slot exists even when no main was compiled
    let scripts = if unit.main().is_none() {
        std::iter::once(None).chain(scripts).collect()
    } else {
        scripts
    };
    let functions: Vec<Option<Vec<u8>>> = unit
        .functions()
        .values()
        .map(|c| body_at(unit, c, depth).map(|scope| encoder.callable(c, scope)).transpose())
        .collect::<Result<_, _>>()?;
    let scopes: Vec<Option<Vec<u8>>> = unit
        .anonymous_scopes(depth)
        .iter()
        .map(|&id| unit.scope(id).map(|scope| encoder.scope(scope)).transpose())
        .collect::<Result<_, _>>()?;

    let global_count = count_u8("globals", unit.globals().len())?;
    let script_count = count_u8("scripts", scripts.len())?;
    let fn_count = count_u8("functions", functions.len())?;
    let scope_count = u16::try_from(scopes.len()).map_err(|_| EncodeError::CountOverflow {
        what: "anonymous scopes",
        count: scopes.len(),
    })?;

    let header_len = 2 + 4 * scripts.len() + 1 + 4 * functions.len() + 2 + 4 * scopes.len();
    let mut cursor = header_len;
    let mut pointers = Vec::with_capacity(scripts.len() + functions.len() + scopes.len());
    for body in scripts.iter().chain(&functions).chain(&scopes) {
        match body {
            Some(bytes) => {
                let ptr = u32::try_from(cursor).map_err(|_| EncodeError::PointerOverflow {
                    what: "body",
                    offset: cursor,
                })?;
                pointers.push(ptr);
                cursor += bytes.len();
            }
            None => pointers.push(0),
        }
    }

    let mut out = Vec::with_capacity(cursor);
    let (script_ptrs, rest) = pointers.split_at(scripts.len());
    let (fn_ptrs, scope_ptrs) = rest.split_at(functions.len());
    out.push(global_count);
    out.push(script_count);
    for &ptr in script_ptrs {
        put_u32(&mut out, ptr);
    }
    out.push(fn_count);
    for &ptr in fn_ptrs {
        put_u32(&mut out, ptr);
    }
    put_u16(&mut out, scope_count);
    for &ptr in scope_ptrs {
        put_u32(&mut out, ptr);
    }
    for bytes in scripts.iter().chain(&functions).chain(&scopes).flatten() {
        out.extend_from_slice(bytes);
    }

    tracing::debug!(
        depth,
        bytes = out.len(),
        scripts = script_ptrs.iter().filter(|&&p| p != 0).count(),
        functions = fn_ptrs.iter().filter(|&&p| p != 0).count(),
        scopes = scopes.len(),
        "encoded image"
    );
    Ok(out)
}

struct Encoder<'a> {
    builtins: &'a Builtins,
}

impl Encoder<'_> {
    fn callable(&self, callable: &Callable, scope: &Scope) -> Result<Vec<u8>, EncodeError> {
        let body = self.scope(scope)?;
        let name_ptr = 4 + body.len();
        let name_ptr = u16::try_from(name_ptr).map_err(|_| EncodeError::PointerOverflow {
            what: "name",
            offset: name_ptr,
        })?;

        let mut out = Vec::with_capacity(usize::from(name_ptr) + callable.ident.name.len() + 1);
        out.push(callable.ref_count);
        out.push(count_u8("parameters", callable.arg_count())?);
        put_u16(&mut out, name_ptr);
        out.extend_from_slice(&body);
        out.extend_from_slice(callable.ident.name.as_bytes());
        out.push(0);
        Ok(out)
    }

    fn scope(&self, scope: &Scope) -> Result<Vec<u8>, EncodeError> {
        let mut commands = Vec::new();
        for command in &scope.commands {
            self.command(&mut commands, command)?;
        }
        let count = u16::try_from(scope.commands.len()).map_err(|_| EncodeError::CountOverflow {
            what: "commands",
            count: scope.commands.len(),
        })?;
        let num_ptr = 6 + commands.len();
        let str_ptr = num_ptr + 4 * scope.numbers.len();
        let pointer = |what, offset: usize| {
            u16::try_from(offset).map_err(|_| EncodeError::PointerOverflow { what, offset })
        };

        let mut out = Vec::with_capacity(str_ptr);
        put_u16(&mut out, count);
        put_u16(&mut out, pointer("number pool", num_ptr)?);
        put_u16(&mut out, pointer("string pool", str_ptr)?);
        out.extend_from_slice(&commands);
        for value in &scope.numbers {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for s in &scope.strings {
            let len = u8::try_from(s.len()).map_err(|_| EncodeError::StringTooLong(s.len()))?;
            out.push(len);
            out.extend_from_slice(s.as_bytes());
        }
        Ok(out)
    }

    fn command(&self, out: &mut Vec<u8>, command: &Command) -> Result<(), EncodeError> {
        let opcode = self
            .builtins
            .command(&command.name)
            .ok_or_else(|| EncodeError::UnknownCommand(command.name.clone()))?
            .opcode;
        put_u16(out, opcode);
        for arg in &command.args {
            self.arg(out, arg)?;
        }
        Ok(())
    }

    fn arg(&self, out: &mut Vec<u8>, arg: &PassedArg) -> Result<(), EncodeError> {
        match arg {
            PassedArg::Number(index) => put_u16(out, tag(TAG_NUMBER, *index, "number index")?),
            PassedArg::String(index) => put_u16(out, tag(TAG_STRING, *index, "string index")?),
            PassedArg::Variable(slot) => put_u16(out, tag(TAG_VARIABLE, *slot, "variable slot")?),
            PassedArg::Global { slot, relative } => {
                let kind = if *relative { TAG_GLOBAL_RELATIVE } else { TAG_GLOBAL };
                put_u16(out, tag(kind, *slot, "global slot")?);
            }
            PassedArg::Raw(value) => put_u16(out, *value),
            PassedArg::Call(call) => {
                let head = match call.kind {
                    CallKind::Function => tag(TAG_FUNCTION, call.id, "function id")?,
                    CallKind::Builtin => tag(TAG_BUILTIN, call.id, "opcode")?,
                    // The runtime reads script calls as a bare id.
                    CallKind::Script => call.id,
                };
                put_u16(out, head);
                for nested in &call.args {
                    self.arg(out, nested)?;
                }
            }
            PassedArg::Expression(expr) => {
                put_u16(out, tag(TAG_EXPRESSION, expr.op as u16, "operator")?);
                self.arg(out, &expr.lhs)?;
                if expr.op != Operator::Not {
                    if let Some(rhs) = &expr.rhs {
                        self.arg(out, rhs)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Body of `callable` if it was compiled at `depth`.
fn body_at<'u>(unit: &'u CompilationUnit, callable: &Callable, depth: u32) -> Option<&'u Scope> {
    if callable.depth != depth {
        return None;
    }
    callable.body.and_then(|id| unit.scope(id))
}

fn tag(kind: u16, payload: u16, what: &'static str) -> Result<u16, EncodeError> {
    if payload >= 1 << PAYLOAD_BITS {
        return Err(EncodeError::PayloadOverflow { what, value: payload });
    }
    Ok(kind | (payload << 3))
}

fn count_u8(what: &'static str, count: usize) -> Result<u8, EncodeError> {
    u8::try_from(count).map_err(|_| EncodeError::CountOverflow { what, count })
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::resolver::{compile, Session};

    fn builtins() -> Builtins {
        Builtins::parse(
            "cmd Loopback: 0x00\n\
             cmd Return: .. value kind\n\
             cmd If: ..\n\
             cmd Loop: .. scope\n\
             cmd Wait: .. frames\n\
             cmd CreateVariable: .. raw\n\
             cmd SetVariable: .. target value\n\
             cmd CallFn: .. call\n\
             cmd CallScript: .. call\n\
             cmd Collapse: .. call\n\
             cmd Print: .. value\n\
             cmd Random: .. max\n\
             glob Health: 0x20\n\
             glob Target: ..\n",
        )
        .unwrap()
    }

    fn encode_src(src: &str) -> Vec<u8> {
        let b = builtins();
        let unit = compile(&[src], &b).unwrap();
        encode(&unit, 1, &b).unwrap()
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    #[test]
    fn test_exact_bytes_for_small_program() {
        let bytes = encode_src("script main() { Wait(2) }");
        let mut expected = vec![
            0, // globals
            1, // scripts
            9, 0, 0, 0, // main
            0, // functions
            0, 0, // scopes
            0, 0, 20, 0, // refCount argCount namePtr
            2, 0, 12, 0, 16, 0, // count numPtr strPtr
            4, 0, 0, 0, // Wait number#0
            0, 0, // Loopback
        ];
        expected.extend_from_slice(&2.0f32.to_le_bytes());
        expected.extend_from_slice(b"main\0");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_argument_tags() {
        let bytes = encode_src(
            "script other() { }\nscript main(p) { Wait(p) Wait(@Target) Wait(Health) Wait(p + 1) Wait(!p) Wait(Random(3)) }",
        );
        // main is the first body after the header: 2 + 2*4 + 1 + 2
        let main = u32_at(&bytes, 2) as usize;
        assert_eq!(main, 13);
        assert_eq!(bytes[main + 1], 1);
        let commands = main + 4 + 6;
        let words: Vec<u16> = (0..17).map(|i| u16_at(&bytes, commands + i * 2)).collect();
        assert_eq!(
            words,
            vec![
                4, 3, // Wait p
                4, 5 | (0x21 << 3), // Wait @Target
                4, 4 | (0x20 << 3), // Wait Health
                4, 6 | (13 << 3), 3, 0, // Wait p + 1
                4, 6 | (18 << 3), 3, // Wait !p
                4, 4 | (11 << 3), 8, // Wait Random(3)
                0, // Loopback
            ]
        );
    }

    #[test]
    fn test_script_call_argument_is_untagged() {
        let bytes = encode_src("script a(x) { }\nscript b() { }\nscript main() { collapse b() a(5) }");
        let main = u32_at(&bytes, 2) as usize;
        let commands = main + 4 + 6;
        let words: Vec<u16> = (0..6).map(|i| u16_at(&bytes, commands + i * 2)).collect();
        // Collapse [script 2], CallScript [script 1, number#0]
        assert_eq!(words, vec![9, 2, 8, 1, 0, 0]);
    }

    #[test]
    fn test_strings_are_length_prefixed() {
        let bytes = encode_src("script main() { Print(\"hi\", \"\") }");
        assert!(bytes.ends_with(&[2, b'h', b'i', 0, b'm', b'a', b'i', b'n', 0]));
        let main = u32_at(&bytes, 2) as usize;
        let scope = main + 4;
        // no numbers: string pool starts where the number pool does
        assert_eq!(u16_at(&bytes, scope + 2), u16_at(&bytes, scope + 4));
    }

    #[test]
    fn test_anonymous_scopes_follow_functions() {
        let bytes = encode_src("fn f() { }\nscript main() { loop { break } }");
        // header: 2 + 4 (main) + 1 + 4 (f) + 2 + 4 (one scope)
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes[6], 1);
        assert_eq!(u16_at(&bytes, 11), 1);
        let main = u32_at(&bytes, 2) as usize;
        let f = u32_at(&bytes, 7) as usize;
        let scope = u32_at(&bytes, 13) as usize;
        assert_eq!(main, 17);
        assert!(main < f && f < scope);
        // loop body: Return(number#0, raw 3) then Return(number#1, raw 0)
        assert_eq!(u16_at(&bytes, scope), 2);
        assert_eq!(u16_at(&bytes, scope + 6), 1);
        assert_eq!(u16_at(&bytes, scope + 10), 3);
        assert_eq!(u16_at(&bytes, scope + 14), 1 << 3);
        assert_eq!(u16_at(&bytes, scope + 16), 0);
        assert_eq!(scope + 6 + 12 + 8, bytes.len());
    }

    #[test]
    fn test_depth_filter_leaves_null_slots() {
        let b = builtins();
        let mut session = Session::new(&b);
        session
            .compile_layer("script a() { }\nscript c() { }\nfn f() { }\nscript main() { loop { } }")
            .unwrap();
        let base = encode(session.unit(), 1, &b).unwrap();
        assert_eq!(base[1], 3);
        assert!((0..3).all(|i| u32_at(&base, 2 + i * 4) != 0));

        session.compile_layer("script a() { Wait(1) }").unwrap();
        let derived = encode(session.unit(), 2, &b).unwrap();
        assert_eq!(derived[1], 3);
        assert_eq!(u32_at(&derived, 2), 0); // main
        assert_eq!(u32_at(&derived, 6), 21); // a
        assert_eq!(u32_at(&derived, 10), 0); // c
        assert_eq!(derived[14], 1);
        assert_eq!(u32_at(&derived, 15), 0); // f
        assert_eq!(u16_at(&derived, 19), 0);
        assert!(derived.ends_with(b"a\0"));
    }

    #[test]
    fn test_deterministic() {
        let src = "global g\nfn f(&r) { r += 1 }\nscript main() { let x = 1 f(x) if x > 1 { Print(\"x\", x) } }";
        assert_eq!(encode_src(src), encode_src(src));
    }

    #[test]
    fn test_unknown_command() {
        let b = builtins();
        let unit = compile(&["script main() { }"], &b).unwrap();
        let bare = Builtins::parse("cmd Wait: 0x01").unwrap();
        assert_eq!(
            encode(&unit, 1, &bare).unwrap_err(),
            EncodeError::UnknownCommand("Loopback".into())
        );
    }

    #[test]
    fn test_long_string() {
        let b = builtins();
        let src = format!("script main() {{ Print(\"{}\") }}", "x".repeat(300));
        let unit = compile(&[src.as_str()], &b).unwrap();
        assert_eq!(encode(&unit, 1, &b).unwrap_err(), EncodeError::StringTooLong(300));
    }

    #[test]
    fn test_payload_limit() {
        assert_eq!(tag(TAG_VARIABLE, 8191, "slot").unwrap(), 3 | (8191 << 3));
        assert!(matches!(
            tag(TAG_NUMBER, 8192, "number index"),
            Err(EncodeError::PayloadOverflow { value: 8192, .. })
        ));
    }
}
