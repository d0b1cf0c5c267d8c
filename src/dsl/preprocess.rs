//! `#define` expansion and `#calc` constant folding.
//!
//! Defines are textual: a body is substituted word-for-word without adding
//! parentheses, so `#define X 1+2` makes `X*3` read as `1+2*3`.

use indexmap::IndexMap;

use super::error::CompileError;
use super::lexer::lex;
use super::parser::parse_expression;
use super::symbols::Define;

pub const MAX_MACRO_DEPTH: usize = 100;

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte offsets of whole-word occurrences of `word` in `text`.
fn word_matches(text: &str, word: &str) -> Vec<usize> {
    if word.is_empty() {
        return Vec::new();
    }
    let bytes = text.as_bytes();
    text.match_indices(word)
        .map(|(i, _)| i)
        .filter(|&i| {
            let before = i.checked_sub(1).and_then(|b| bytes.get(b)).copied();
            let after = bytes.get(i + word.len()).copied();
            !before.is_some_and(is_word_byte) && !after.is_some_and(is_word_byte)
        })
        .collect()
}

pub fn contains_word(text: &str, word: &str) -> bool {
    !word_matches(text, word).is_empty()
}

pub fn replace_word(text: &str, word: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for i in word_matches(text, word) {
        out.push_str(&text[last..i]);
        out.push_str(replacement);
        last = i + word.len();
    }
    out.push_str(&text[last..]);
    out
}

/// Expand the define at `index`, expanding any define its body mentions first.
///
/// Results are memoized on the table entry. Bodies may mention defines in any
/// order, so cycles are cut off by `depth`.
pub fn expand_define(
    defines: &mut IndexMap<String, Define>,
    index: usize,
    depth: usize,
) -> Result<(), CompileError> {
    let Some((name, define)) = defines.get_index(index) else {
        return Ok(());
    };
    let name = name.clone();
    let pos = define.ident.pos.clone();
    if depth >= MAX_MACRO_DEPTH {
        return Err(CompileError::MacroRecursion { pos, name });
    }

    let mut text = define.text.clone();
    for other in 0..defines.len() {
        let Some((other_name, other_def)) = defines.get_index(other) else {
            continue;
        };
        if !contains_word(&text, other_name) {
            continue;
        }
        let other_name = other_name.clone();
        if other_def.expanded.is_none() {
            expand_define(defines, other, depth + 1)?;
        }
        if let Some(expanded) = defines.get_index(other).and_then(|(_, d)| d.expanded.as_deref()) {
            text = replace_word(&text, &other_name, expanded);
        }
    }
    tracing::trace!(define = %name, expanded = %text, "expanded define");

    let tokens = lex(&text).map_err(|e| CompileError::Lex {
        pos: pos.clone(),
        message: format!("in expansion of {name}: {}", e.message),
    })?;
    let node = parse_expression(tokens, &text).map_err(|e| CompileError::Syntax {
        pos: pos.clone(),
        found: e.found,
        message: format!("in expansion of {name}: {}", e.message),
    })?;

    if let Some(define) = defines.get_index_mut(index).map(|(_, d)| d) {
        define.expanded = Some(text);
        define.node = Some(node);
    }
    Ok(())
}

/// Evaluate plain arithmetic: numbers, `+ - * / %`, unary signs and parentheses.
pub fn evaluate(text: &str) -> Result<f64, String> {
    let mut eval = Evaluator {
        bytes: text.as_bytes(),
        pos: 0,
    };
    let value = eval.expr()?;
    eval.skip_ws();
    if let Some(&c) = eval.bytes.get(eval.pos) {
        return Err(format!("unexpected '{}'", c as char));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

struct Evaluator<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Evaluator<'_> {
    fn skip_ws(&mut self) {
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ (b'+' | b'-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == b'+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        while let Some(op @ (b'*' | b'/' | b'%')) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                b'*' => value * rhs,
                b'/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(b'+') => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(b')') {
                    return Err("expected ')'".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(b'0'..=b'9' | b'.') => self.number(),
            Some(c) => Err(format!("unexpected '{}'", c as char)),
            None => Err("unexpected end of input".into()),
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        if self.bytes.get(self.pos) == Some(&b'0')
            && matches!(self.bytes.get(self.pos + 1), Some(b'x' | b'X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while self.bytes.get(self.pos).is_some_and(u8::is_ascii_hexdigit) {
                self.pos += 1;
            }
            let digits = std::str::from_utf8(&self.bytes[digits_start..self.pos])
                .map_err(|e| e.to_string())?;
            return u64::from_str_radix(digits, 16)
                .map(|v| v as f64)
                .map_err(|_| "invalid hex literal".into());
        }
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
        {
            self.pos += 1;
        }
        let literal = std::str::from_utf8(&self.bytes[start..self.pos]).map_err(|e| e.to_string())?;
        literal
            .parse()
            .map_err(|_| format!("invalid number '{literal}'"))
    }
}
