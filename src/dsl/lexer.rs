use super::ast::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Directives
    FileMarker(String), // #__FILE__ <path>
    Extends(String),    // #extends <path>
    Out(String),        // #out <path>
    Define,             // #define
    Calc,               // #calc

    // Keywords
    Fn,
    Let,
    Global,
    Return,
    Script,
    Collapse,
    If,
    Elif, // else if
    Else,
    Loop,
    Break,

    // Literals & names
    Number(f64),
    Hex(u32),
    Str(String),
    Ident(String),
    VarRef(String), // &name

    // Punctuation
    At, // @
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Semicolon,

    // Operators
    PlusPlus,
    MinusMinus,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl, // <<
    Shr, // >>
    Ge,
    Le,
    Gt,
    Lt,
    Ne,
    EqEq,
    AndAnd,
    OrOr,
    Bang,
    Amp,
    Caret,
    Pipe,
    Eq,

    Eof,
}

/// Operator groups the grammar matches on before looking at the exact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFamily {
    Additive,
    Multiplicative,
    Shift,
    Relational,
    Equality,
}

impl Token {
    pub fn family(&self) -> Option<TokenFamily> {
        match self {
            Token::Plus | Token::Minus => Some(TokenFamily::Additive),
            Token::Star | Token::Slash | Token::Percent => Some(TokenFamily::Multiplicative),
            Token::Shl | Token::Shr => Some(TokenFamily::Shift),
            Token::Ge | Token::Le | Token::Gt | Token::Lt => Some(TokenFamily::Relational),
            Token::Ne | Token::EqEq => Some(TokenFamily::Equality),
            _ => None,
        }
    }

    /// Short human-readable form used in syntax error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::FileMarker(p) => format!("#__FILE__ {p}"),
            Token::Extends(p) => format!("#extends {p}"),
            Token::Out(p) => format!("#out {p}"),
            Token::Define => "#define".into(),
            Token::Calc => "#calc".into(),
            Token::Fn => "fn".into(),
            Token::Let => "let".into(),
            Token::Global => "global".into(),
            Token::Return => "return".into(),
            Token::Script => "script".into(),
            Token::Collapse => "collapse".into(),
            Token::If => "if".into(),
            Token::Elif => "else if".into(),
            Token::Else => "else".into(),
            Token::Loop => "loop".into(),
            Token::Break => "break".into(),
            Token::Number(n) => n.to_string(),
            Token::Hex(h) => format!("{h:#x}"),
            Token::Str(s) => format!("\"{s}\""),
            Token::Ident(s) => s.clone(),
            Token::VarRef(s) => format!("&{s}"),
            Token::At => "@".into(),
            Token::LBrace => "{".into(),
            Token::RBrace => "}".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Colon => ":".into(),
            Token::Semicolon => ";".into(),
            Token::PlusPlus => "++".into(),
            Token::MinusMinus => "--".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Percent => "%".into(),
            Token::Shl => "<<".into(),
            Token::Shr => ">>".into(),
            Token::Ge => ">=".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Lt => "<".into(),
            Token::Ne => "!=".into(),
            Token::EqEq => "==".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
            Token::Bang => "!".into(),
            Token::Amp => "&".into(),
            Token::Caret => "^".into(),
            Token::Pipe => "|".into(),
            Token::Eq => "=".into(),
            Token::Eof => "end of input".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Raw lexer failure; the caller maps `offset` back to a file position.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

const DIRECTIVE_FILE: &str = "__FILE__";
const MAX_HEX_DIGITS: usize = 8;

pub fn lex(source: &str) -> Result<Vec<SpannedToken>, LexError> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<SpannedToken>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<SpannedToken>, LexError> {
        loop {
            self.skip_whitespace_and_comments()?;
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'{' => self.single(Token::LBrace),
                b'}' => self.single(Token::RBrace),
                b'[' => self.single(Token::LBracket),
                b']' => self.single(Token::RBracket),
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b',' => self.single(Token::Comma),
                b':' => self.single(Token::Colon),
                b';' => self.single(Token::Semicolon),
                b'@' => self.single(Token::At),
                b'*' => self.single(Token::Star),
                b'/' => self.single(Token::Slash),
                b'%' => self.single(Token::Percent),
                b'^' => self.single(Token::Caret),
                b'+' => self.one_or_two(b'+', Token::PlusPlus, Token::Plus),
                b'-' => {
                    if self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
                        && !self.last_ends_operand()
                    {
                        self.pos += 1;
                        self.lex_number(start)?;
                    } else {
                        self.one_or_two(b'-', Token::MinusMinus, Token::Minus);
                    }
                }
                b'<' => match self.bytes.get(self.pos + 1) {
                    Some(b'<') => self.double(Token::Shl),
                    Some(b'=') => self.double(Token::Le),
                    _ => self.single(Token::Lt),
                },
                b'>' => match self.bytes.get(self.pos + 1) {
                    Some(b'>') => self.double(Token::Shr),
                    Some(b'=') => self.double(Token::Ge),
                    _ => self.single(Token::Gt),
                },
                b'!' => self.one_or_two(b'=', Token::Ne, Token::Bang),
                b'=' => self.one_or_two(b'=', Token::EqEq, Token::Eq),
                b'|' => self.one_or_two(b'|', Token::OrOr, Token::Pipe),
                b'&' => {
                    let next = self.bytes.get(self.pos + 1).copied();
                    match next {
                        Some(b'&') => self.double(Token::AndAnd),
                        Some(c) if is_ident_start(c) => {
                            self.pos += 1;
                            let name = self.take_word();
                            self.push(Token::VarRef(name), start, self.pos);
                        }
                        _ => self.single(Token::Amp),
                    }
                }
                b'#' => {
                    self.pos += 1;
                    self.lex_directive(start)?;
                }
                b'"' => {
                    self.pos += 1;
                    self.lex_string(start)?;
                }
                b'0' if matches!(self.bytes.get(self.pos + 1), Some(b'x' | b'X')) => {
                    self.pos += 2;
                    self.lex_hex(start)?;
                }
                b'0'..=b'9' => self.lex_number(start)?,
                c if is_ident_start(c) => self.lex_ident(start),
                _ => {
                    let found = self.source[start..].chars().next().unwrap_or('?');
                    return Err(self.error(start, format!("unexpected character '{found}'")));
                }
            }
        }

        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(self.pos, self.pos),
        });
        Ok(std::mem::take(&mut self.tokens))
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        self.tokens.push(SpannedToken {
            token,
            span: Span::new(start, end),
        });
    }

    fn single(&mut self, token: Token) {
        let start = self.pos;
        self.pos += 1;
        self.push(token, start, self.pos);
    }

    fn double(&mut self, token: Token) {
        let start = self.pos;
        self.pos += 2;
        self.push(token, start, self.pos);
    }

    fn one_or_two(&mut self, second: u8, two: Token, one: Token) {
        if self.bytes.get(self.pos + 1) == Some(&second) {
            self.double(two);
        } else {
            self.single(one);
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> LexError {
        LexError {
            offset,
            message: message.into(),
        }
    }

    /// A `-` directly before a digit is a sign unless it follows an operand.
    fn last_ends_operand(&self) -> bool {
        self.tokens.last().is_some_and(|t| {
            matches!(
                t.token,
                Token::Number(_)
                    | Token::Hex(_)
                    | Token::Ident(_)
                    | Token::Str(_)
                    | Token::RParen
                    | Token::RBracket
            )
        })
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                c if c.is_ascii_whitespace() => self.pos += 1,
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    match self.source[self.pos + 2..].find("*/") {
                        Some(end) => self.pos += 2 + end + 2,
                        None => return Err(self.error(start, "unterminated block comment")),
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn take_word(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_char(self.bytes[self.pos]) {
            self.pos += 1;
        }
        self.source[start..self.pos].to_string()
    }

    fn rest_of_line(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
        self.source[start..self.pos].trim_end().to_string()
    }

    fn lex_directive(&mut self, start: usize) -> Result<(), LexError> {
        let word = self.take_word();
        match word.as_str() {
            "define" => self.push(Token::Define, start, self.pos),
            "calc" => self.push(Token::Calc, start, self.pos),
            DIRECTIVE_FILE | "extends" | "out" => {
                if self.bytes.get(self.pos) != Some(&b' ') {
                    return Err(self.error(start, format!("#{word} expects a path")));
                }
                self.pos += 1;
                let path = self.rest_of_line();
                if path.is_empty() {
                    return Err(self.error(start, format!("#{word} expects a path")));
                }
                let token = match word.as_str() {
                    "extends" => Token::Extends(path),
                    "out" => Token::Out(path),
                    _ => Token::FileMarker(path),
                };
                self.push(token, start, self.pos);
            }
            _ => return Err(self.error(start, format!("unknown directive '#{word}'"))),
        }
        Ok(())
    }

    fn lex_string(&mut self, start: usize) -> Result<(), LexError> {
        let body_start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'"' {
            self.pos += 1;
        }
        if self.pos >= self.bytes.len() {
            return Err(self.error(start, "unterminated string literal"));
        }
        let s = self.source[body_start..self.pos].to_string();
        self.pos += 1;
        self.push(Token::Str(s), start, self.pos);
        Ok(())
    }

    fn lex_hex(&mut self, start: usize) -> Result<(), LexError> {
        let digits_start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_hexdigit() {
            self.pos += 1;
        }
        let digits = &self.source[digits_start..self.pos];
        if digits.is_empty() || digits.len() > MAX_HEX_DIGITS {
            return Err(self.error(
                start,
                format!("hex literal must have 1 to {MAX_HEX_DIGITS} digits"),
            ));
        }
        let value = u32::from_str_radix(digits, 16)
            .map_err(|e| self.error(start, format!("invalid hex literal: {e}")))?;
        self.push(Token::Hex(value), start, self.pos);
        Ok(())
    }

    /// Lex digits with an optional fraction. `start` may point at a leading `-`.
    fn lex_number(&mut self, start: usize) -> Result<(), LexError> {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.bytes.get(self.pos) == Some(&b'.')
            && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = &self.source[start..self.pos];
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(start, format!("invalid number '{text}'")))?;
        self.push(Token::Number(value), start, self.pos);
        Ok(())
    }

    fn lex_ident(&mut self, start: usize) {
        let word = self.take_word();
        let token = match word.as_str() {
            "fn" => Token::Fn,
            "let" => Token::Let,
            "global" => Token::Global,
            "return" => Token::Return,
            "script" => Token::Script,
            "collapse" => Token::Collapse,
            "if" => Token::If,
            "loop" => Token::Loop,
            "break" => Token::Break,
            "else" => {
                if self.try_consume_if() {
                    Token::Elif
                } else {
                    Token::Else
                }
            }
            _ => Token::Ident(word),
        };
        self.push(token, start, self.pos);
    }

    /// After `else`, consume ` if` on the same line so the pair lexes as one token.
    fn try_consume_if(&mut self) -> bool {
        let mut p = self.pos;
        while matches!(self.bytes.get(p), Some(b' ' | b'\t')) {
            p += 1;
        }
        if p == self.pos || self.bytes.get(p..p + 2) != Some(&b"if"[..]) {
            return false;
        }
        if self.bytes.get(p + 2).is_some_and(|&c| is_ident_char(c)) {
            return false;
        }
        self.pos = p + 2;
        true
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        lex(s).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            tok("script main fn foo let x global g"),
            vec![
                Token::Script,
                Token::Ident("main".into()),
                Token::Fn,
                Token::Ident("foo".into()),
                Token::Let,
                Token::Ident("x".into()),
                Token::Global,
                Token::Ident("g".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_keyword_prefix_is_ident() {
        assert_eq!(
            tok("loops iffy"),
            vec![Token::Ident("loops".into()), Token::Ident("iffy".into()), Token::Eof]
        );
    }

    #[test]
    fn test_else_if_is_one_token() {
        assert_eq!(
            tok("else if else iffy"),
            vec![Token::Elif, Token::Else, Token::Ident("iffy".into()), Token::Eof]
        );
    }

    #[test]
    fn test_numbers_and_hex() {
        assert_eq!(
            tok("-3 1 2.5 0xff"),
            vec![
                Token::Number(-3.0),
                Token::Number(1.0),
                Token::Number(2.5),
                Token::Hex(255),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_minus_after_operand_is_subtraction() {
        assert_eq!(
            tok("a-1"),
            vec![
                Token::Ident("a".into()),
                Token::Minus,
                Token::Number(1.0),
                Token::Eof,
            ]
        );
        assert_eq!(tok("(-1)")[1], Token::Number(-1.0));
    }

    #[test]
    fn test_hex_too_long() {
        assert!(lex("0x123456789").is_err());
        assert!(lex("0x").is_err());
    }

    #[test]
    fn test_operators_longest_first() {
        assert_eq!(
            tok("<< >> <= >= < > == != && || & | ^ ! = ++ --"),
            vec![
                Token::Shl,
                Token::Shr,
                Token::Le,
                Token::Ge,
                Token::Lt,
                Token::Gt,
                Token::EqEq,
                Token::Ne,
                Token::AndAnd,
                Token::OrOr,
                Token::Amp,
                Token::Pipe,
                Token::Caret,
                Token::Bang,
                Token::Eq,
                Token::PlusPlus,
                Token::MinusMinus,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_families() {
        assert_eq!(Token::Minus.family(), Some(TokenFamily::Additive));
        assert_eq!(Token::Percent.family(), Some(TokenFamily::Multiplicative));
        assert_eq!(Token::Shr.family(), Some(TokenFamily::Shift));
        assert_eq!(Token::Le.family(), Some(TokenFamily::Relational));
        assert_eq!(Token::Ne.family(), Some(TokenFamily::Equality));
        assert_eq!(Token::AndAnd.family(), None);
    }

    #[test]
    fn test_var_ref() {
        assert_eq!(
            tok("(&a, b)"),
            vec![
                Token::LParen,
                Token::VarRef("a".into()),
                Token::Comma,
                Token::Ident("b".into()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_directives() {
        assert_eq!(
            tok("#__FILE__ /a/b.rai\n#out out.bin\n#extends ../base\n#define X #calc"),
            vec![
                Token::FileMarker("/a/b.rai".into()),
                Token::Out("out.bin".into()),
                Token::Extends("../base".into()),
                Token::Define,
                Token::Ident("X".into()),
                Token::Calc,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unknown_directive() {
        let err = lex("#pragma").unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.message.contains("pragma"));
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            tok("a // line\n/* block\nspanning */ b"),
            vec![Token::Ident("a".into()), Token::Ident("b".into()), Token::Eof]
        );
    }

    #[test]
    fn test_unterminated_block_comment() {
        let err = lex("a /* never closed").unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn test_strings_may_span_lines() {
        assert_eq!(
            tok("\"hello\nworld\""),
            vec![Token::Str("hello\nworld".into()), Token::Eof]
        );
        assert!(lex("\"open").is_err());
    }

    #[test]
    fn test_unexpected_character_offset() {
        let err = lex("let x = $").unwrap_err();
        assert_eq!(err.offset, 8);
    }

    #[test]
    fn test_spans() {
        let tokens = lex("ab  0x1f").unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 2));
        assert_eq!(tokens[1].span, Span::new(4, 8));
    }
}
