use super::ast::*;
use super::lexer::{SpannedToken, Token, TokenFamily};

/// Raw grammar failure at the offending token.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub span: Span,
    pub found: String,
    pub message: String,
}

/// Parse a whole stitched compilation unit.
pub fn parse_file(tokens: Vec<SpannedToken>, source: &str) -> Result<File, SyntaxError> {
    let mut parser = Parser::new(tokens, source);
    parser.parse_file()
}

/// Parse one standalone expression that must span the entire input.
pub fn parse_expression(tokens: Vec<SpannedToken>, source: &str) -> Result<Expr, SyntaxError> {
    let mut parser = Parser::new(tokens, source);
    let expr = parser.parse_expr()?;
    if !parser.at_eof() {
        return Err(parser.error("expected end of expression"));
    }
    Ok(expr)
}

static EOF: Token = Token::Eof;

struct Parser<'a> {
    tokens: Vec<SpannedToken>,
    source: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<SpannedToken>, source: &'a str) -> Self {
        Self {
            tokens,
            source,
            pos: 0,
        }
    }

    // ── Token helpers ───────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.pos + ahead)
            .or_else(|| self.tokens.last())
            .map_or(&EOF, |t| &t.token)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or_else(Span::default, |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> SpannedToken {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(SpannedToken {
            token: Token::Eof,
            span: self.current_span(),
        });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, SyntaxError> {
        if self.peek() == expected {
            Ok(self.advance().span)
        } else {
            Err(self.error(format!("expected '{}'", expected.describe())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Span), SyntaxError> {
        if let Token::Ident(name) = self.peek() {
            let name = name.clone();
            let span = self.advance().span;
            Ok((name, span))
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        let found = self.peek().describe();
        SyntaxError {
            span: self.current_span(),
            message: format!("{}, found '{found}'", message.into()),
            found,
        }
    }

    fn text(&self, span: Span) -> String {
        self.source
            .get(span.start..span.end)
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    // ── Top level ───────────────────────────────────────────────────

    fn parse_file(&mut self) -> Result<File, SyntaxError> {
        let mut items = Vec::new();
        while !self.at_eof() {
            items.push(self.parse_item()?);
        }
        Ok(File { items })
    }

    fn parse_item(&mut self) -> Result<Item, SyntaxError> {
        match self.peek().clone() {
            Token::FileMarker(path) => {
                let span = self.advance().span;
                Ok(Item::FileMarker { path, span })
            }
            Token::Out(path) => {
                let span = self.advance().span;
                Ok(Item::Out { path, span })
            }
            Token::Extends(path) => {
                let span = self.advance().span;
                Ok(Item::Extends { path, span })
            }
            Token::Global => {
                let start = self.advance().span;
                let (name, span) = self.expect_ident("a global name")?;
                Ok(Item::Global {
                    name,
                    span: start.merge(span),
                })
            }
            Token::Define => self.parse_define().map(Item::Define),
            Token::Script => self.parse_callable().map(Item::Script),
            Token::Fn => self.parse_callable().map(Item::Function),
            _ => Err(self.error("expected 'script', 'fn', 'global' or '#define'")),
        }
    }

    fn parse_define(&mut self) -> Result<DefineDef, SyntaxError> {
        let start = self.advance().span;
        let (name, name_span) = self.expect_ident("a define name")?;
        let body = self.parse_expr()?;
        let text = self.text(body.span);
        Ok(DefineDef {
            name,
            name_span,
            span: start.merge(body.span),
            body,
            text,
        })
    }

    /// `script NAME(params) { ... }` / `fn NAME(params) { ... }`
    fn parse_callable(&mut self) -> Result<CallableDef, SyntaxError> {
        let start = self.advance().span;
        let (name, name_span) = self.expect_ident("a name")?;
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(CallableDef {
            name,
            name_span,
            params,
            span: start.merge(body.span),
            body,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, SyntaxError> {
        self.expect(&Token::LParen)?;
        let mut params: Vec<Param> = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(params);
        }
        loop {
            let (name, is_ref) = match self.peek() {
                Token::Ident(name) => (name.clone(), false),
                Token::VarRef(name) => (name.clone(), true),
                _ => return Err(self.error("expected a parameter name")),
            };
            if is_ref && params.last().is_some_and(|p| !p.is_ref) {
                return Err(self.error("reference parameters must come before value parameters"));
            }
            let span = self.advance().span;
            params.push(Param { name, is_ref, span });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(params)
    }

    // ── Statements ──────────────────────────────────────────────────

    fn parse_block(&mut self) -> Result<Block, SyntaxError> {
        let start = self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(Block {
            stmts,
            span: start.merge(end),
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        match self.peek() {
            Token::Break => Ok(Stmt::Break(self.advance().span)),
            Token::Collapse => self.parse_call().map(Stmt::Call),
            Token::Let => self.parse_let(),
            Token::Return => {
                let start = self.advance().span;
                if can_start_expr(self.peek()) {
                    let value = self.parse_expr()?;
                    Ok(Stmt::Return {
                        span: start.merge(value.span),
                        value: Some(value),
                    })
                } else {
                    Ok(Stmt::Return {
                        value: None,
                        span: start,
                    })
                }
            }
            Token::Loop => {
                let start = self.advance().span;
                let body = self.parse_block()?;
                Ok(Stmt::Loop {
                    span: start.merge(body.span),
                    body,
                })
            }
            Token::If => self.parse_if(),
            Token::Ident(_) => self.parse_ident_stmt(),
            _ => Err(self.error("expected a statement")),
        }
    }

    fn parse_let(&mut self) -> Result<Stmt, SyntaxError> {
        let start = self.advance().span;
        let (name, name_span) = self.expect_ident("a variable name")?;
        self.expect(&Token::Eq)?;
        let value = self.parse_expr()?;
        Ok(Stmt::Let {
            name,
            name_span,
            span: start.merge(value.span),
            value,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, SyntaxError> {
        let start = self.advance().span;
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        let mut end = body.span;
        let mut branches = vec![(cond, body)];
        while self.eat(&Token::Elif) {
            let cond = self.parse_expr()?;
            let body = self.parse_block()?;
            end = body.span;
            branches.push((cond, body));
        }
        let else_body = if self.eat(&Token::Else) {
            let body = self.parse_block()?;
            end = body.span;
            Some(body)
        } else {
            None
        };
        Ok(Stmt::If {
            branches,
            else_body,
            span: start.merge(end),
        })
    }

    /// Statement starting with an identifier: call, assignment, or a lone name.
    fn parse_ident_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let next = self.peek_at(1).clone();
        let then_eq = self.peek_at(2) == &Token::Eq;
        let compound = match next {
            Token::LParen => return self.parse_call().map(Stmt::Call),
            Token::Eq => None,
            Token::Plus | Token::Minus | Token::Star | Token::Slash | Token::Percent if then_eq => {
                binop_for(&next)
            }
            _ => {
                let (name, span) = self.expect_ident("an identifier")?;
                return Ok(Stmt::Ident { name, span });
            }
        };
        let (name, name_span) = self.expect_ident("a variable name")?;
        if compound.is_some() {
            self.advance();
        }
        self.expect(&Token::Eq)?;
        let value = self.parse_expr()?;
        Ok(Stmt::Assign {
            name,
            name_span,
            op: compound,
            span: name_span.merge(value.span),
            value,
        })
    }

    fn parse_call(&mut self) -> Result<CallExpr, SyntaxError> {
        let start = self.current_span();
        let collapse = self.eat(&Token::Collapse);
        let (name, name_span) = self.expect_ident("a call target")?;
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                if let Token::Str(value) = self.peek() {
                    let value = value.clone();
                    let span = self.advance().span;
                    args.push(Arg::Str { value, span });
                } else {
                    args.push(Arg::Expr(self.parse_expr()?));
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let end = self.expect(&Token::RParen)?;
        Ok(CallExpr {
            name,
            name_span,
            collapse,
            args,
            span: start.merge(end),
        })
    }

    // ── Expressions (lowest to highest precedence) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_or()
    }

    fn parse_binary(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, SyntaxError>,
        op_for: fn(&Token) -> Option<BinOp>,
    ) -> Result<Expr, SyntaxError> {
        let mut left = next(self)?;
        while let Some(op) = op_for(self.peek()) {
            self.advance();
            let right = next(self)?;
            let span = left.span.merge(right.span);
            left = Expr {
                kind: ExprKind::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_and, |t| (t == &Token::OrOr).then_some(BinOp::Or))
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_bit_or, |t| (t == &Token::AndAnd).then_some(BinOp::And))
    }

    fn parse_bit_or(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_bit_xor, |t| (t == &Token::Pipe).then_some(BinOp::BitOr))
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_bit_and, |t| (t == &Token::Caret).then_some(BinOp::BitXor))
    }

    fn parse_bit_and(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_equality, |t| (t == &Token::Amp).then_some(BinOp::BitAnd))
    }

    fn parse_equality(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_relational, |t| family_op(t, TokenFamily::Equality))
    }

    fn parse_relational(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_shift, |t| family_op(t, TokenFamily::Relational))
    }

    fn parse_shift(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_additive, |t| family_op(t, TokenFamily::Shift))
    }

    fn parse_additive(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_multiplicative, |t| family_op(t, TokenFamily::Additive))
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(Self::parse_atomic, |t| family_op(t, TokenFamily::Multiplicative))
    }

    fn parse_atomic(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.current_span();
        match self.peek().clone() {
            Token::Bang => {
                self.advance();
                // `!` negates everything that follows, not just the next atom.
                let inner = self.parse_expr()?;
                Ok(Expr {
                    span: span.merge(inner.span),
                    kind: ExprKind::Not(Box::new(inner)),
                })
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                let end = self.expect(&Token::RParen)?;
                Ok(Expr {
                    kind: inner.kind,
                    span: span.merge(end),
                })
            }
            Token::Hex(value) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Number(f64::from(value)),
                    span,
                })
            }
            Token::Number(value) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Number(value),
                    span,
                })
            }
            Token::Calc => {
                self.advance();
                let open = self.expect(&Token::LParen)?;
                self.parse_expr()?;
                let close = self.expect(&Token::RParen)?;
                let text = self.text(Span::new(open.end, close.start));
                Ok(Expr {
                    kind: ExprKind::Calc { text },
                    span: span.merge(close),
                })
            }
            Token::Collapse => {
                let call = self.parse_call()?;
                Ok(Expr {
                    span: call.span,
                    kind: ExprKind::Call(call),
                })
            }
            Token::Ident(name) => {
                if self.peek_at(1) == &Token::LParen {
                    let call = self.parse_call()?;
                    return Ok(Expr {
                        span: call.span,
                        kind: ExprKind::Call(call),
                    });
                }
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Ident {
                        name,
                        from_target: false,
                    },
                    span,
                })
            }
            Token::At => {
                self.advance();
                let (name, end) = self.expect_ident("an identifier after '@'")?;
                Ok(Expr {
                    kind: ExprKind::Ident {
                        name,
                        from_target: true,
                    },
                    span: span.merge(end),
                })
            }
            _ => Err(self.error("expected an expression")),
        }
    }
}

fn can_start_expr(token: &Token) -> bool {
    matches!(
        token,
        Token::Bang
            | Token::LParen
            | Token::Hex(_)
            | Token::Number(_)
            | Token::Calc
            | Token::Collapse
            | Token::Ident(_)
            | Token::At
    )
}

fn family_op(token: &Token, family: TokenFamily) -> Option<BinOp> {
    if token.family() == Some(family) {
        binop_for(token)
    } else {
        None
    }
}

fn binop_for(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::OrOr => BinOp::Or,
        Token::AndAnd => BinOp::And,
        Token::Pipe => BinOp::BitOr,
        Token::Caret => BinOp::BitXor,
        Token::Amp => BinOp::BitAnd,
        Token::EqEq => BinOp::Eq,
        Token::Ne => BinOp::Ne,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Shl => BinOp::Shl,
        Token::Shr => BinOp::Shr,
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        _ => return None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::lexer::lex;

    fn parse_src(src: &str) -> Result<File, SyntaxError> {
        parse_file(lex(src).unwrap(), src)
    }

    fn expr(src: &str) -> Expr {
        parse_expression(lex(src).unwrap(), src).unwrap()
    }

    fn main_body(src: &str) -> Vec<Stmt> {
        let file = parse_src(src).unwrap();
        match file.items.into_iter().next().unwrap() {
            Item::Script(def) => def.body.stmts,
            other => panic!("expected script, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let e = expr("1 + 2 * 3");
        let ExprKind::BinOp { op, right, .. } = e.kind else { panic!() };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_left_associative() {
        let e = expr("8 - 4 - 2");
        let ExprKind::BinOp { op, left, right } = e.kind else { panic!() };
        assert_eq!(op, BinOp::Sub);
        assert!(matches!(left.kind, ExprKind::BinOp { op: BinOp::Sub, .. }));
        assert!(matches!(right.kind, ExprKind::Number(n) if n == 2.0));
    }

    #[test]
    fn test_full_precedence_chain() {
        // a || b && c | d ^ e & f == g < h << i + j * k
        let e = expr("a || b && c | d ^ e & f == g < h << i + j * k");
        let mut ops = Vec::new();
        let mut cur = &e;
        while let ExprKind::BinOp { op, right, .. } = &cur.kind {
            ops.push(*op);
            cur = right;
        }
        assert_eq!(
            ops,
            vec![
                BinOp::Or,
                BinOp::And,
                BinOp::BitOr,
                BinOp::BitXor,
                BinOp::BitAnd,
                BinOp::Eq,
                BinOp::Lt,
                BinOp::Shl,
                BinOp::Add,
                BinOp::Mul,
            ]
        );
    }

    #[test]
    fn test_not_takes_whole_expression() {
        let e = expr("!a && b");
        let ExprKind::Not(inner) = e.kind else { panic!() };
        assert!(matches!(inner.kind, ExprKind::BinOp { op: BinOp::And, .. }));
    }

    #[test]
    fn test_atoms() {
        assert!(matches!(expr("0x10").kind, ExprKind::Number(n) if n == 16.0));
        assert!(matches!(
            expr("@Target").kind,
            ExprKind::Ident { ref name, from_target: true } if name == "Target"
        ));
        assert!(matches!(expr("foo(1, \"s\")").kind, ExprKind::Call(ref c) if c.args.len() == 2));
        assert!(matches!(expr("collapse foo()").kind, ExprKind::Call(ref c) if c.collapse));
    }

    #[test]
    fn test_calc_captures_text() {
        let e = expr("#calc( X * 3 )");
        let ExprKind::Calc { text } = e.kind else { panic!() };
        assert_eq!(text, "X * 3");
    }

    #[test]
    fn test_expression_must_consume_input() {
        let src = "1 2";
        assert!(parse_expression(lex(src).unwrap(), src).is_err());
    }

    #[test]
    fn test_top_level_items() {
        let file = parse_src(
            "#out a.bin\n#extends ../base\nglobal g\n#define X 1 + 2\nfn f(&a, b) { }\nscript main() { }",
        )
        .unwrap();
        assert_eq!(file.items.len(), 6);
        assert!(matches!(&file.items[0], Item::Out { path, .. } if path == "a.bin"));
        assert!(matches!(&file.items[1], Item::Extends { path, .. } if path == "../base"));
        assert!(matches!(&file.items[2], Item::Global { name, .. } if name == "g"));
        let Item::Define(def) = &file.items[3] else { panic!() };
        assert_eq!(def.text, "1 + 2");
        let Item::Function(f) = &file.items[4] else { panic!() };
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.ref_count(), 1);
    }

    #[test]
    fn test_ref_param_after_value_param_rejected() {
        assert!(parse_src("fn f(a, &b) { }").is_err());
    }

    #[test]
    fn test_statements() {
        let stmts = main_body(
            "script main() { let x = 1 x = 2 x += 3 Print(x) collapse other() loop { break } return x }",
        );
        assert!(matches!(stmts[0], Stmt::Let { .. }));
        assert!(matches!(stmts[1], Stmt::Assign { op: None, .. }));
        assert!(matches!(stmts[2], Stmt::Assign { op: Some(BinOp::Add), .. }));
        assert!(matches!(&stmts[3], Stmt::Call(c) if c.name == "Print" && !c.collapse));
        assert!(matches!(&stmts[4], Stmt::Call(c) if c.name == "other" && c.collapse));
        assert!(matches!(&stmts[5], Stmt::Loop { body, .. } if matches!(body.stmts[0], Stmt::Break(_))));
        assert!(matches!(stmts[6], Stmt::Return { value: Some(_), .. }));
    }

    #[test]
    fn test_compound_assign_ops() {
        let stmts = main_body("script main() { x -= 1 x *= 2 x /= 3 x %= 4 }");
        let ops: Vec<_> = stmts
            .iter()
            .map(|s| match s {
                Stmt::Assign { op, .. } => *op,
                _ => None,
            })
            .collect();
        assert_eq!(
            ops,
            vec![Some(BinOp::Sub), Some(BinOp::Mul), Some(BinOp::Div), Some(BinOp::Mod)]
        );
    }

    #[test]
    fn test_if_elif_else() {
        let stmts = main_body("script main() { if a { } else if b { } else if c { } else { } }");
        let Stmt::If { branches, else_body, .. } = &stmts[0] else { panic!() };
        assert_eq!(branches.len(), 3);
        assert!(else_body.is_some());
    }

    #[test]
    fn test_bare_return_and_hanging_ident() {
        let stmts = main_body("script main() { return } ");
        assert!(matches!(stmts[0], Stmt::Return { value: None, .. }));
        let stmts = main_body("script main() { foo }");
        assert!(matches!(&stmts[0], Stmt::Ident { name, .. } if name == "foo"));
    }

    #[test]
    fn test_semicolon_is_error() {
        let err = parse_src("script main() { x = 1; }").unwrap_err();
        assert_eq!(err.found, ";");
    }

    #[test]
    fn test_unexpected_top_level() {
        let err = parse_src("let x = 1").unwrap_err();
        assert_eq!(err.span.start, 0);
    }
}
