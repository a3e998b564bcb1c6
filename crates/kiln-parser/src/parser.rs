//! The kiln expression parser.

use kiln_common::Span;
use kiln_diagnostic::{Diagnostic, DiagnosticKind, ErrorCode, Label};
use kiln_lexer::{Token, TokenKind};
use kiln_syntax::*;

use crate::recovery::{DelimiterKind, DelimiterStack, is_sync_token};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
    delimiter_stack: DelimiterStack,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            diagnostics: Vec::new(),
            delimiter_stack: DelimiterStack::new(),
        }
    }

    pub fn diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    /// Parse the whole input as a single expression.
    pub fn parse_expr_toplevel(&mut self) -> Expr {
        let expr = self.parse_expr();
        if !self.at_end() {
            self.error("unexpected trailing input after expression");
        }
        expr
    }

    // ========== Expression grammar, loosest to tightest ==========
    //
    // expr          := lambda | if | assert | with | let | or_expr
    // or_expr       := and_expr ('||' and_expr)*
    // and_expr      := equality_expr ('&&' equality_expr)*
    // equality_expr := comparison_expr (('==' | '!=') comparison_expr)?
    // comparison_expr:= update_expr (('<' | '<=' | '>' | '>=') update_expr)?
    // update_expr   := has_attr_expr ('//' update_expr)?        (right assoc)
    // has_attr_expr := additive_expr ('?' attr_path)*
    // additive_expr := multiplicative_expr (('+' | '-') multiplicative_expr)*
    // multiplicative_expr := concat_expr (('*' | '/') concat_expr)*
    // concat_expr   := unary_expr ('++' concat_expr)?           (right assoc)
    // unary_expr    := ('!' | '-') unary_expr | app_expr
    // app_expr      := postfix_expr postfix_expr*               (juxtaposition)
    // postfix_expr  := primary_expr ('.' attr_path ('or' app_expr)?)*
    // primary_expr  := literals | var | parens | list | attrset | string

    pub fn parse_expr(&mut self) -> Expr {
        if let Some(lambda) = self.try_parse_lambda() {
            return lambda;
        }

        match self.current_kind() {
            TokenKind::If => self.parse_if_expr(),
            TokenKind::Assert => self.parse_assert_expr(),
            TokenKind::With => self.parse_with_expr(),
            TokenKind::Let => self.parse_let_expr(),
            _ => self.parse_or_expr(),
        }
    }

    fn parse_if_expr(&mut self) -> Expr {
        let start = self.current_span();
        self.advance(); // `if`
        let cond = self.parse_expr();
        self.expect(TokenKind::Then);
        let then_branch = self.parse_expr();
        self.expect(TokenKind::Else);
        let else_branch = self.parse_expr();
        let span = start.merge(else_branch.span);
        Expr::new(
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        )
    }

    fn parse_assert_expr(&mut self) -> Expr {
        let start = self.current_span();
        self.advance(); // `assert`
        let cond = self.parse_expr();
        self.expect(TokenKind::Semicolon);
        let body = self.parse_expr();
        let span = start.merge(body.span);
        Expr::new(
            ExprKind::Assert {
                cond: Box::new(cond),
                body: Box::new(body),
            },
            span,
        )
    }

    fn parse_with_expr(&mut self) -> Expr {
        let start = self.current_span();
        self.advance(); // `with`
        let attrs = self.parse_expr();
        self.expect(TokenKind::Semicolon);
        let body = self.parse_expr();
        let span = start.merge(body.span);
        Expr::new(
            ExprKind::With {
                attrs: Box::new(attrs),
                body: Box::new(body),
            },
            span,
        )
    }

    fn parse_let_expr(&mut self) -> Expr {
        let start = self.current_span();
        self.advance(); // `let`
        let (bindings, inherits) = self.parse_bindings(TokenKind::In);
        self.expect(TokenKind::In);
        let body = self.parse_expr();
        let span = start.merge(body.span);
        Expr::new(
            ExprKind::Let {
                bindings,
                inherits,
                body: Box::new(body),
            },
            span,
        )
    }

    /// Parse `name = expr;` and `inherit a b;` / `inherit (e) a b;` bindings
    /// until `terminator` is seen.
    fn parse_bindings(&mut self, terminator: TokenKind) -> (Vec<AttrBinding>, Vec<String>) {
        let mut bindings = Vec::new();
        let mut inherits = Vec::new();

        while !self.check(terminator.clone()) && !self.at_end() {
            if self.eat(TokenKind::Inherit) {
                if self.eat(TokenKind::LParen) {
                    // `inherit (expr) a b;` desugars to `a = expr.a; b = expr.b;`
                    let source = self.parse_expr();
                    self.expect(TokenKind::RParen);
                    while let TokenKind::Ident(_) = self.current_kind() {
                        let (name, span) = self.parse_ident_raw();
                        let select = Expr::new(
                            ExprKind::Select {
                                base: Box::new(source.clone()),
                                path: vec![name.clone()],
                                or_default: None,
                            },
                            span,
                        );
                        bindings.push(AttrBinding {
                            name,
                            value: select,
                            span,
                        });
                    }
                } else {
                    while let TokenKind::Ident(_) = self.current_kind() {
                        let (name, _) = self.parse_ident_raw();
                        inherits.push(name);
                    }
                }
                self.expect(TokenKind::Semicolon);
                continue;
            }

            let start = self.current_span();
            let (name, _) = match self.current_kind() {
                TokenKind::Ident(_) => self.parse_ident_raw(),
                _ => {
                    self.error("expected a binding name or `inherit`");
                    self.synchronize_binding();
                    continue;
                }
            };
            self.expect(TokenKind::Eq);
            let value = self.parse_expr();
            let span = start.merge(value.span);
            if !self.eat(TokenKind::Semicolon) {
                self.error("expected `;` after binding");
                self.synchronize_binding();
            }
            bindings.push(AttrBinding { name, value, span });
        }

        (bindings, inherits)
    }

    // ========== Lambda head lookahead ==========

    /// Try to parse a lambda head (`x: body`, `{...}: body`, `x@{...}: body`,
    /// `{...}@x: body`). Returns `None` and leaves `pos` untouched if the
    /// current position isn't a lambda head.
    fn try_parse_lambda(&mut self) -> Option<Expr> {
        let start = self.current_span();

        // `ident : body` or `ident @ { ... } : body`
        if let TokenKind::Ident(name) = self.current_kind().clone() {
            if self.peek_kind(1) == Some(&TokenKind::Colon) {
                self.advance(); // ident
                self.advance(); // :
                let body = self.parse_expr();
                let span = start.merge(body.span);
                return Some(Expr::new(
                    ExprKind::Lambda {
                        param: LambdaParam::Simple(name),
                        body: Box::new(body),
                    },
                    span,
                ));
            }
            if self.peek_kind(1) == Some(&TokenKind::At) && self.peek_kind(2) == Some(&TokenKind::LBrace)
            {
                self.advance(); // ident
                self.advance(); // @
                let mut formals = self.parse_formals();
                formals.bind_name = Some(name);
                self.expect(TokenKind::Colon);
                let body = self.parse_expr();
                let span = start.merge(body.span);
                return Some(Expr::new(
                    ExprKind::Lambda {
                        param: LambdaParam::Formals(formals),
                        body: Box::new(body),
                    },
                    span,
                ));
            }
        }

        // `{ ... } : body` or `{ ... } @ ident : body`
        if self.check(TokenKind::LBrace) && self.is_formals_ahead() {
            let mut formals = self.parse_formals();
            if self.eat(TokenKind::At) {
                let (name, _) = self.parse_ident_raw();
                formals.bind_name = Some(name);
            }
            self.expect(TokenKind::Colon);
            let body = self.parse_expr();
            let span = start.merge(body.span);
            return Some(Expr::new(
                ExprKind::Lambda {
                    param: LambdaParam::Formals(formals),
                    body: Box::new(body),
                },
                span,
            ));
        }

        None
    }

    /// Scan ahead from a `{` to its matching `}` and check whether what
    /// follows looks like a lambda head (`:` or `@ ident :`) rather than an
    /// attribute-set literal.
    fn is_formals_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos;
        loop {
            match self.tokens.get(i).map(|t| &t.kind) {
                Some(TokenKind::LBrace) => {
                    depth += 1;
                    i += 1;
                }
                Some(TokenKind::RBrace) => {
                    depth -= 1;
                    i += 1;
                    if depth == 0 {
                        break;
                    }
                }
                Some(TokenKind::Eof) | None => return false,
                _ => i += 1,
            }
        }
        match self.tokens.get(i).map(|t| &t.kind) {
            Some(TokenKind::Colon) => true,
            Some(TokenKind::At) => true,
            _ => false,
        }
    }

    fn parse_formals(&mut self) -> Formals {
        let start = self.current_span();
        self.expect(TokenKind::LBrace);
        let mut fields = Vec::new();
        let mut ellipsis = false;

        while !self.check(TokenKind::RBrace) && !self.at_end() {
            if self.eat(TokenKind::DotDot) {
                ellipsis = true;
                break;
            }
            let field_start = self.current_span();
            let (name, _) = self.parse_ident_raw();
            let default = if self.eat(TokenKind::Question) {
                Some(self.parse_expr())
            } else {
                None
            };
            let span = field_start.merge(self.previous_span());
            fields.push(FormalField { name, default, span });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RBrace);
        let span = start.merge(self.previous_span());
        Formals {
            fields,
            ellipsis,
            bind_name: None,
            span,
        }
    }

    // ========== Operator ladder ==========

    fn parse_or_expr(&mut self) -> Expr {
        let mut left = self.parse_and_expr();
        while self.eat(TokenKind::OrOr) {
            let right = self.parse_and_expr();
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op: BinOp::Or,
                    lhs: Box::new(left),
                    rhs: Box::new(right),
                },
                span,
            );
        }
        left
    }

    fn parse_and_expr(&mut self) -> Expr {
        let mut left = self.parse_equality_expr();
        while self.eat(TokenKind::AndAnd) {
            let right = self.parse_equality_expr();
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op: BinOp::And,
                    lhs: Box::new(left),
                    rhs: Box::new(right),
                },
                span,
            );
        }
        left
    }

    fn parse_equality_expr(&mut self) -> Expr {
        let left = self.parse_comparison_expr();
        let op = match self.current_kind() {
            TokenKind::EqEq => BinOp::Eq,
            TokenKind::BangEq => BinOp::Ne,
            _ => return left,
        };
        self.advance();
        let right = self.parse_comparison_expr();
        let span = left.span.merge(right.span);
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            },
            span,
        )
    }

    fn parse_comparison_expr(&mut self) -> Expr {
        let left = self.parse_update_expr();
        let op = match self.current_kind() {
            TokenKind::Lt => BinOp::Lt,
            TokenKind::LtEq => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::GtEq => BinOp::Ge,
            _ => return left,
        };
        self.advance();
        let right = self.parse_update_expr();
        let span = left.span.merge(right.span);
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            },
            span,
        )
    }

    fn parse_update_expr(&mut self) -> Expr {
        let left = self.parse_has_attr_expr();
        if self.eat(TokenKind::SlashSlash) {
            let right = self.parse_update_expr(); // right assoc
            let span = left.span.merge(right.span);
            Expr::new(ExprKind::Update(Box::new(left), Box::new(right)), span)
        } else {
            left
        }
    }

    fn parse_has_attr_expr(&mut self) -> Expr {
        let mut left = self.parse_additive_expr();
        while self.eat(TokenKind::Question) {
            let path = self.parse_attr_path();
            let span = left.span.merge(self.previous_span());
            left = Expr::new(
                ExprKind::HasAttr {
                    base: Box::new(left),
                    path,
                },
                span,
            );
        }
        left
    }

    fn parse_additive_expr(&mut self) -> Expr {
        let mut left = self.parse_multiplicative_expr();
        loop {
            let op = match self.current_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative_expr();
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(left),
                    rhs: Box::new(right),
                },
                span,
            );
        }
        left
    }

    fn parse_multiplicative_expr(&mut self) -> Expr {
        let mut left = self.parse_concat_expr();
        loop {
            let op = match self.current_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat_expr();
            let span = left.span.merge(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(left),
                    rhs: Box::new(right),
                },
                span,
            );
        }
        left
    }

    fn parse_concat_expr(&mut self) -> Expr {
        let left = self.parse_unary_expr();
        if self.eat(TokenKind::PlusPlus) {
            let right = self.parse_concat_expr(); // right assoc
            let span = left.span.merge(right.span);
            Expr::new(ExprKind::Concat(Box::new(left), Box::new(right)), span)
        } else {
            left
        }
    }

    fn parse_unary_expr(&mut self) -> Expr {
        let start = self.current_span();
        if self.eat(TokenKind::Bang) {
            let operand = self.parse_unary_expr();
            let span = start.merge(operand.span);
            return Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            );
        }
        if self.eat(TokenKind::Minus) {
            let operand = self.parse_unary_expr();
            let span = start.merge(operand.span);
            return Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                span,
            );
        }
        self.parse_app_expr()
    }

    /// Function application by juxtaposition: `f x y` == `(f x) y`.
    fn parse_app_expr(&mut self) -> Expr {
        let mut expr = self.parse_postfix_expr();
        while self.starts_atom() {
            let arg = self.parse_postfix_expr();
            let span = expr.span.merge(arg.span);
            expr = Expr::new(
                ExprKind::Call {
                    func: Box::new(expr),
                    arg: Box::new(arg),
                },
                span,
            );
        }
        expr
    }

    /// Whether the current token can start a primary expression, used to
    /// decide whether juxtaposition continues applying arguments.
    fn starts_atom(&self) -> bool {
        matches!(
            self.current_kind(),
            TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::PathLit(_)
                | TokenKind::InterpolatedStart
                | TokenKind::Ident(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
                | TokenKind::Rec
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
        )
    }

    fn parse_postfix_expr(&mut self) -> Expr {
        let mut expr = self.parse_primary_expr();
        loop {
            if self.eat(TokenKind::Dot) {
                let path = self.parse_attr_path();
                let or_default = if self.eat(TokenKind::Or) {
                    Some(Box::new(self.parse_app_expr()))
                } else {
                    None
                };
                let span = expr.span.merge(self.previous_span());
                expr = Expr::new(
                    ExprKind::Select {
                        base: Box::new(expr),
                        path,
                        or_default,
                    },
                    span,
                );
            } else {
                break;
            }
        }
        expr
    }

    /// `a.b.c` — one or more dot-separated identifiers. The leading `.` of
    /// the first segment has already been consumed by the caller.
    fn parse_attr_path(&mut self) -> Vec<String> {
        let mut path = Vec::new();
        loop {
            let (name, _) = self.parse_ident_raw();
            path.push(name);
            if !self.eat(TokenKind::Dot) {
                break;
            }
        }
        path
    }

    fn parse_primary_expr(&mut self) -> Expr {
        let start = self.current_span();

        match self.current_kind().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Expr::new(ExprKind::Int(n), start)
            }
            TokenKind::Float(f) => {
                self.advance();
                Expr::new(ExprKind::Float(f), start)
            }
            TokenKind::PathLit(p) => {
                self.advance();
                Expr::new(ExprKind::Path(p), start)
            }
            TokenKind::True => {
                self.advance();
                Expr::new(ExprKind::Bool(true), start)
            }
            TokenKind::False => {
                self.advance();
                Expr::new(ExprKind::Bool(false), start)
            }
            TokenKind::Null => {
                self.advance();
                Expr::new(ExprKind::Null, start)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Expr::new(ExprKind::Var(name), start)
            }
            TokenKind::InterpolatedStart => self.parse_string_expr(),
            TokenKind::LParen => {
                self.advance();
                self.delimiter_stack.push(DelimiterKind::Paren);
                let inner = self.parse_expr();
                self.delimiter_stack.pop();
                self.expect(TokenKind::RParen);
                Expr::new(inner.kind, start.merge(self.previous_span()))
            }
            TokenKind::LBracket => self.parse_list_expr(),
            TokenKind::Rec => {
                self.advance();
                self.parse_attrs_expr(start, true)
            }
            TokenKind::LBrace => self.parse_attrs_expr(start, false),
            _ => {
                self.error("expected an expression");
                self.pos = (self.pos + 1).min(self.tokens.len().saturating_sub(1));
                Expr::new(ExprKind::Null, start)
            }
        }
    }

    fn parse_string_expr(&mut self) -> Expr {
        let start = self.current_span();
        self.advance(); // InterpolatedStart
        let mut parts = Vec::new();

        loop {
            match self.current_kind().clone() {
                TokenKind::InterpolatedPart(s) => {
                    self.advance();
                    parts.push(StringPart::Literal(s));
                }
                TokenKind::InterpolationStart => {
                    self.advance();
                    self.delimiter_stack.push(DelimiterKind::Brace);
                    let expr = self.parse_expr();
                    self.delimiter_stack.pop();
                    self.expect(TokenKind::InterpolationEnd);
                    parts.push(StringPart::Expr(expr));
                }
                TokenKind::InterpolatedEnd => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => {
                    self.error("unterminated string");
                    break;
                }
                _ => {
                    self.error("malformed string");
                    self.advance();
                }
            }
        }

        let span = start.merge(self.previous_span());
        Expr::new(ExprKind::Str(parts), span)
    }

    fn parse_list_expr(&mut self) -> Expr {
        let start = self.current_span();
        self.advance(); // `[`
        self.delimiter_stack.push(DelimiterKind::Bracket);
        let mut items = Vec::new();

        while !self.check(TokenKind::RBracket) && !self.at_end() {
            // List elements are juxtaposed like function arguments: each
            // element parses at `app_expr` precedence so `[f x y]` is a
            // single-element list, matching attribute-set value parsing.
            items.push(self.parse_or_expr());
        }

        self.delimiter_stack.pop();
        self.expect(TokenKind::RBracket);
        let span = start.merge(self.previous_span());
        Expr::new(ExprKind::List(items), span)
    }

    fn parse_attrs_expr(&mut self, start: Span, recursive: bool) -> Expr {
        self.advance(); // `{`
        self.delimiter_stack.push(DelimiterKind::Brace);
        let (bindings, inherits) = self.parse_bindings(TokenKind::RBrace);
        self.delimiter_stack.pop();
        self.expect(TokenKind::RBrace);
        let span = start.merge(self.previous_span());
        Expr::new(
            ExprKind::Attrs {
                recursive,
                bindings,
                inherits,
            },
            span,
        )
    }

    // ========== Token helpers ==========

    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or(&self.tokens[self.tokens.len() - 1])
    }

    fn current_kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn peek_kind(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn current_span(&self) -> Span {
        self.current().span
    }

    fn previous_span(&self) -> Span {
        if self.pos > 0 {
            self.tokens[self.pos - 1].span
        } else {
            Span::DUMMY
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.current_kind(), TokenKind::Eof)
    }

    fn check(&self, kind: TokenKind) -> bool {
        std::mem::discriminant(self.current_kind()) == std::mem::discriminant(&kind)
    }

    fn advance(&mut self) {
        if !self.at_end() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) {
        if !self.eat(kind.clone()) {
            self.error(&format!("expected {:?}", kind));
        }
    }

    /// Consume an identifier token, returning its name and span. Callers
    /// must have already checked `current_kind()` is `Ident`.
    fn parse_ident_raw(&mut self) -> (String, Span) {
        let span = self.current_span();
        if let TokenKind::Ident(name) = self.current_kind().clone() {
            self.advance();
            (name, span)
        } else {
            self.error("expected an identifier");
            (String::new(), span)
        }
    }

    fn error(&mut self, message: &str) {
        let span = self.current_span();
        self.diagnostics.push(
            Diagnostic::error(DiagnosticKind::Parser, span, message)
                .with_code(ErrorCode::UnexpectedToken)
                .with_label(Label::new(span, "here")),
        );
    }

    // ========== Error recovery ==========

    /// Skip tokens until a binding separator (`;`) is consumed or another
    /// sync point (closing delimiter, `in`, eof) is reached.
    fn synchronize_binding(&mut self) {
        while !self.at_end() {
            if self.eat(TokenKind::Semicolon) {
                return;
            }
            if is_sync_token(self.current_kind()) {
                return;
            }
            let kind = self.current_kind().clone();
            self.delimiter_stack.update(&kind);
            self.advance();
        }
    }
}
