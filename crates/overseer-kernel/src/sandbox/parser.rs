//! Recursive-descent parser for action text

use super::ast::{BinaryOp, Expr, FunctionDef, Literal, Program, Stmt, UnaryOp};
use super::error::ParseError;
use super::lexer::{tokenize, Token, TokenKind};
use std::collections::HashSet;

/// Maximum nesting of blocks and expressions
const MAX_NESTING: usize = 64;

/// Parse action text into a [`Program`]
///
/// # Errors
/// Returns a [`ParseError`] pointing at the first offending token.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let token = &self.tokens[self.pos];
        ParseError::new(token.line, token.column, message)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn program(mut self) -> Result<Program, ParseError> {
        let mut functions = Vec::new();
        let mut seen = HashSet::new();
        while !self.check(&TokenKind::Eof) {
            let function = self.function()?;
            if !seen.insert(function.name.clone()) {
                return Err(self.error(format!("function '{}' defined twice", function.name)));
            }
            functions.push(function);
        }
        Ok(Program { functions })
    }

    fn function(&mut self) -> Result<FunctionDef, ParseError> {
        let is_async = self.eat(&TokenKind::Async);
        self.expect(&TokenKind::Fn, "'fn'")?;
        let name = self.ident("function name")?;
        self.expect(&TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RParen) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            is_async,
            body,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.enter()?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.error("unexpected end of input, expected '}'"));
            }
            stmts.push(self.statement()?);
        }
        self.advance();
        self.leave();
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            TokenKind::Let => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(&TokenKind::Assign, "'='")?;
                let value = self.expression()?;
                self.expect(&TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Let(name, value))
            }
            TokenKind::If => self.if_statement(),
            TokenKind::For => {
                self.advance();
                let var = self.ident("loop variable")?;
                self.expect(&TokenKind::In, "'in'")?;
                let iterable = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    var,
                    iterable,
                    body,
                })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(&TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Return(value))
            }
            TokenKind::Ident(name) if self.peek_at(1) == &TokenKind::Assign => {
                let name = name.clone();
                self.advance();
                self.advance();
                let value = self.expression()?;
                self.expect(&TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Assign(name, value))
            }
            _ => {
                let expr = self.expression()?;
                self.expect(&TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::If, "'if'")?;
        let cond = self.expression()?;
        let then_branch = self.block()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                self.enter()?;
                let nested = self.if_statement();
                self.leave();
                Some(vec![nested?])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let expr = self.or_expr();
        self.leave();
        expr
    }

    /// Left-associative chain of one precedence level
    ///
    /// Each operator nests the tree one level deeper, so every link counts
    /// against the nesting limit until the chain is complete.
    fn chain(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, ParseError>,
        operator: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> Result<Expr, ParseError> {
        let mut lhs = operand(self)?;
        let mut links = 0;
        while let Some(op) = operator(self.peek()) {
            self.advance();
            self.enter()?;
            links += 1;
            let rhs = operand(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= links;
        Ok(lhs)
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        self.chain(Self::and_expr, |kind| (kind == &TokenKind::OrOr).then_some(BinaryOp::Or))
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        self.chain(Self::equality, |kind| (kind == &TokenKind::AndAnd).then_some(BinaryOp::And))
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        self.chain(Self::comparison, |kind| match kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        self.chain(Self::term, |kind| match kind {
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        self.chain(Self::factor, |kind| match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        self.chain(Self::unary, |kind| match kind {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Await => {
                self.advance();
                self.enter()?;
                let inner = self.unary();
                self.leave();
                return Ok(Expr::Await(Box::new(inner?)));
            }
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let inner = self.unary();
        self.leave();
        Ok(Expr::Unary(op, Box::new(inner?)))
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        let mut links = 0;
        loop {
            if matches!(self.peek(), TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot) {
                self.enter()?;
                links += 1;
            }
            match self.peek() {
                TokenKind::LParen => {
                    let Expr::Ident(callee) = expr else {
                        return Err(self.error("only named functions can be called"));
                    };
                    let args = self.arguments()?;
                    expr = Expr::Call { callee, args };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                TokenKind::Dot => {
                    self.advance();
                    if self.eat(&TokenKind::Await) {
                        expr = Expr::Await(Box::new(expr));
                        continue;
                    }
                    let name = self.ident("field or method name")?;
                    if self.check(&TokenKind::LParen) {
                        let args = self.arguments()?;
                        expr = Expr::MethodCall {
                            receiver: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                }
                _ => {
                    self.depth -= links;
                    return Ok(expr);
                }
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RParen) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        let expr = match token.kind {
            TokenKind::Int(v) => Expr::Literal(Literal::Int(v)),
            TokenKind::Float(v) => Expr::Literal(Literal::Float(v)),
            TokenKind::Str(s) => Expr::Literal(Literal::Str(s)),
            TokenKind::True => Expr::Literal(Literal::Bool(true)),
            TokenKind::False => Expr::Literal(Literal::Bool(false)),
            TokenKind::Null => Expr::Literal(Literal::Null),
            TokenKind::Ident(name) => Expr::Ident(name),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                inner
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RBracket) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                Expr::List(items)
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = match self.advance().kind {
                            TokenKind::Str(key) | TokenKind::Ident(key) => key,
                            other => return Err(self.error(format!("expected map key, found {other:?}"))),
                        };
                        self.expect(&TokenKind::Colon, "':'")?;
                        entries.push((key, self.expression()?));
                        if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RBrace) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                Expr::Map(entries)
            }
            other => {
                return Err(ParseError::new(
                    token.line,
                    token.column,
                    format!("unexpected token {other:?}"),
                ))
            }
        };
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_async_main() {
        let program = parse("async fn main() { return 1; }").unwrap();
        let main = program.function("main").unwrap();
        assert!(main.is_async);
        assert!(main.params.is_empty());
        assert_eq!(main.body, vec![Stmt::Return(Some(Expr::Literal(Literal::Int(1))))]);
    }

    #[test]
    fn respects_operator_precedence() {
        let program = parse("fn f() { return 1 + 2 * 3; }").unwrap();
        let Stmt::Return(Some(expr)) = &program.function("f").unwrap().body[0] else {
            panic!("expected return");
        };
        assert_eq!(
            expr,
            &Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Literal(Literal::Int(1))),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Literal(Literal::Int(2))),
                    Box::new(Expr::Literal(Literal::Int(3))),
                )),
            )
        );
    }

    #[test]
    fn parses_method_calls_and_await_forms() {
        let program = parse(
            "fn run(context) { let s = context.summarize_recent(20); await send(s); send(s).await; }",
        )
        .unwrap();
        let body = &program.function("run").unwrap().body;
        assert!(matches!(&body[0], Stmt::Let(name, Expr::MethodCall { method, .. }) if name == "s" && method == "summarize_recent"));
        assert!(matches!(&body[1], Stmt::Expr(Expr::Await(_))));
        assert!(matches!(&body[2], Stmt::Expr(Expr::Await(_))));
    }

    #[test]
    fn parses_else_if_chain_and_map_literal() {
        let program = parse(
            "fn f(x) { if x > 1 { return {\"a\": 1, b: [1, 2,]}; } else if x == 1 { return 0; } else { return -1; } }",
        )
        .unwrap();
        assert!(matches!(
            &program.function("f").unwrap().body[0],
            Stmt::If { else_branch: Some(branch), .. } if matches!(branch[0], Stmt::If { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_functions() {
        let err = parse("fn a() {} fn a() {}").unwrap_err();
        assert!(err.message.contains("defined twice"));
    }

    #[test]
    fn rejects_top_level_statements() {
        assert!(parse("let x = 1;").is_err());
    }

    #[test]
    fn rejects_calls_on_expressions() {
        let err = parse("fn f() { [1](2); }").unwrap_err();
        assert!(err.message.contains("only named functions"));
    }

    #[test]
    fn bounds_nesting_depth() {
        let source = format!("fn f() {{ return {}1{}; }}", "(".repeat(200), ")".repeat(200));
        assert!(parse(&source).unwrap_err().message.contains("nesting too deep"));
    }

    #[test]
    fn long_operator_chain_is_refused() {
        let terms = vec!["1"; 2400].join("+");
        let source = format!("async fn main() {{ return {terms}; }}");
        assert!(source.len() < 5000);
        assert!(parse(&source).unwrap_err().message.contains("nesting too deep"));
    }

    #[test]
    fn long_postfix_chain_is_refused() {
        let source = format!("fn f(x) {{ return x{}; }}", "[0]".repeat(500));
        assert!(parse(&source).unwrap_err().message.contains("nesting too deep"));
    }

    #[test]
    fn long_else_if_chain_is_refused() {
        let source = format!("fn f(x) {{ if x {{ }}{} }}", " else if x { }".repeat(200));
        assert!(parse(&source).unwrap_err().message.contains("nesting too deep"));
    }

    #[test]
    fn moderate_chains_still_parse() {
        let terms = vec!["x"; 40].join(" + ");
        let source = format!("fn f(x) {{ return {terms} * 2 - x.len().len(); }}");
        assert!(parse(&source).is_ok());
    }
}
