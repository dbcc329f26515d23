//! Recursive-descent parser.
//!
//! Grammar is deliberately small: functions, let/assign, if/while/for,
//! return/break/continue, and expressions over null/bool/int/float/
//! string/list/map values. Field access `a.b` is sugar for `a["b"]`.

use crate::ast::{AssignTarget, BinOp, Expr, FnDef, Program, Stmt, UnaryOp};
use crate::lexer::{tokenize, Spanned, Token};

pub fn parse(source: &str) -> Result<Program, String> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|s| s.line)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(format!(
                "line {}: expected {:?}, found {}",
                self.line(),
                expected,
                self.peek()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "end of input".to_string())
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(format!(
                "line {}: expected {what}, found {:?}",
                self.line(),
                other
            )),
        }
    }

    fn program(&mut self) -> Result<Program, String> {
        let mut program = Program::default();
        while self.peek().is_some() {
            if self.eat(&Token::Fn) {
                let def = self.fn_def()?;
                program.functions.insert(def.name.clone(), def);
            } else {
                program.top_level.push(self.statement()?);
            }
        }
        Ok(program)
    }

    fn fn_def(&mut self) -> Result<FnDef, String> {
        let name = self.expect_ident("function name")?;
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }
        let body = self.block()?;
        Ok(FnDef { name, params, body })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, String> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.peek().is_none() {
                return Err("unexpected end of input in block".to_string());
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        match self.peek() {
            Some(Token::Let) => {
                self.pos += 1;
                let name = self.expect_ident("variable name")?;
                self.expect(Token::Assign)?;
                let value = self.expression()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Let(name, value))
            }
            Some(Token::If) => {
                self.pos += 1;
                self.if_statement()
            }
            Some(Token::While) => {
                self.pos += 1;
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While(cond, body))
            }
            Some(Token::For) => {
                self.pos += 1;
                let var = self.expect_ident("loop variable")?;
                self.expect(Token::In)?;
                let iterable = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For(var, iterable, body))
            }
            Some(Token::Return) => {
                self.pos += 1;
                if self.eat(&Token::Semi) {
                    Ok(Stmt::Return(None))
                } else {
                    let value = self.expression()?;
                    self.expect(Token::Semi)?;
                    Ok(Stmt::Return(Some(value)))
                }
            }
            Some(Token::Break) => {
                self.pos += 1;
                self.expect(Token::Semi)?;
                Ok(Stmt::Break)
            }
            Some(Token::Continue) => {
                self.pos += 1;
                self.expect(Token::Semi)?;
                Ok(Stmt::Continue)
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Token::Assign) {
                    let value = self.expression()?;
                    self.expect(Token::Semi)?;
                    let target = match expr {
                        Expr::Var(name) => AssignTarget::Name(name),
                        Expr::Index(container, key) => AssignTarget::Index(*container, *key),
                        _ => {
                            return Err(format!(
                                "line {}: invalid assignment target",
                                self.line()
                            ))
                        }
                    };
                    Ok(Stmt::Assign(target, value))
                } else {
                    self.expect(Token::Semi)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, String> {
        let mut arms = Vec::new();
        let cond = self.expression()?;
        let body = self.block()?;
        arms.push((cond, body));
        let mut else_body = None;
        while self.eat(&Token::Else) {
            if self.eat(&Token::If) {
                let cond = self.expression()?;
                let body = self.block()?;
                arms.push((cond, body));
            } else {
                else_body = Some(self.block()?);
                break;
            }
        }
        Ok(Stmt::If(arms, else_body))
    }

    fn expression(&mut self) -> Result<Expr, String> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::LtEq) => BinOp::LtEq,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::GtEq) => BinOp::GtEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        if self.eat(&Token::Bang) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::LBracket) {
                let key = self.expression()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else if self.eat(&Token::Dot) {
                let field = self.expect_ident("field name")?;
                expr = Expr::Index(Box::new(expr), Box::new(Expr::Str(field)));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let line = self.line();
        match self.advance() {
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = self.expression()?;
                        self.expect(Token::Colon)?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Map(entries))
            }
            other => Err(format!(
                "line {line}: unexpected {}",
                other
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "end of input".to_string())
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_small_function() {
        let program = parse(
            "fn run(n) { let total = 0; for x in range(n) { total = total + x; } return total; }",
        )
        .unwrap();
        assert!(program.defines("run"));
        assert_eq!(program.functions["run"].params, vec!["n"]);
    }

    #[test]
    fn field_access_desugars_to_index() {
        let program = parse("fn run() { return result.success; }").unwrap();
        let body = &program.functions["run"].body;
        match &body[0] {
            Stmt::Return(Some(Expr::Index(_, key))) => match key.as_ref() {
                Expr::Str(s) => assert_eq!(s, "success"),
                other => panic!("unexpected key {other:?}"),
            },
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn reports_line_numbers_on_errors() {
        let err = parse("fn run() {\n let x = ;\n}").unwrap_err();
        assert!(err.contains("line 2"), "{err}");
    }

    #[test]
    fn else_if_chains_parse() {
        let program =
            parse("fn run(x) { if x > 2 { return 2; } else if x > 1 { return 1; } else { return 0; } }")
                .unwrap();
        match &program.functions["run"].body[0] {
            Stmt::If(arms, else_body) => {
                assert_eq!(arms.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("unexpected stmt {other:?}"),
        }
    }
}
