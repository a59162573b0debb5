use super::ast::*;
use super::lexer::{tokenize, Spanned, Token};
use crate::error::SyntaxError;

/// Nesting limit for blocks, parenthesised expressions and operator chains.
/// Every folded operator or postfix step counts as one level.
const MAX_NESTING: usize = 128;

pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, expected: &str) -> SyntaxError {
        SyntaxError::new(
            self.line(),
            format!("expected {}, found {}", expected, self.peek().describe()),
        )
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<(), SyntaxError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    fn ident(&mut self, expected: &str) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(expected)),
        }
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(SyntaxError::new(self.line(), "nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn leave_by(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn program(mut self) -> Result<Program, SyntaxError> {
        let mut items = Vec::new();
        while !self.check(&Token::Eof) {
            let item = match self.peek() {
                Token::Import => Item::Import(self.import()?),
                Token::From => Item::Import(self.from_import()?),
                Token::Class => Item::Class(self.class_def()?),
                Token::Fn => Item::Function(self.function()?),
                Token::Let => {
                    let line = self.line();
                    self.advance();
                    let name = self.ident("constant name")?;
                    self.expect(Token::Assign, "'='")?;
                    let value = self.expression()?;
                    self.expect(Token::Semicolon, "';'")?;
                    Item::Let { name, value, line }
                }
                _ => return Err(self.error("'import', 'from', 'class', 'fn' or 'let' at top level")),
            };
            items.push(item);
        }
        Ok(Program { items })
    }

    fn dotted_path(&mut self) -> Result<String, SyntaxError> {
        let mut path = self.ident("module name")?;
        while self.eat(&Token::Dot) {
            path.push('.');
            path.push_str(&self.ident("module name")?);
        }
        Ok(path)
    }

    fn import(&mut self) -> Result<Import, SyntaxError> {
        let line = self.line();
        self.expect(Token::Import, "'import'")?;
        let module = self.dotted_path()?;
        let alias = if self.eat(&Token::As) {
            Some(self.ident("alias")?)
        } else {
            None
        };
        self.expect(Token::Semicolon, "';'")?;
        Ok(Import {
            module,
            alias,
            names: Vec::new(),
            line,
        })
    }

    fn from_import(&mut self) -> Result<Import, SyntaxError> {
        let line = self.line();
        self.expect(Token::From, "'from'")?;
        let module = self.dotted_path()?;
        self.expect(Token::Import, "'import'")?;
        let mut names = vec![self.ident("imported name")?];
        while self.eat(&Token::Comma) {
            names.push(self.ident("imported name")?);
        }
        self.expect(Token::Semicolon, "';'")?;
        Ok(Import {
            module,
            alias: None,
            names,
            line,
        })
    }

    fn class_def(&mut self) -> Result<ClassDef, SyntaxError> {
        let line = self.line();
        self.expect(Token::Class, "'class'")?;
        let name = self.ident("class name")?;
        self.expect(Token::LBrace, "'{'")?;
        let mut methods = Vec::new();
        while !self.eat(&Token::RBrace) {
            if !self.check(&Token::Fn) {
                return Err(self.error("'fn' or '}' in class body"));
            }
            methods.push(self.function()?);
        }
        Ok(ClassDef {
            name,
            methods,
            line,
        })
    }

    fn function(&mut self) -> Result<FunctionDef, SyntaxError> {
        let line = self.line();
        self.expect(Token::Fn, "'fn'")?;
        let name = self.ident("function name")?;
        self.expect(Token::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.eat(&Token::RParen) {
            let param = self.ident("parameter name")?;
            if params.contains(&param) {
                return Err(SyntaxError::new(
                    self.line(),
                    format!("duplicate parameter '{}'", param),
                ));
            }
            params.push(param);
            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            body,
            line,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect(Token::LBrace, "'{'")?;
        self.enter()?;
        let mut body = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.error("'}'"));
            }
            body.push(self.statement()?);
        }
        self.leave();
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        let kind = match self.peek() {
            Token::Let => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(Token::Assign, "'='")?;
                let value = self.expression()?;
                self.expect(Token::Semicolon, "';'")?;
                StmtKind::Let { name, value }
            }
            Token::If => self.if_stmt()?,
            Token::While => {
                self.advance();
                let condition = self.expression()?;
                let body = self.block()?;
                StmtKind::While { condition, body }
            }
            Token::For => {
                self.advance();
                let mut vars = vec![self.ident("loop variable")?];
                while self.eat(&Token::Comma) {
                    vars.push(self.ident("loop variable")?);
                }
                self.expect(Token::In, "'in'")?;
                let iter = self.expression()?;
                let body = self.block()?;
                StmtKind::For { vars, iter, body }
            }
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(Token::Semicolon, "';'")?;
                StmtKind::Return(value)
            }
            Token::Break => {
                self.advance();
                self.expect(Token::Semicolon, "';'")?;
                StmtKind::Break
            }
            Token::Continue => {
                self.advance();
                self.expect(Token::Semicolon, "';'")?;
                StmtKind::Continue
            }
            _ => {
                let expr = self.expression()?;
                let op = match self.peek() {
                    Token::Assign => Some(None),
                    Token::PlusAssign => Some(Some(BinaryOp::Add)),
                    Token::MinusAssign => Some(Some(BinaryOp::Sub)),
                    Token::StarAssign => Some(Some(BinaryOp::Mul)),
                    Token::SlashAssign => Some(Some(BinaryOp::Div)),
                    _ => None,
                };
                match op {
                    Some(op) => {
                        if !matches!(
                            expr.kind,
                            ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Index { .. }
                        ) {
                            return Err(SyntaxError::new(line, "invalid assignment target"));
                        }
                        self.advance();
                        let value = self.expression()?;
                        self.expect(Token::Semicolon, "';'")?;
                        StmtKind::Assign {
                            target: expr,
                            op,
                            value,
                        }
                    }
                    None => {
                        self.expect(Token::Semicolon, "';'")?;
                        StmtKind::Expr(expr)
                    }
                }
            }
        };
        Ok(Stmt { kind, line })
    }

    fn if_stmt(&mut self) -> Result<StmtKind, SyntaxError> {
        self.expect(Token::If, "'if'")?;
        let condition = self.expression()?;
        let body = self.block()?;
        let mut branches = vec![(condition, body)];
        let mut otherwise = None;
        while self.eat(&Token::Else) {
            if self.eat(&Token::If) {
                let condition = self.expression()?;
                let body = self.block()?;
                branches.push((condition, body));
            } else {
                otherwise = Some(self.block()?);
                break;
            }
        }
        Ok(StmtKind::If {
            branches,
            otherwise,
        })
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        self.enter()?;
        let expr = self.or_expr();
        self.leave();
        expr
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.and_expr()?;
        let mut folded = 0;
        while self.check(&Token::Or) {
            let line = self.line();
            self.advance();
            self.enter()?;
            folded += 1;
            let rhs = self.and_expr()?;
            lhs = Expr {
                kind: ExprKind::Logical {
                    op: LogicalOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
        self.leave_by(folded);
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.not_expr()?;
        let mut folded = 0;
        while self.check(&Token::And) {
            let line = self.line();
            self.advance();
            self.enter()?;
            folded += 1;
            let rhs = self.not_expr()?;
            lhs = Expr {
                kind: ExprKind::Logical {
                    op: LogicalOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
        self.leave_by(folded);
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&Token::Not) {
            let line = self.line();
            self.advance();
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand?),
                },
                line,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.additive()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                Token::Lt => BinaryOp::Lt,
                Token::LtEq => BinaryOp::LtEq,
                Token::Gt => BinaryOp::Gt,
                Token::GtEq => BinaryOp::GtEq,
                Token::In => BinaryOp::In,
                _ => {
                    self.leave_by(folded);
                    return Ok(lhs);
                }
            };
            let line = self.line();
            self.advance();
            self.enter()?;
            folded += 1;
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.multiplicative()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => {
                    self.leave_by(folded);
                    return Ok(lhs);
                }
            };
            let line = self.line();
            self.advance();
            self.enter()?;
            folded += 1;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.unary()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => {
                    self.leave_by(folded);
                    return Ok(lhs);
                }
            };
            let line = self.line();
            self.advance();
            self.enter()?;
            folded += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&Token::Minus) {
            let line = self.line();
            self.advance();
            self.enter()?;
            let operand = self.unary();
            self.leave();
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand?),
                },
                line,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        let mut folded = 0;
        loop {
            let line = self.line();
            if matches!(self.peek(), Token::LParen | Token::Dot | Token::LBracket) {
                self.enter()?;
                folded += 1;
            }
            match self.peek() {
                Token::LParen => {
                    self.advance();
                    let args = self.arguments()?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        line,
                    };
                }
                Token::Dot => {
                    self.advance();
                    let name = self.ident("attribute name")?;
                    expr = Expr {
                        kind: ExprKind::Attribute {
                            object: Box::new(expr),
                            name,
                        },
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    };
                }
                _ => {
                    self.leave_by(folded);
                    return Ok(expr);
                }
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Arg>, SyntaxError> {
        let mut args: Vec<Arg> = Vec::new();
        while !self.eat(&Token::RParen) {
            let named = matches!(self.peek(), Token::Ident(_)) && self.peek_at(1) == &Token::Colon;
            let arg = if named {
                let name = self.ident("argument name")?;
                self.advance();
                if args.iter().any(|a| a.name.as_deref() == Some(name.as_str())) {
                    return Err(SyntaxError::new(
                        self.line(),
                        format!("keyword argument '{}' repeated", name),
                    ));
                }
                Arg {
                    name: Some(name),
                    value: self.expression()?,
                }
            } else {
                if args.iter().any(|a| a.name.is_some()) {
                    return Err(SyntaxError::new(
                        self.line(),
                        "positional argument follows keyword argument",
                    ));
                }
                Arg {
                    name: None,
                    value: self.expression()?,
                }
            };
            args.push(arg);
            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Token::Int(v) => {
                self.advance();
                ExprKind::Literal(Literal::Int(v))
            }
            Token::Float(v) => {
                self.advance();
                ExprKind::Literal(Literal::Float(v))
            }
            Token::Str(s) => {
                self.advance();
                ExprKind::Literal(Literal::Str(s))
            }
            Token::True => {
                self.advance();
                ExprKind::Literal(Literal::Bool(true))
            }
            Token::False => {
                self.advance();
                ExprKind::Literal(Literal::Bool(false))
            }
            Token::None => {
                self.advance();
                ExprKind::Literal(Literal::None)
            }
            Token::Ident(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Token::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBracket, "',' or ']'")?;
                        break;
                    }
                }
                ExprKind::List(items)
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.eat(&Token::RBrace) {
                    let key = self.expression()?;
                    self.expect(Token::Colon, "':'")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBrace, "',' or '}'")?;
                        break;
                    }
                }
                ExprKind::Dict(entries)
            }
            _ => return Err(self.error("expression")),
        };
        Ok(Expr { kind, line })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, line: usize) -> Expr {
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        line,
    }
}
