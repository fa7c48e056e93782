/*!
 * Parser
 *
 * Recursive descent for statements, precedence climbing for binary
 * operators. Nesting is bounded so hostile input cannot exhaust the native
 * stack of the unit thread.
 */

use super::ast::*;
use super::lexer::{tokenize, Lexeme, SyntaxError, TemplatePart, Token};
use crate::core::limits::MAX_PARSE_DEPTH;
use std::rc::Rc;

type ParseResult<T> = Result<T, SyntaxError>;

/// Parse a complete script
pub fn parse(source: &str) -> ParseResult<Program> {
    let mut parser = Parser::new(tokenize(source, 1)?, 0);
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

const RESERVED: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "export", "extends", "finally", "for", "function", "if", "import", "in",
    "instanceof", "let", "new", "return", "super", "switch", "throw", "try", "typeof", "var",
    "void", "while", "with", "yield", "true", "false", "null",
];

struct Parser {
    tokens: Vec<Lexeme>,
    pos: usize,
    depth: usize,
    /// Set while parsing a `for (` head so `in` is not read as an operator
    no_in: bool,
}

impl Parser {
    fn new(tokens: Vec<Lexeme>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            no_in: false,
        }
    }

    // =========================================================================
    // Token cursor
    // =========================================================================

    fn current(&self) -> &Lexeme {
        // tokenize always ends with Eof and the cursor never passes it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn peek_at(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> u32 {
        self.current().line
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> ParseResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", p)))
        }
    }

    fn is_keyword(&self, k: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if &**name == k)
    }

    fn eat_keyword(&mut self, k: &str) -> bool {
        if self.is_keyword(k) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, k: &str) -> ParseResult<()> {
        if self.eat_keyword(k) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", k)))
        }
    }

    /// Identifier usable as a binding name
    fn binding_ident(&mut self) -> ParseResult<Ident> {
        match self.peek() {
            Token::Ident(name) if !RESERVED.contains(&&**name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    /// Any identifier, keywords included (property names)
    fn property_name(&mut self) -> ParseResult<Ident> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("property name")),
        }
    }

    fn consume_semicolon(&mut self) -> ParseResult<()> {
        if self.eat_punct(";") || self.is_punct("}") || self.at_eof() || self.current().newline_before
        {
            Ok(())
        } else {
            Err(self.unexpected("';'"))
        }
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        SyntaxError::new(
            format!("Unexpected {}, expected {}", describe(self.peek()), expected),
            self.line(),
        )
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_PARSE_DEPTH {
            return Err(SyntaxError::new("Maximum nesting depth exceeded", self.line()));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> ParseResult<Stmt> {
        self.nested(Self::statement_inner)
    }

    fn statement_inner(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Token::Punct("{") => StmtKind::Block(self.block()?),
            Token::Punct(";") => {
                self.pos += 1;
                StmtKind::Empty
            }
            Token::Ident(word) => match &*word {
                "var" | "let" | "const" => {
                    let kind = self.declaration()?;
                    self.consume_semicolon()?;
                    kind
                }
                "function" => {
                    self.pos += 1;
                    let def = self.function_rest(true, line)?;
                    StmtKind::Function(def)
                }
                "if" => self.if_statement()?,
                "while" => {
                    self.pos += 1;
                    let test = self.paren_expression()?;
                    StmtKind::While(test, Box::new(self.statement()?))
                }
                "do" => {
                    self.pos += 1;
                    let body = Box::new(self.statement()?);
                    self.expect_keyword("while")?;
                    let test = self.paren_expression()?;
                    self.eat_punct(";");
                    StmtKind::DoWhile(body, test)
                }
                "for" => self.for_statement()?,
                "return" => {
                    self.pos += 1;
                    let value = if self.is_punct(";")
                        || self.is_punct("}")
                        || self.at_eof()
                        || self.current().newline_before
                    {
                        None
                    } else {
                        Some(self.expression()?)
                    };
                    self.consume_semicolon()?;
                    StmtKind::Return(value)
                }
                "throw" => {
                    self.pos += 1;
                    if self.current().newline_before {
                        return Err(SyntaxError::new("Illegal newline after throw", line));
                    }
                    let value = self.expression()?;
                    self.consume_semicolon()?;
                    StmtKind::Throw(value)
                }
                "break" | "continue" => {
                    self.pos += 1;
                    self.consume_semicolon()?;
                    if &*word == "break" {
                        StmtKind::Break
                    } else {
                        StmtKind::Continue
                    }
                }
                "try" => self.try_statement()?,
                "switch" => self.switch_statement()?,
                "import" if !matches!(self.peek_at(1), Token::Punct("(") | Token::Punct(".")) => {
                    self.import_declaration()?
                }
                "class" | "export" | "with" | "debugger" | "async" | "await" | "yield"
                    if !matches!(self.peek_at(1), Token::Punct("=") | Token::Punct("(")) =>
                {
                    return Err(SyntaxError::new(
                        format!("'{}' is not supported in sandboxed scripts", word),
                        line,
                    ));
                }
                _ => self.expression_statement()?,
            },
            _ => self.expression_statement()?,
        };
        Ok(Stmt { line, kind })
    }

    fn expression_statement(&mut self) -> ParseResult<StmtKind> {
        let expr = self.expression()?;
        self.consume_semicolon()?;
        Ok(StmtKind::Expr(expr))
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            body.push(self.statement()?);
        }
        self.pos += 1;
        Ok(body)
    }

    fn decl_kind(&mut self) -> Option<DeclKind> {
        let kind = match self.peek() {
            Token::Ident(w) if &**w == "var" => DeclKind::Var,
            Token::Ident(w) if &**w == "let" => DeclKind::Let,
            Token::Ident(w) if &**w == "const" => DeclKind::Const,
            _ => return None,
        };
        self.pos += 1;
        Some(kind)
    }

    fn declaration(&mut self) -> ParseResult<StmtKind> {
        let line = self.line();
        let Some(kind) = self.decl_kind() else {
            return Err(self.unexpected("declaration"));
        };
        let first = self.pattern()?;
        self.declarators(kind, first, line)
    }

    fn declarators(&mut self, kind: DeclKind, first: Pattern, line: u32) -> ParseResult<StmtKind> {
        let mut decls = Vec::new();
        let mut target = first;
        loop {
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            if init.is_none() && (kind == DeclKind::Const || !matches!(target, Pattern::Ident(_))) {
                return Err(SyntaxError::new("Missing initializer in declaration", line));
            }
            decls.push(Declarator { target, init });
            if !self.eat_punct(",") {
                break;
            }
            target = self.pattern()?;
        }
        Ok(StmtKind::Decl(kind, decls))
    }

    fn pattern(&mut self) -> ParseResult<Pattern> {
        self.nested(|p| {
            if p.eat_punct("[") {
                let mut items = Vec::new();
                while !p.eat_punct("]") {
                    if p.eat_punct(",") {
                        items.push(None);
                        continue;
                    }
                    items.push(Some(p.pattern()?));
                    if !p.is_punct("]") {
                        p.expect_punct(",")?;
                    }
                }
                Ok(Pattern::Array(items))
            } else if p.eat_punct("{") {
                let mut props = Vec::new();
                while !p.eat_punct("}") {
                    let key = match p.peek().clone() {
                        Token::Str(s) => {
                            p.pos += 1;
                            s
                        }
                        _ => p.property_name()?,
                    };
                    let target = if p.eat_punct(":") {
                        p.pattern()?
                    } else {
                        Pattern::Ident(key.clone())
                    };
                    props.push((key, target));
                    if !p.is_punct("}") {
                        p.expect_punct(",")?;
                    }
                }
                Ok(Pattern::Object(props))
            } else {
                Ok(Pattern::Ident(p.binding_ident()?))
            }
        })
    }

    fn paren_expression(&mut self) -> ParseResult<Expr> {
        self.expect_punct("(")?;
        let expr = self.expression()?;
        self.expect_punct(")")?;
        Ok(expr)
    }

    fn if_statement(&mut self) -> ParseResult<StmtKind> {
        self.pos += 1;
        let test = self.paren_expression()?;
        let consequent = Box::new(self.statement()?);
        let alternate = if self.eat_keyword("else") {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(StmtKind::If(test, consequent, alternate))
    }

    fn for_statement(&mut self) -> ParseResult<StmtKind> {
        let line = self.line();
        self.pos += 1;
        self.expect_punct("(")?;

        let mut init = None;
        if let Some(kind) = self.decl_kind() {
            let target = self.pattern()?;
            if let Some(stmt) = self.for_each_rest(Some(kind), target.clone())? {
                return Ok(stmt);
            }
            self.no_in = true;
            let decl = self.declarators(kind, target, line);
            self.no_in = false;
            init = Some(Box::new(Stmt { line, kind: decl? }));
        } else if !self.is_punct(";") {
            self.no_in = true;
            let expr = self.expression();
            self.no_in = false;
            let expr = expr?;
            if let Expr::Ident(name) = &expr {
                if let Some(stmt) = self.for_each_rest(None, Pattern::Ident(name.clone()))? {
                    return Ok(stmt);
                }
            }
            init = Some(Box::new(Stmt {
                line,
                kind: StmtKind::Expr(expr),
            }));
        }

        self.expect_punct(";")?;
        let test = if self.is_punct(";") { None } else { Some(self.expression()?) };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") { None } else { Some(self.expression()?) };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(StmtKind::For {
            init,
            test,
            update,
            body,
        })
    }

    /// `of expr) body` or `in expr) body` after a for-each head
    fn for_each_rest(
        &mut self,
        decl: Option<DeclKind>,
        target: Pattern,
    ) -> ParseResult<Option<StmtKind>> {
        if self.eat_keyword("of") {
            let iterable = self.assignment()?;
            self.expect_punct(")")?;
            let body = Box::new(self.statement()?);
            Ok(Some(StmtKind::ForOf {
                decl,
                target,
                iterable,
                body,
            }))
        } else if self.eat_keyword("in") {
            let object = self.expression()?;
            self.expect_punct(")")?;
            let body = Box::new(self.statement()?);
            Ok(Some(StmtKind::ForIn {
                decl,
                target,
                object,
                body,
            }))
        } else {
            Ok(None)
        }
    }

    fn try_statement(&mut self) -> ParseResult<StmtKind> {
        self.pos += 1;
        let block = self.block()?;
        let mut param = None;
        let mut handler = None;
        if self.eat_keyword("catch") {
            if self.eat_punct("(") {
                param = Some(self.pattern()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.block()?);
        }
        let finalizer = if self.eat_keyword("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(SyntaxError::new("Missing catch or finally after try", self.line()));
        }
        Ok(StmtKind::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn switch_statement(&mut self) -> ParseResult<StmtKind> {
        self.pos += 1;
        let discriminant = self.paren_expression()?;
        self.expect_punct("{")?;

        let mut cases = Vec::new();
        while !self.eat_punct("}") {
            let test = if self.eat_keyword("case") {
                Some(self.expression()?)
            } else if self.eat_keyword("default") {
                None
            } else {
                return Err(self.unexpected("'case' or 'default'"));
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.is_keyword("case") && !self.is_keyword("default") && !self.is_punct("}") {
                if self.at_eof() {
                    return Err(self.unexpected("'}'"));
                }
                body.push(self.statement()?);
            }
            cases.push(SwitchCase { test, body });
        }

        Ok(StmtKind::Switch {
            discriminant,
            cases,
        })
    }

    /// `import` declarations become `require` bindings so they pass through the gate
    fn import_declaration(&mut self) -> ParseResult<StmtKind> {
        let line = self.line();
        self.pos += 1;

        if let Token::Str(module) = self.peek().clone() {
            self.pos += 1;
            self.consume_semicolon()?;
            return Ok(StmtKind::Expr(require_call(module)));
        }

        let mut decls = Vec::new();
        let mut bindings: Vec<(Ident, Pattern)> = Vec::new();
        let mut default_name = None;
        let mut namespace = None;

        if let Token::Ident(_) = self.peek() {
            default_name = Some(self.binding_ident()?);
            self.eat_punct(",");
        }
        if self.eat_punct("*") {
            self.expect_keyword("as")?;
            namespace = Some(self.binding_ident()?);
        } else if self.eat_punct("{") {
            while !self.eat_punct("}") {
                let imported = self.property_name()?;
                let local = if self.eat_keyword("as") {
                    self.binding_ident()?
                } else {
                    imported.clone()
                };
                bindings.push((imported, Pattern::Ident(local)));
                if !self.is_punct("}") {
                    self.expect_punct(",")?;
                }
            }
        }

        self.expect_keyword("from")?;
        let Token::Str(module) = self.advance() else {
            return Err(SyntaxError::new("Expected module specifier string", line));
        };
        self.consume_semicolon()?;

        for name in default_name.into_iter().chain(namespace) {
            decls.push(Declarator {
                target: Pattern::Ident(name),
                init: Some(require_call(module.clone())),
            });
        }
        if !bindings.is_empty() {
            decls.push(Declarator {
                target: Pattern::Object(bindings),
                init: Some(require_call(module)),
            });
        }
        Ok(StmtKind::Decl(DeclKind::Const, decls))
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Parses after the `function` keyword
    fn function_rest(&mut self, require_name: bool, line: u32) -> ParseResult<Rc<FunctionDef>> {
        let name = if let Token::Ident(_) = self.peek() {
            Some(self.binding_ident()?)
        } else if require_name {
            return Err(self.unexpected("function name"));
        } else {
            None
        };
        self.expect_punct("(")?;
        let (params, rest) = self.params()?;
        let body = FunctionBody::Block(self.block()?);
        Ok(Rc::new(FunctionDef {
            name,
            params,
            rest,
            body,
            is_arrow: false,
            line,
        }))
    }

    /// Parameter list after `(`, consuming the closing `)`
    fn params(&mut self) -> ParseResult<(Vec<Param>, Option<Ident>)> {
        let mut params = Vec::new();
        let mut rest = None;
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                rest = Some(self.binding_ident()?);
                self.expect_punct(")")?;
                break;
            }
            let target = self.pattern()?;
            let default = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            params.push(Param { target, default });
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok((params, rest))
    }

    fn is_arrow_ahead(&self) -> bool {
        match self.peek() {
            Token::Ident(name) if !RESERVED.contains(&&**name) => {
                matches!(self.peek_at(1), Token::Punct("=>"))
            }
            Token::Punct("(") => {
                let mut depth = 0usize;
                let mut i = self.pos;
                while i < self.tokens.len() {
                    match &self.tokens[i].token {
                        Token::Punct("(") | Token::Punct("[") | Token::Punct("{") => depth += 1,
                        Token::Punct(")") | Token::Punct("]") | Token::Punct("}") => {
                            depth = depth.saturating_sub(1);
                            if depth == 0 {
                                return matches!(
                                    self.tokens.get(i + 1).map(|l| &l.token),
                                    Some(Token::Punct("=>"))
                                );
                            }
                        }
                        Token::Eof => return false,
                        _ => {}
                    }
                    i += 1;
                }
                false
            }
            _ => false,
        }
    }

    fn arrow_function(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let (params, rest) = if self.eat_punct("(") {
            self.params()?
        } else {
            let name = self.binding_ident()?;
            (
                vec![Param {
                    target: Pattern::Ident(name),
                    default: None,
                }],
                None,
            )
        };
        if self.current().newline_before {
            return Err(SyntaxError::new("Illegal newline before '=>'", self.line()));
        }
        self.expect_punct("=>")?;
        let saved = std::mem::replace(&mut self.no_in, false);
        let body = if self.is_punct("{") {
            self.block().map(FunctionBody::Block)
        } else {
            self.assignment().map(|e| FunctionBody::Expr(Box::new(e)))
        };
        self.no_in = saved;
        Ok(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            rest,
            body: body?,
            is_arrow: true,
            line,
        })))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) -> ParseResult<Expr> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn assignment(&mut self) -> ParseResult<Expr> {
        self.nested(|p| {
            if p.is_arrow_ahead() {
                return p.arrow_function();
            }
            let target = p.conditional()?;
            let op = match p.peek() {
                Token::Punct(op) => assign_op(op),
                _ => None,
            };
            let Some(op) = op else {
                return Ok(target);
            };
            if !matches!(target, Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }) {
                return Err(SyntaxError::new("Invalid assignment target", p.line()));
            }
            p.pos += 1;
            let value = p.assignment()?;
            Ok(Expr::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            })
        })
    }

    fn conditional(&mut self) -> ParseResult<Expr> {
        let test = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let saved = std::mem::replace(&mut self.no_in, false);
        let consequent = self.assignment();
        self.no_in = saved;
        let consequent = consequent?;
        self.expect_punct(":")?;
        let alternate = self.assignment()?;
        Ok(Expr::Conditional(
            Box::new(test),
            Box::new(consequent),
            Box::new(alternate),
        ))
    }

    fn binary_op(&self) -> Option<(Operator, u8)> {
        let op = match self.peek() {
            Token::Punct(p) => *p,
            Token::Ident(w) if &**w == "instanceof" => "instanceof",
            Token::Ident(w) if &**w == "in" && !self.no_in => "in",
            _ => return None,
        };
        binary_precedence(op)
    }

    fn binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            // `**` is right-associative
            let next_min = if matches!(op, Operator::Binary(BinaryOp::Exp)) {
                prec
            } else {
                prec + 1
            };
            let right = self.nested(|p| p.binary(next_min))?;
            left = match op {
                Operator::Binary(op) => Expr::Binary(op, Box::new(left), Box::new(right)),
                Operator::Logical(op) => Expr::Logical(op, Box::new(left), Box::new(right)),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Token::Punct("!") => Some(UnaryOp::Not),
            Token::Punct("-") => Some(UnaryOp::Neg),
            Token::Punct("+") => Some(UnaryOp::Plus),
            Token::Punct("~") => Some(UnaryOp::BitNot),
            Token::Ident(w) if &**w == "typeof" => Some(UnaryOp::Typeof),
            Token::Ident(w) if &**w == "void" => Some(UnaryOp::Void),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        if self.eat_keyword("delete") {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Delete(Box::new(operand)));
        }
        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.pos += 1;
            let target = self.nested(Self::unary)?;
            check_update_target(&target, self.line())?;
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let expr = self.call_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.current().newline_before {
            let increment = self.is_punct("++");
            self.pos += 1;
            check_update_target(&expr, self.line())?;
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> ParseResult<Expr> {
        let mut expr = if self.eat_keyword("new") {
            let callee = self.nested(Self::member_only)?;
            let args = if self.eat_punct("(") { self.arguments()? } else { Vec::new() };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.primary()?
        };

        loop {
            if self.eat_punct(".") {
                let property = self.property_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                if self.eat_punct("(") {
                    let args = self.arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    };
                } else if self.eat_punct("[") {
                    let index = self.expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: true,
                    };
                } else {
                    let property = self.property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                        optional: true,
                    };
                }
            } else if self.eat_punct("[") {
                let saved = std::mem::replace(&mut self.no_in, false);
                let index = self.expression();
                self.no_in = saved;
                let index = index?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    optional: false,
                };
            } else if self.is_punct("(") {
                self.pos += 1;
                let args = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Callee of `new`: member accesses without calls
    fn member_only(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") {
                let property = self.property_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                    optional: false,
                };
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    optional: false,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Argument list after `(`, consuming the closing `)`
    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let saved = std::mem::replace(&mut self.no_in, false);
        let result = self.comma_list(")");
        self.no_in = saved;
        result
    }

    /// Elements up to `close`, with spread support
    fn comma_list(&mut self, close: &str) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.eat_punct(close) {
            if self.eat_punct("...") {
                items.push(Expr::Spread(Box::new(self.assignment()?)));
            } else {
                items.push(self.assignment()?);
            }
            if !self.is_punct(close) {
                self.expect_punct(",")?;
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        self.nested(Self::primary_inner)
    }

    fn primary_inner(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Template(parts) => self.template(parts),
            Token::Punct("(") => {
                let saved = std::mem::replace(&mut self.no_in, false);
                let expr = self.expression();
                self.no_in = saved;
                let expr = expr?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                let saved = std::mem::replace(&mut self.no_in, false);
                let items = self.array_items();
                self.no_in = saved;
                Ok(Expr::Array(items?))
            }
            Token::Punct("{") => {
                let saved = std::mem::replace(&mut self.no_in, false);
                let props = self.object_props();
                self.no_in = saved;
                Ok(Expr::Object(props?))
            }
            Token::Ident(word) => match &*word {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "undefined" => Ok(Expr::Undefined),
                "this" => Ok(Expr::Ident(word)),
                "function" => Ok(Expr::Function(self.function_rest(false, line)?)),
                // Dynamic import resolves through the same gate as require
                "import" if self.is_punct("(") => Ok(Expr::Ident(Rc::from("require"))),
                w if RESERVED.contains(&w) => Err(SyntaxError::new(
                    format!("Unexpected keyword '{}'", w),
                    line,
                )),
                _ => Ok(Expr::Ident(word)),
            },
            other => Err(SyntaxError::new(
                format!("Unexpected {}", describe(&other)),
                line,
            )),
        }
    }

    fn array_items(&mut self) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.eat_punct("]") {
                return Ok(items);
            }
            if self.eat_punct(",") {
                items.push(Expr::Undefined);
                continue;
            }
            if self.eat_punct("...") {
                items.push(Expr::Spread(Box::new(self.assignment()?)));
            } else {
                items.push(self.assignment()?);
            }
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
    }

    fn object_props(&mut self) -> ParseResult<Vec<Prop>> {
        let mut props = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                props.push(Prop::Spread(self.assignment()?));
            } else {
                let line = self.line();
                let key = match self.advance() {
                    Token::Ident(name) => PropKey::Static(name),
                    Token::Str(s) => PropKey::Static(s),
                    Token::Number(n) => PropKey::Static(Rc::from(number_key(n))),
                    Token::Punct("[") => {
                        let expr = self.assignment()?;
                        self.expect_punct("]")?;
                        PropKey::Computed(expr)
                    }
                    other => {
                        return Err(SyntaxError::new(
                            format!("Unexpected {} in object literal", describe(&other)),
                            line,
                        ))
                    }
                };

                if self.eat_punct(":") {
                    props.push(Prop::Init(key, self.assignment()?));
                } else if self.eat_punct("(") {
                    // Method shorthand
                    let (params, rest) = self.params()?;
                    let body = FunctionBody::Block(self.block()?);
                    let name = match &key {
                        PropKey::Static(name) => Some(name.clone()),
                        PropKey::Computed(_) => None,
                    };
                    let def = FunctionDef {
                        name,
                        params,
                        rest,
                        body,
                        is_arrow: false,
                        line,
                    };
                    props.push(Prop::Init(key, Expr::Function(Rc::new(def))));
                } else {
                    let PropKey::Static(name) = &key else {
                        return Err(self.unexpected("':'"));
                    };
                    props.push(Prop::Init(key.clone(), Expr::Ident(name.clone())));
                }
            }
            if !self.is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        Ok(props)
    }

    fn template(&mut self, parts: Vec<TemplatePart>) -> ParseResult<Expr> {
        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                TemplatePart::Text(text) => segments.push(TemplateSegment::Text(text)),
                TemplatePart::Expr { source, line } => {
                    let mut sub = Parser::new(tokenize(&source, line)?, self.depth + 1);
                    let expr = sub.expression()?;
                    if !sub.at_eof() {
                        return Err(sub.unexpected("'}'"));
                    }
                    segments.push(TemplateSegment::Expr(expr));
                }
            }
        }
        Ok(Expr::Template(segments))
    }
}

#[derive(Debug, Clone, Copy)]
enum Operator {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn binary_precedence(op: &str) -> Option<(Operator, u8)> {
    use BinaryOp::*;
    let entry = match op {
        "??" => (Operator::Logical(LogicalOp::Nullish), 1),
        "||" => (Operator::Logical(LogicalOp::Or), 2),
        "&&" => (Operator::Logical(LogicalOp::And), 3),
        "|" => (Operator::Binary(BitOr), 4),
        "^" => (Operator::Binary(BitXor), 5),
        "&" => (Operator::Binary(BitAnd), 6),
        "==" => (Operator::Binary(Eq), 7),
        "!=" => (Operator::Binary(NotEq), 7),
        "===" => (Operator::Binary(StrictEq), 7),
        "!==" => (Operator::Binary(StrictNotEq), 7),
        "<" => (Operator::Binary(Lt), 8),
        ">" => (Operator::Binary(Gt), 8),
        "<=" => (Operator::Binary(LtEq), 8),
        ">=" => (Operator::Binary(GtEq), 8),
        "instanceof" => (Operator::Binary(InstanceOf), 8),
        "in" => (Operator::Binary(In), 8),
        "<<" => (Operator::Binary(Shl), 9),
        ">>" => (Operator::Binary(Shr), 9),
        ">>>" => (Operator::Binary(UShr), 9),
        "+" => (Operator::Binary(Add), 10),
        "-" => (Operator::Binary(Sub), 10),
        "*" => (Operator::Binary(Mul), 11),
        "/" => (Operator::Binary(Div), 11),
        "%" => (Operator::Binary(Mod), 11),
        "**" => (Operator::Binary(Exp), 12),
        _ => return None,
    };
    Some(entry)
}

fn assign_op(op: &str) -> Option<AssignOp> {
    use BinaryOp::*;
    Some(match op {
        "=" => AssignOp::Assign,
        "+=" => AssignOp::Compound(Add),
        "-=" => AssignOp::Compound(Sub),
        "*=" => AssignOp::Compound(Mul),
        "/=" => AssignOp::Compound(Div),
        "%=" => AssignOp::Compound(Mod),
        "**=" => AssignOp::Compound(Exp),
        "&=" => AssignOp::Compound(BitAnd),
        "|=" => AssignOp::Compound(BitOr),
        "^=" => AssignOp::Compound(BitXor),
        "<<=" => AssignOp::Compound(Shl),
        ">>=" => AssignOp::Compound(Shr),
        ">>>=" => AssignOp::Compound(UShr),
        "&&=" => AssignOp::Logical(LogicalOp::And),
        "||=" => AssignOp::Logical(LogicalOp::Or),
        "??=" => AssignOp::Logical(LogicalOp::Nullish),
        _ => return None,
    })
}

fn check_update_target(target: &Expr, line: u32) -> ParseResult<()> {
    match target {
        Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. } => Ok(()),
        _ => Err(SyntaxError::new(
            "Invalid left-hand side expression in update operation",
            line,
        )),
    }
}

fn require_call(module: Rc<str>) -> Expr {
    Expr::Call {
        callee: Box::new(Expr::Ident(Rc::from("require"))),
        args: vec![Expr::Str(module)],
        optional: false,
    }
}

fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {}", n),
        Token::Str(_) => "string".to_string(),
        Token::Template(_) => "template literal".to_string(),
        Token::Ident(name) => format!("token '{}'", name),
        Token::Punct(p) => format!("token '{}'", p),
        Token::Eof => "end of input".to_string(),
    }
}
