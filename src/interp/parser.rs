//! Recursive-descent parser from tokens to [`Stmt`] trees.

use super::ast::{
    BinOp, CmpOp, Expr, FPiece, Literal, Param, Stmt, StmtKind, Subscript, Target, UnaryOp,
};
use super::error::{EvalError, EvalResult};
use super::lexer::{tokenize, FPart, Tok, Token};

/// Maximum nesting of expressions and blocks.
pub const MAX_NESTING: usize = 100;

/// Parses a whole snippet into a list of statements.
pub fn parse(src: &str) -> EvalResult<Vec<Stmt>> {
    let lexed = tokenize(src)?;
    Parser::new(lexed.tokens).program()
}

/// Parses a standalone expression (the inside of an f-string field).
fn parse_expression(src: &str, line: usize) -> EvalResult<Expr> {
    let relocate = |mut e: EvalError| {
        e.line = Some(line);
        e
    };
    let lexed = tokenize(src).map_err(relocate)?;
    let mut parser = Parser::new(lexed.tokens);
    let expr = parser.expression().map_err(relocate)?;
    parser.eat(&Tok::Newline);
    if !parser.check(&Tok::Eof) {
        return Err(EvalError::syntax("f-string: invalid expression", line));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

const AUG_OPS: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    // ── Token helpers ───────────────────────────────────

    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> EvalResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{op}'")))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Kw(k) if *k == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> EvalResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{kw}'")))
        }
    }

    fn expect_name(&mut self) -> EvalResult<String> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn expect_newline(&mut self) -> EvalResult<()> {
        if self.eat(&Tok::Newline) || self.check(&Tok::Eof) {
            Ok(())
        } else {
            Err(self.unexpected("invalid syntax"))
        }
    }

    fn unexpected(&self, context: &str) -> EvalError {
        let found = match self.peek() {
            Tok::Name(n) => format!("name '{n}'"),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(f) => format!("number {f}"),
            Tok::Str(_) | Tok::FStr(_) => "string".to_string(),
            Tok::Kw(k) => format!("'{k}'"),
            Tok::Op(o) => format!("'{o}'"),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        EvalError::syntax(format!("{context}, found {found}"), self.line())
    }

    fn enter(&mut self) -> EvalResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(EvalError::syntax(
                "too many nested expressions or blocks",
                self.line(),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }

    // ── Statements ──────────────────────────────────────

    fn program(&mut self) -> EvalResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.check(&Tok::Eof) {
            if self.eat(&Tok::Newline) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> EvalResult<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Kw("if") => self.if_stmt()?,
            Tok::Kw("while") => {
                self.advance();
                let cond = self.expression()?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            Tok::Kw("for") => {
                self.advance();
                let target = self.target_list()?;
                self.expect_kw("in")?;
                let iter = self.expr_list()?;
                let body = self.block()?;
                StmtKind::For { target, iter, body }
            }
            Tok::Kw("def") => self.def_stmt()?,
            Tok::Kw("with") => {
                self.advance();
                let expr = self.expression()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                let body = self.block()?;
                StmtKind::With { expr, name, body }
            }
            Tok::Indent => return Err(EvalError::syntax("unexpected indent", line)),
            _ => {
                let kind = self.simple_stmt()?;
                self.expect_newline()?;
                kind
            }
        };
        Ok(Stmt { kind, line })
    }

    fn simple_stmt(&mut self) -> EvalResult<StmtKind> {
        match self.peek() {
            Tok::Kw("pass") => {
                self.advance();
                Ok(StmtKind::Pass)
            }
            Tok::Kw("break") => {
                self.advance();
                Ok(StmtKind::Break)
            }
            Tok::Kw("continue") => {
                self.advance();
                Ok(StmtKind::Continue)
            }
            Tok::Kw("return") => {
                self.advance();
                if self.at_statement_end() {
                    Ok(StmtKind::Return(None))
                } else {
                    Ok(StmtKind::Return(Some(self.expr_list()?)))
                }
            }
            Tok::Kw("raise") => {
                self.advance();
                if self.at_statement_end() {
                    Ok(StmtKind::Raise(None))
                } else {
                    Ok(StmtKind::Raise(Some(self.expression()?)))
                }
            }
            Tok::Kw("import") => {
                self.advance();
                let mut modules = Vec::new();
                loop {
                    let module = self.dotted_name()?;
                    let binding = if self.eat_kw("as") {
                        self.expect_name()?
                    } else {
                        module.clone()
                    };
                    modules.push((module, binding));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                Ok(StmtKind::Import(modules))
            }
            Tok::Kw("from") => {
                self.advance();
                let module = self.dotted_name()?;
                self.expect_kw("import")?;
                let parens = self.eat_op("(");
                let mut names = Vec::new();
                loop {
                    let name = self.expect_name()?;
                    let binding = if self.eat_kw("as") {
                        self.expect_name()?
                    } else {
                        name.clone()
                    };
                    names.push((name, binding));
                    if !self.eat_op(",") || (parens && self.check_op(")")) {
                        break;
                    }
                }
                if parens {
                    self.expect_op(")")?;
                }
                Ok(StmtKind::ImportFrom { module, names })
            }
            _ => self.expr_or_assign(),
        }
    }

    fn dotted_name(&mut self) -> EvalResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof)
    }

    fn expr_or_assign(&mut self) -> EvalResult<StmtKind> {
        let first = self.expr_list()?;

        if self.check_op("=") {
            let mut targets = vec![to_target(first, self.line())?];
            self.advance();
            let mut value = self.expr_list()?;
            while self.eat_op("=") {
                targets.push(to_target(value, self.line())?);
                value = self.expr_list()?;
            }
            return Ok(StmtKind::Assign(targets, value));
        }

        if let Tok::Op(op) = self.peek() {
            if let Some(&(_, bin)) = AUG_OPS.iter().find(|(sym, _)| sym == op) {
                let line = self.line();
                let target = match to_target(first, line)? {
                    Target::Tuple(_) => {
                        return Err(EvalError::syntax(
                            "illegal expression for augmented assignment",
                            line,
                        ))
                    }
                    t => t,
                };
                self.advance();
                let value = self.expr_list()?;
                return Ok(StmtKind::AugAssign(target, bin, value));
            }
        }

        Ok(StmtKind::Expr(first))
    }

    fn block(&mut self) -> EvalResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.eat(&Tok::Newline) {
            // Single-line body: `if x: y = 1`
            let line = self.line();
            let kind = self.simple_stmt()?;
            self.expect_newline()?;
            return Ok(vec![Stmt { kind, line }]);
        }
        if !self.eat(&Tok::Indent) {
            return Err(EvalError::syntax("expected an indented block", self.line()));
        }
        self.enter()?;
        let mut body = Vec::new();
        while !self.eat(&Tok::Dedent) {
            if self.check(&Tok::Eof) {
                break;
            }
            if self.eat(&Tok::Newline) {
                continue;
            }
            body.push(self.statement()?);
        }
        self.leave();
        Ok(body)
    }

    fn if_stmt(&mut self) -> EvalResult<StmtKind> {
        self.expect_kw("if")?;
        let mut branches = Vec::new();
        let cond = self.expression()?;
        branches.push((cond, self.block()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                let cond = self.expression()?;
                branches.push((cond, self.block()?));
            } else if self.eat_kw("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn def_stmt(&mut self) -> EvalResult<StmtKind> {
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.check_op(")") {
            let line = self.line();
            let pname = self.expect_name()?;
            if self.eat_op(":") {
                // annotation, ignored
                self.expression()?;
            }
            let default = if self.eat_op("=") {
                Some(self.expression()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(EvalError::syntax(
                        "non-default argument follows default argument",
                        line,
                    ));
                }
                None
            };
            if params.iter().any(|p| p.name == pname) {
                return Err(EvalError::syntax(
                    format!("duplicate argument '{pname}' in function definition"),
                    line,
                ));
            }
            params.push(Param {
                name: pname,
                default,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.expression()?;
        }
        let body = self.block()?;
        Ok(StmtKind::Def { name, params, body })
    }

    fn target_list(&mut self) -> EvalResult<Target> {
        let first = self.target_atom()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_kw("in") || self.check_op(")") {
                break;
            }
            items.push(self.target_atom()?);
        }
        Ok(Target::Tuple(items))
    }

    fn target_atom(&mut self) -> EvalResult<Target> {
        if self.eat_op("(") {
            let inner = self.target_list()?;
            self.expect_op(")")?;
            return Ok(inner);
        }
        Ok(Target::Name(self.expect_name()?))
    }

    // ── Expressions ─────────────────────────────────────

    /// Expression or bare tuple (`a, b`).
    fn expr_list(&mut self) -> EvalResult<Expr> {
        let first = self.expression()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_list_end() {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_expr_list_end(&self) -> bool {
        match self.peek() {
            Tok::Newline | Tok::Eof => true,
            Tok::Op(op) => matches!(*op, "=" | ")" | "]" | "}" | ":")
                || AUG_OPS.iter().any(|(sym, _)| sym == op),
            _ => false,
        }
    }

    pub(crate) fn expression(&mut self) -> EvalResult<Expr> {
        self.enter()?;
        let result = self.ternary();
        self.leave();
        result
    }

    fn ternary(&mut self) -> EvalResult<Expr> {
        let then = self.or_expr()?;
        if !self.eat_kw("if") {
            return Ok(then);
        }
        let cond = self.or_expr()?;
        self.expect_kw("else")?;
        let orelse = self.expression()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(then),
            orelse: Box::new(orelse),
        })
    }

    fn or_expr(&mut self) -> EvalResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_kw("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> EvalResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_kw("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> EvalResult<Expr> {
        if self.eat_kw("not") {
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> EvalResult<Expr> {
        let left = self.arith()?;
        let mut chain = Vec::new();
        loop {
            let (op, width) = match (self.peek(), self.peek_next()) {
                (Tok::Op("=="), _) => (CmpOp::Eq, 1),
                (Tok::Op("!="), _) => (CmpOp::NotEq, 1),
                (Tok::Op("<"), _) => (CmpOp::Lt, 1),
                (Tok::Op("<="), _) => (CmpOp::LtE, 1),
                (Tok::Op(">"), _) => (CmpOp::Gt, 1),
                (Tok::Op(">="), _) => (CmpOp::GtE, 1),
                (Tok::Kw("in"), _) => (CmpOp::In, 1),
                (Tok::Kw("not"), Tok::Kw("in")) => (CmpOp::NotIn, 2),
                (Tok::Kw("is"), Tok::Kw("not")) => (CmpOp::IsNot, 2),
                (Tok::Kw("is"), _) => (CmpOp::Is, 1),
                _ => break,
            };
            self.pos += width;
            chain.push((op, self.arith()?));
        }
        if chain.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), chain))
        }
    }

    fn arith(&mut self) -> EvalResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> EvalResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> EvalResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            self.enter()?;
            let operand = self.factor();
            self.leave();
            return Ok(Expr::Unary(op, Box::new(operand?)));
        }
        self.power()
    }

    fn power(&mut self) -> EvalResult<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.factor();
            self.leave();
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent?)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> EvalResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let sub = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript(Box::new(expr), sub);
            } else if self.eat_op(".") {
                let name = self.expect_name()?;
                expr = Expr::Attribute(Box::new(expr), name);
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> EvalResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check_op(")") {
            let is_kwarg =
                matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_next(), Tok::Op("="));
            if is_kwarg {
                let name = self.expect_name()?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(EvalError::syntax(
                        format!("keyword argument repeated: {name}"),
                        self.line(),
                    ));
                }
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(EvalError::syntax(
                        "positional argument follows keyword argument",
                        self.line(),
                    ));
                }
                args.push(self.expression()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> EvalResult<Subscript> {
        let lower = if self.check_op(":") {
            None
        } else {
            Some(Box::new(self.expr_list()?))
        };
        if !self.eat_op(":") {
            return match lower {
                Some(index) => Ok(Subscript::Index(index)),
                None => Err(self.unexpected("expected an index")),
            };
        }
        let upper = if self.check_op("]") {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        Ok(Subscript::Slice(lower, upper))
    }

    fn atom(&mut self) -> EvalResult<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Name(name) => Ok(Expr::Name(name)),
            Tok::Int(i) => Ok(Expr::Literal(Literal::Int(i))),
            Tok::Float(f) => Ok(Expr::Literal(Literal::Float(f))),
            Tok::Str(s) => {
                let mut text = s;
                // Adjacent literals concatenate: "a" "b"
                while let Tok::Str(next) = self.peek() {
                    text.push_str(next);
                    self.pos += 1;
                }
                Ok(Expr::Literal(Literal::Str(text)))
            }
            Tok::FStr(parts) => {
                let mut pieces = Vec::with_capacity(parts.len());
                for part in parts {
                    pieces.push(match part {
                        FPart::Lit(s) => FPiece::Lit(s),
                        FPart::Expr {
                            source,
                            conversion,
                            spec,
                        } => FPiece::Expr {
                            expr: parse_expression(&source, line)?,
                            conversion,
                            spec,
                        },
                    });
                }
                Ok(Expr::FString(pieces))
            }
            Tok::Kw("True") => Ok(Expr::Literal(Literal::Bool(true))),
            Tok::Kw("False") => Ok(Expr::Literal(Literal::Bool(false))),
            Tok::Kw("None") => Ok(Expr::Literal(Literal::None)),
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op(")") {
                        break;
                    }
                    items.push(self.expression()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => self.list_display(),
            Tok::Op("{") => {
                let mut entries = Vec::new();
                while !self.check_op("}") {
                    let key = self.expression()?;
                    self.expect_op(":")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("invalid syntax"))
            }
        }
    }

    fn list_display(&mut self) -> EvalResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.expression()?;
        if self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_expr()?;
            let cond = if self.eat_kw("if") {
                Some(Box::new(self.or_expr()?))
            } else {
                None
            };
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                target: Box::new(target),
                iter: Box::new(iter),
                cond,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.expression()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }
}

fn to_target(expr: Expr, line: usize) -> EvalResult<Target> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Subscript(obj, Subscript::Index(index)) => Ok(Target::Subscript(*obj, *index)),
        Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
            items
                .into_iter()
                .map(|e| to_target(e, line))
                .collect::<EvalResult<_>>()?,
        )),
        _ => Err(EvalError::syntax("cannot assign to expression", line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(src: &str) -> StmtKind {
        let mut stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 1, "expected one statement in {src:?}");
        stmts.remove(0).kind
    }

    #[test]
    fn test_assignment() {
        assert_eq!(
            single("result = 2 + 2"),
            StmtKind::Assign(
                vec![Target::Name("result".into())],
                Expr::Binary(
                    BinOp::Add,
                    Box::new(Expr::Literal(Literal::Int(2))),
                    Box::new(Expr::Literal(Literal::Int(2)))
                )
            )
        );
    }

    #[test]
    fn test_empty_program() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("# nothing\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 → Add(1, Mul(2, 3))
        let StmtKind::Expr(Expr::Binary(BinOp::Add, _, right)) = single("1 + 2 * 3") else {
            panic!("expected addition at the root");
        };
        assert!(matches!(*right, Expr::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn test_power_binds_tighter_than_unary_minus() {
        let StmtKind::Expr(Expr::Unary(UnaryOp::Neg, inner)) = single("-2 ** 2") else {
            panic!("expected negation at the root");
        };
        assert!(matches!(*inner, Expr::Binary(BinOp::Pow, _, _)));
    }

    #[test]
    fn test_tuple_unpacking_target() {
        let StmtKind::Assign(targets, _) = single("a, b = 1, 2") else {
            panic!("expected assignment");
        };
        assert_eq!(
            targets,
            vec![Target::Tuple(vec![
                Target::Name("a".into()),
                Target::Name("b".into())
            ])]
        );
    }

    #[test]
    fn test_chained_assignment() {
        let StmtKind::Assign(targets, _) = single("a = b = 0") else {
            panic!("expected assignment");
        };
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_augmented_assignment() {
        assert!(matches!(
            single("total += 1"),
            StmtKind::AugAssign(Target::Name(_), BinOp::Add, _)
        ));
    }

    #[test]
    fn test_if_elif_else() {
        let StmtKind::If { branches, orelse } =
            single("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n")
        else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn test_single_line_block() {
        let StmtKind::While { body, .. } = single("while x: x -= 1") else {
            panic!("expected while");
        };
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_for_with_tuple_target() {
        let StmtKind::For { target, .. } = single("for k, v in d.items():\n    pass\n") else {
            panic!("expected for");
        };
        assert!(matches!(target, Target::Tuple(ref t) if t.len() == 2));
    }

    #[test]
    fn test_def_with_defaults() {
        let StmtKind::Def { name, params, body } =
            single("def greet(name, greeting='hi'):\n    return greeting + name\n")
        else {
            panic!("expected def");
        };
        assert_eq!(name, "greet");
        assert_eq!(params.len(), 2);
        assert!(params[1].default.is_some());
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_non_default_after_default() {
        let err = parse("def f(a=1, b):\n    pass\n").unwrap_err();
        assert!(err.message.contains("non-default"));
    }

    #[test]
    fn test_list_comprehension() {
        let StmtKind::Expr(Expr::ListComp { cond, .. }) = single("[x * 2 for x in xs if x > 1]")
        else {
            panic!("expected list comprehension");
        };
        assert!(cond.is_some());
    }

    #[test]
    fn test_list_comprehension_with_tuple_target() {
        let StmtKind::Expr(Expr::ListComp { target, cond, .. }) =
            single("[a + b for a, b in pairs]")
        else {
            panic!("expected list comprehension");
        };
        assert!(matches!(*target, Target::Tuple(ref names) if names.len() == 2));
        assert!(cond.is_none());
    }

    #[test]
    fn test_call_with_kwargs() {
        let StmtKind::Expr(Expr::Call { args, kwargs, .. }) = single("print(1, 2, sep='-')")
        else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(kwargs[0].0, "sep");
    }

    #[test]
    fn test_positional_after_keyword() {
        assert!(parse("f(a=1, 2)").is_err());
    }

    #[test]
    fn test_slices() {
        let StmtKind::Expr(Expr::Subscript(_, sub)) = single("s[:3]") else {
            panic!("expected subscript");
        };
        assert!(matches!(sub, Subscript::Slice(None, Some(_))));
    }

    #[test]
    fn test_chained_comparison() {
        let StmtKind::Expr(Expr::Compare(_, chain)) = single("0 < x <= 10") else {
            panic!("expected comparison");
        };
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_not_in_and_is_not() {
        let StmtKind::Expr(Expr::Compare(_, chain)) = single("a not in b") else {
            panic!("expected comparison");
        };
        assert_eq!(chain[0].0, CmpOp::NotIn);
        let StmtKind::Expr(Expr::Compare(_, chain)) = single("a is not None") else {
            panic!("expected comparison");
        };
        assert_eq!(chain[0].0, CmpOp::IsNot);
    }

    #[test]
    fn test_imports() {
        assert_eq!(
            single("import math, json as j"),
            StmtKind::Import(vec![
                ("math".into(), "math".into()),
                ("json".into(), "j".into())
            ])
        );
        assert_eq!(
            single("from math import sqrt as root"),
            StmtKind::ImportFrom {
                module: "math".into(),
                names: vec![("sqrt".into(), "root".into())]
            }
        );
    }

    #[test]
    fn test_fstring_expression_parsed() {
        let StmtKind::Expr(Expr::FString(pieces)) = single("f'{a + 1}!'") else {
            panic!("expected f-string");
        };
        assert!(matches!(pieces[0], FPiece::Expr { expr: Expr::Binary(..), .. }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse("f() = 1").unwrap_err();
        assert!(err.message.contains("cannot assign"));
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse("x = 1\ny = (2 +\n)\n").unwrap_err();
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_unexpected_indent() {
        assert!(parse("x = 1\n    y = 2\n").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        // Run on a roomy stack: debug builds use large parser frames.
        let err = std::thread::Builder::new()
            .stack_size(32 * 1024 * 1024)
            .spawn(|| {
                let src = format!("x = {}1{}", "(".repeat(500), ")".repeat(500));
                parse(&src).unwrap_err()
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(err.message.contains("nested"));
    }

    #[test]
    fn test_with_statement() {
        assert!(matches!(
            single("with open('f.txt') as fh:\n    data = fh.read()\n"),
            StmtKind::With { name: Some(_), .. }
        ));
    }
}
