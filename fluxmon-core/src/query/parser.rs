//! Recursive descent parser producing an [`Expr`]

use super::ast::*;
use super::functions;
use super::lexer::{Lexer, Token, TokenKind};
use crate::{MatchOp, Matcher, QueryError, METRIC_NAME_LABEL};

type ParseResult<T> = std::result::Result<T, QueryError>;

/// Parse and type-check an expression
pub fn parse(input: &str) -> ParseResult<Expr> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    let tok = parser.peek();
    if tok.kind != TokenKind::Eof {
        return Err(QueryError::parse(
            tok.pos,
            format!("unexpected {} after expression", describe(&tok.kind)),
        ));
    }
    check_types(&expr, 0)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> ParseResult<Token> {
        let tok = self.advance();
        if tok.kind == kind {
            Ok(tok)
        } else {
            Err(QueryError::parse(
                tok.pos,
                format!("expected {} {}, got {}", describe(&kind), context, describe(&tok.kind)),
            ))
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }

    fn peek_binary_op(&self) -> Option<BinaryOp> {
        let op = match &self.peek().kind {
            TokenKind::Add => BinaryOp::Add,
            TokenKind::Sub => BinaryOp::Sub,
            TokenKind::Mul => BinaryOp::Mul,
            TokenKind::Div => BinaryOp::Div,
            TokenKind::Mod => BinaryOp::Mod,
            TokenKind::Pow => BinaryOp::Pow,
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Ge => BinaryOp::Ge,
            TokenKind::Ident(s) => match s.to_ascii_lowercase().as_str() {
                "and" => BinaryOp::And,
                "or" => BinaryOp::Or,
                "unless" => BinaryOp::Unless,
                _ => return None,
            },
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing over binary operators
    fn parse_expr(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.peek_binary_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let (return_bool, matching) = self.parse_modifiers(op)?;
            let next_min = if op.is_right_associative() { prec } else { prec + 1 };
            let rhs = self.parse_expr(next_min)?;
            lhs = Expr::Binary(Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                return_bool,
                matching,
            });
        }
        Ok(lhs)
    }

    fn parse_modifiers(&mut self, op: BinaryOp) -> ParseResult<(bool, VectorMatching)> {
        let mut return_bool = false;
        if self.peek_keyword("bool") {
            let tok = self.advance();
            if !op.is_comparison() {
                return Err(QueryError::parse(tok.pos, "bool modifier can only be used on comparison operators"));
            }
            return_bool = true;
        }

        let mut matching = VectorMatching::default();
        if op.is_set() {
            matching.card = Cardinality::ManyToMany;
        }
        if self.peek_keyword("on") || self.peek_keyword("ignoring") {
            let tok = self.advance();
            matching.on = matches!(&tok.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case("on"));
            matching.labels = self.parse_label_list()?;

            if self.peek_keyword("group_left") || self.peek_keyword("group_right") {
                let tok = self.advance();
                if op.is_set() {
                    return Err(QueryError::parse(tok.pos, "no grouping allowed for set operations"));
                }
                let include = if self.peek().kind == TokenKind::LParen {
                    self.parse_label_list()?
                } else {
                    Vec::new()
                };
                let left = matches!(&tok.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case("group_left"));
                if matching.on && include.iter().any(|l| matching.labels.contains(l)) {
                    return Err(QueryError::parse(tok.pos, "label must not occur in on() and group clause at once"));
                }
                matching.card = if left {
                    Cardinality::ManyToOne(include)
                } else {
                    Cardinality::OneToMany(include)
                };
            }
        }
        Ok((return_bool, matching))
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        match self.peek().kind {
            TokenKind::Sub => {
                self.advance();
                // binds looser than ^ so that -2^2 == -4
                let operand = self.parse_expr(BinaryOp::Pow.precedence())?;
                Ok(match operand {
                    Expr::Number(n) => Expr::Number(-n),
                    other => Expr::Neg(Box::new(other)),
                })
            }
            TokenKind::Add => {
                self.advance();
                self.parse_expr(BinaryOp::Pow.precedence())
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)
            }
        }
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> ParseResult<Expr> {
        if self.peek().kind == TokenKind::LBracket {
            let tok = self.advance();
            let Expr::VectorSelector(selector) = expr else {
                return Err(QueryError::parse(
                    tok.pos,
                    "ranges only allowed for vector selectors",
                ));
            };
            let range = self.parse_duration("in range selector")?;
            if range <= 0 {
                return Err(QueryError::parse(tok.pos, "range must be positive"));
            }
            self.expect(TokenKind::RBracket, "to close range selector")?;
            expr = Expr::MatrixSelector(MatrixSelector { selector, range });
        }

        if self.peek_keyword("offset") {
            let tok = self.advance();
            let negative = if self.peek().kind == TokenKind::Sub {
                self.advance();
                true
            } else {
                false
            };
            let offset = self.parse_duration("after offset")?;
            let offset = if negative { -offset } else { offset };
            match &mut expr {
                Expr::VectorSelector(vs) => vs.offset = offset,
                Expr::MatrixSelector(ms) => ms.selector.offset = offset,
                _ => {
                    return Err(QueryError::parse(
                        tok.pos,
                        "offset modifier must be preceded by a selector",
                    ))
                }
            }
        }
        Ok(expr)
    }

    fn parse_duration(&mut self, context: &str) -> ParseResult<i64> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Duration(d) => Ok(d),
            other => Err(QueryError::parse(
                tok.pos,
                format!("expected duration {}, got {}", context, describe(&other)),
            )),
        }
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Str(s) => Ok(Expr::String(s)),
            TokenKind::LParen => {
                let inner = self.parse_expr(0)?;
                self.expect(TokenKind::RParen, "to close parenthesis")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            TokenKind::LBrace => {
                let matchers = self.parse_matchers()?;
                self.selector(None, matchers, tok.pos)
            }
            TokenKind::Ident(name) => self.parse_identifier(name, tok.pos),
            other => Err(QueryError::parse(
                tok.pos,
                format!("unexpected {}", describe(&other)),
            )),
        }
    }

    fn parse_identifier(&mut self, name: String, pos: usize) -> ParseResult<Expr> {
        let lower = name.to_ascii_lowercase();
        if lower == "inf" {
            return Ok(Expr::Number(f64::INFINITY));
        }
        if lower == "nan" {
            return Ok(Expr::Number(f64::NAN));
        }

        if let Some(op) = AggregateOp::from_name(&lower) {
            let next = &self.peek().kind;
            let is_call = *next == TokenKind::LParen
                || matches!(next, TokenKind::Ident(s) if s.eq_ignore_ascii_case("by") || s.eq_ignore_ascii_case("without"));
            if is_call {
                return self.parse_aggregate(op, pos);
            }
        }

        if self.peek().kind == TokenKind::LParen {
            let Some(func) = functions::lookup(&name) else {
                return Err(QueryError::parse(pos, format!("unknown function with name {:?}", name)));
            };
            self.advance();
            let mut args = Vec::new();
            if self.peek().kind != TokenKind::RParen {
                loop {
                    args.push(self.parse_expr(0)?);
                    if self.peek().kind == TokenKind::Comma {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            self.expect(TokenKind::RParen, "to close function call")?;
            let min = func.arg_types.len() - func.optional_args;
            if args.len() < min || args.len() > func.arg_types.len() {
                return Err(QueryError::parse(
                    pos,
                    format!(
                        "expected {} argument(s) in call to {:?}, got {}",
                        func.arg_types.len(),
                        func.name,
                        args.len()
                    ),
                ));
            }
            return Ok(Expr::Call(Call { func, args }));
        }

        let matchers = if self.peek().kind == TokenKind::LBrace {
            self.advance();
            self.parse_matchers()?
        } else {
            Vec::new()
        };
        self.selector(Some(name), matchers, pos)
    }

    fn selector(&self, name: Option<String>, mut matchers: Vec<Matcher>, pos: usize) -> ParseResult<Expr> {
        if let Some(name) = &name {
            if matchers.iter().any(|m| m.name == METRIC_NAME_LABEL) {
                return Err(QueryError::parse(pos, "metric name must not be set twice"));
            }
            matchers.insert(0, Matcher::metric_name(name.clone()));
        }
        if matchers.iter().all(|m| m.matches_empty()) {
            return Err(QueryError::parse(
                pos,
                "vector selector must contain at least one non-empty matcher",
            ));
        }
        Ok(Expr::VectorSelector(VectorSelector {
            name,
            matchers,
            offset: 0,
        }))
    }

    /// Matchers after an opening brace, through the closing brace
    fn parse_matchers(&mut self) -> ParseResult<Vec<Matcher>> {
        let mut matchers = Vec::new();
        loop {
            let tok = self.advance();
            let name = match tok.kind {
                TokenKind::RBrace => break,
                TokenKind::Ident(name) => name,
                TokenKind::Str(name) => name,
                other => {
                    return Err(QueryError::parse(
                        tok.pos,
                        format!("unexpected {} in label matching, expected label name", describe(&other)),
                    ))
                }
            };
            let op_tok = self.advance();
            let op = match op_tok.kind {
                TokenKind::Assign => MatchOp::Equal,
                TokenKind::Ne => MatchOp::NotEqual,
                TokenKind::RegexMatch => MatchOp::Regex,
                TokenKind::RegexNoMatch => MatchOp::NotRegex,
                other => {
                    return Err(QueryError::parse(
                        op_tok.pos,
                        format!("unexpected {} in label matching, expected match operator", describe(&other)),
                    ))
                }
            };
            let value_tok = self.advance();
            let TokenKind::Str(value) = value_tok.kind else {
                return Err(QueryError::parse(
                    value_tok.pos,
                    format!("unexpected {} in label matching, expected string", describe(&value_tok.kind)),
                ));
            };
            let matcher = Matcher::new(op, name, value)
                .map_err(|e| QueryError::parse(value_tok.pos, e.to_string()))?;
            matchers.push(matcher);

            match self.peek().kind {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RBrace => {}
                _ => {
                    let tok = self.peek();
                    return Err(QueryError::parse(
                        tok.pos,
                        format!("unexpected {} in label matching, expected \",\" or \"}}\"", describe(&tok.kind)),
                    ));
                }
            }
        }
        Ok(matchers)
    }

    fn parse_label_list(&mut self) -> ParseResult<Vec<String>> {
        self.expect(TokenKind::LParen, "to open label list")?;
        let mut labels = Vec::new();
        loop {
            let tok = self.advance();
            match tok.kind {
                TokenKind::RParen => break,
                TokenKind::Ident(name) => labels.push(name),
                other => {
                    return Err(QueryError::parse(
                        tok.pos,
                        format!("unexpected {} in grouping opts, expected label", describe(&other)),
                    ))
                }
            }
            match self.peek().kind {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RParen => {}
                _ => {
                    let tok = self.peek();
                    return Err(QueryError::parse(
                        tok.pos,
                        format!("unexpected {} in grouping opts, expected \",\" or \")\"", describe(&tok.kind)),
                    ));
                }
            }
        }
        Ok(labels)
    }

    fn parse_grouping(&mut self) -> ParseResult<Option<Grouping>> {
        if self.peek_keyword("by") {
            self.advance();
            return Ok(Some(Grouping::By(self.parse_label_list()?)));
        }
        if self.peek_keyword("without") {
            self.advance();
            return Ok(Some(Grouping::Without(self.parse_label_list()?)));
        }
        Ok(None)
    }

    /// `op [by|without (...)] (args) [by|without (...)]`
    fn parse_aggregate(&mut self, op: AggregateOp, pos: usize) -> ParseResult<Expr> {
        let mut grouping = self.parse_grouping()?;
        self.expect(TokenKind::LParen, "in aggregation")?;
        let mut args = vec![self.parse_expr(0)?];
        while self.peek().kind == TokenKind::Comma {
            self.advance();
            args.push(self.parse_expr(0)?);
        }
        self.expect(TokenKind::RParen, "to close aggregation")?;
        if grouping.is_none() {
            grouping = self.parse_grouping()?;
        }

        let expected = if op.takes_param() { 2 } else { 1 };
        if args.len() != expected {
            return Err(QueryError::parse(
                pos,
                format!("wrong number of arguments for aggregate expression provided, expected {}, got {}", expected, args.len()),
            ));
        }
        let expr = args.pop().map(Box::new);
        let param = args.pop().map(Box::new);
        let Some(expr) = expr else {
            return Err(QueryError::parse(pos, "missing aggregation argument"));
        };
        Ok(Expr::Aggregate(Aggregate {
            op,
            expr,
            param,
            grouping,
        }))
    }
}

/// Reject operand type mismatches before evaluation
fn check_types(expr: &Expr, pos: usize) -> ParseResult<()> {
    match expr {
        Expr::Number(_) | Expr::String(_) | Expr::VectorSelector(_) | Expr::MatrixSelector(_) => Ok(()),
        Expr::Paren(e) => check_types(e, pos),
        Expr::Neg(e) => {
            check_types(e, pos)?;
            match e.value_type() {
                ValueType::Scalar | ValueType::Vector => Ok(()),
                other => Err(QueryError::parse(pos, format!("unary expression only allowed on expressions of type scalar or instant vector, got {}", other))),
            }
        }
        Expr::Call(call) => {
            for (i, arg) in call.args.iter().enumerate() {
                check_types(arg, pos)?;
                let want = call.func.arg_types[i];
                let got = arg.value_type();
                if want != got {
                    return Err(QueryError::parse(
                        pos,
                        format!(
                            "expected type {} in call to function {:?}, got {}",
                            want, call.func.name, got
                        ),
                    ));
                }
            }
            Ok(())
        }
        Expr::Aggregate(agg) => {
            check_types(&agg.expr, pos)?;
            if agg.expr.value_type() != ValueType::Vector {
                return Err(QueryError::parse(
                    pos,
                    format!("expected type instant vector in aggregation expression, got {}", agg.expr.value_type()),
                ));
            }
            if let Some(param) = &agg.param {
                check_types(param, pos)?;
                if param.value_type() != ValueType::Scalar {
                    return Err(QueryError::parse(
                        pos,
                        format!("expected type scalar in aggregation parameter, got {}", param.value_type()),
                    ));
                }
            }
            Ok(())
        }
        Expr::Binary(b) => {
            check_types(&b.lhs, pos)?;
            check_types(&b.rhs, pos)?;
            let (lt, rt) = (b.lhs.value_type(), b.rhs.value_type());
            for t in [lt, rt] {
                if t != ValueType::Scalar && t != ValueType::Vector {
                    return Err(QueryError::parse(
                        pos,
                        format!("binary expression must contain only scalar and instant vector types, got {}", t),
                    ));
                }
            }
            let both_scalar = lt == ValueType::Scalar && rt == ValueType::Scalar;
            if b.op.is_comparison() && both_scalar && !b.return_bool {
                return Err(QueryError::parse(pos, "comparisons between scalars must use BOOL modifier"));
            }
            if b.op.is_set() && (lt != ValueType::Vector || rt != ValueType::Vector) {
                return Err(QueryError::parse(
                    pos,
                    format!("set operator {:?} not allowed in binary scalar expression", b.op),
                ));
            }
            let has_matching = b.matching.on || !b.matching.labels.is_empty()
                || matches!(b.matching.card, Cardinality::ManyToOne(_) | Cardinality::OneToMany(_));
            if has_matching && (lt != ValueType::Vector || rt != ValueType::Vector) {
                return Err(QueryError::parse(pos, "vector matching only allowed between instant vectors"));
            }
            Ok(())
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(s) => format!("identifier {:?}", s),
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Str(s) => format!("string {:?}", s),
        TokenKind::Duration(d) => format!("duration {}ms", d),
        TokenKind::LParen => "\"(\"".into(),
        TokenKind::RParen => "\")\"".into(),
        TokenKind::LBrace => "\"{\"".into(),
        TokenKind::RBrace => "\"}\"".into(),
        TokenKind::LBracket => "\"[\"".into(),
        TokenKind::RBracket => "\"]\"".into(),
        TokenKind::Comma => "\",\"".into(),
        TokenKind::Assign => "\"=\"".into(),
        TokenKind::Eq => "\"==\"".into(),
        TokenKind::Ne => "\"!=\"".into(),
        TokenKind::RegexMatch => "\"=~\"".into(),
        TokenKind::RegexNoMatch => "\"!~\"".into(),
        TokenKind::Lt => "\"<\"".into(),
        TokenKind::Le => "\"<=\"".into(),
        TokenKind::Gt => "\">\"".into(),
        TokenKind::Ge => "\">=\"".into(),
        TokenKind::Add => "\"+\"".into(),
        TokenKind::Sub => "\"-\"".into(),
        TokenKind::Mul => "\"*\"".into(),
        TokenKind::Div => "\"/\"".into(),
        TokenKind::Mod => "\"%\"".into(),
        TokenKind::Pow => "\"^\"".into(),
        TokenKind::Eof => "end of input".into(),
    }
}
