//! TwineScript-style expressions for `<<set>>`, `<<if>>`, `<<print>>`,
//! `<<for>>` and backquoted macro arguments.
//!
//! Source is tokenized with [`Lexer`] state functions and parsed by
//! precedence climbing into a small tree evaluated against [`State`].

use serde_json::{Number, Value};

use crate::error::ExprError;
use crate::lexer::{Lexer, State as LexState, Token};
use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Item {
    Error,
    Number,
    String,
    Word,
    Variable,
    Operator,
    LParen,
    RParen,
    Semicolon,
}

// Lexing functions.

fn lex_space(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    while lexer.peek().is_some_and(char::is_whitespace) {
        lexer.forward(1);
    }
    lexer.ignore();

    let ch = lexer.next()?;
    match ch {
        '0'..='9' => Some(LexState(lex_number)),
        '.' if lexer.peek().is_some_and(|c| c.is_ascii_digit()) => Some(LexState(lex_number)),
        '"' => Some(LexState(lex_double_quote)),
        '\'' => Some(LexState(lex_single_quote)),
        '$' | '_' if lexer.peek().is_some_and(is_ident_char) => Some(LexState(lex_variable)),
        c if c.is_alphabetic() => Some(LexState(lex_word)),
        '(' => {
            lexer.emit(Item::LParen);
            Some(LexState(lex_space))
        }
        ')' => {
            lexer.emit(Item::RParen);
            Some(LexState(lex_space))
        }
        ';' => {
            lexer.emit(Item::Semicolon);
            Some(LexState(lex_space))
        }
        '+' | '-' | '*' | '/' | '%' | '=' | '!' | '<' | '>' | '&' | '|' => {
            Some(LexState(lex_operator))
        }
        c => lexer.error(Item::Error, format!("unexpected character '{c}'")),
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

fn lex_number(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    lexer.accept_run("0123456789");
    if lexer.accept(".") {
        lexer.accept_run("0123456789");
    }
    if lexer.accept("eE") {
        lexer.accept("+-");
        lexer.accept_run("0123456789");
    }
    lexer.emit(Item::Number);
    Some(LexState(lex_space))
}

fn slurp_quote(lexer: &mut Lexer<Item>, end: char) -> bool {
    loop {
        match lexer.next() {
            Some('\\') => {
                if lexer.next().is_none() {
                    return false;
                }
            }
            Some(ch) if ch == end => return true,
            Some(_) => {}
            None => return false,
        }
    }
}

fn lex_double_quote(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    if !slurp_quote(lexer, '"') {
        return lexer.error(Item::Error, "unterminated double quoted string");
    }
    lexer.emit(Item::String);
    Some(LexState(lex_space))
}

fn lex_single_quote(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    if !slurp_quote(lexer, '\'') {
        return lexer.error(Item::Error, "unterminated single quoted string");
    }
    lexer.emit(Item::String);
    Some(LexState(lex_space))
}

fn lex_variable(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    while lexer.peek().is_some_and(is_ident_char) {
        lexer.forward(1);
    }
    lexer.emit(Item::Variable);
    Some(LexState(lex_space))
}

fn lex_word(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    while lexer.peek().is_some_and(is_ident_char) {
        lexer.forward(1);
    }
    lexer.emit(Item::Word);
    Some(LexState(lex_space))
}

fn lex_operator(lexer: &mut Lexer<Item>) -> Option<LexState<Item>> {
    lexer.backup(1);
    match lexer.next() {
        Some('&') if !lexer.accept("&") => {
            return lexer.error(Item::Error, "unexpected character '&'");
        }
        Some('|') if !lexer.accept("|") => {
            return lexer.error(Item::Error, "unexpected character '|'");
        }
        Some('&' | '|') => {}
        _ => {
            if lexer.accept("=") {
                lexer.accept("=");
            }
        }
    }
    lexer.emit(Item::Operator);
    Some(LexState(lex_space))
}

fn tokenize(source: &str) -> Result<Vec<Token<Item>>, ExprError> {
    let tokens = Lexer::new(source, LexState(lex_space)).run();
    if let Some(bad) = tokens.iter().find(|t| t.is_error()) {
        return Err(ExprError::Syntax {
            message: bad.message.clone().unwrap_or_default(),
            pos: bad.start,
        });
    }
    Ok(tokens)
}

// Syntax tree.

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Defined(bool, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Assign(AssignOp, String, Box<Expr>),
}

/// How deep parentheses, unary operators and operator chains may nest.
const MAX_NESTING: usize = 100;

struct Parser {
    tokens: Vec<Token<Item>>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token<Item>> {
        self.tokens.get(self.index)
    }

    fn bump(&mut self) -> Option<Token<Item>> {
        let token = self.tokens.get(self.index).cloned();
        self.index += 1;
        token
    }

    fn syntax(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            message: message.into(),
            pos: self.peek().map_or(0, |t| t.start),
        }
    }

    /// Is the next token an operator or keyword spelled `text`?
    fn at(&self, text: &str) -> bool {
        self.peek()
            .is_some_and(|t| matches!(t.kind, Item::Operator | Item::Word) && t.text == text)
    }

    fn statements(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut list = Vec::new();
        loop {
            while self.peek().is_some_and(|t| t.kind == Item::Semicolon) {
                self.index += 1;
            }
            if self.peek().is_none() {
                return Ok(list);
            }
            list.push(self.assignment()?);
            match self.peek() {
                None => return Ok(list),
                Some(t) if t.kind == Item::Semicolon => {}
                Some(t) => return Err(self.syntax(format!("unexpected token \"{}\"", t.text))),
            }
        }
    }

    /// Go one level deeper into the expression tree.
    fn descend(&mut self) -> Result<(), ExprError> {
        if self.depth >= MAX_NESTING {
            return Err(ExprError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        Ok(())
    }

    /// Parse with `parse` one level deeper.
    fn nested(&mut self, parse: fn(&mut Self) -> Result<Expr, ExprError>) -> Result<Expr, ExprError> {
        self.descend()?;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    /// Parse a left-associative chain of `operand`s joined by the operators
    /// `op` recognises. Every link nests the tree one level deeper.
    fn chain(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, ExprError>,
        op: fn(&Self) -> Option<BinOp>,
    ) -> Result<Expr, ExprError> {
        let mut lhs = operand(self)?;
        let mut links = 0;
        let result = loop {
            let Some(bin) = op(self) else {
                break Ok(lhs);
            };
            if let Err(err) = self.descend() {
                break Err(err);
            }
            links += 1;
            self.index += 1;
            match operand(self) {
                Ok(rhs) => lhs = Expr::Binary(bin, Box::new(lhs), Box::new(rhs)),
                Err(err) => break Err(err),
            }
        };
        self.depth -= links;
        result
    }

    fn assignment(&mut self) -> Result<Expr, ExprError> {
        let target = self.or()?;
        let op = match self.peek().map(|t| t.text.as_str()) {
            Some("to") | Some("=") => AssignOp::Set,
            Some("+=") => AssignOp::Add,
            Some("-=") => AssignOp::Sub,
            Some("*=") => AssignOp::Mul,
            Some("/=") => AssignOp::Div,
            _ => return Ok(target),
        };
        self.index += 1;
        let Expr::Var(name) = target else {
            return Err(ExprError::BadAssignment);
        };
        let value = self.nested(Self::assignment)?;
        Ok(Expr::Assign(op, name, Box::new(value)))
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        self.chain(Self::and, |p| (p.at("or") || p.at("||")).then_some(BinOp::Or))
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        self.chain(Self::equality, |p| (p.at("and") || p.at("&&")).then_some(BinOp::And))
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        self.chain(Self::comparison, |p| match p.peek().map(|t| t.text.as_str()) {
            Some("==") | Some("eq") => Some(BinOp::Eq),
            Some("!=") | Some("neq") => Some(BinOp::Ne),
            Some("===") | Some("is") => Some(BinOp::StrictEq),
            Some("!==") | Some("isnot") => Some(BinOp::StrictNe),
            _ => None,
        })
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        self.chain(Self::additive, |p| match p.peek().map(|t| t.text.as_str()) {
            Some("<") | Some("lt") => Some(BinOp::Lt),
            Some("<=") | Some("lte") => Some(BinOp::Le),
            Some(">") | Some("gt") => Some(BinOp::Gt),
            Some(">=") | Some("gte") => Some(BinOp::Ge),
            _ => None,
        })
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        self.chain(Self::multiplicative, |p| {
            if p.at("+") {
                Some(BinOp::Add)
            } else if p.at("-") {
                Some(BinOp::Sub)
            } else {
                None
            }
        })
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        self.chain(Self::unary, |p| {
            if p.at("*") {
                Some(BinOp::Mul)
            } else if p.at("/") {
                Some(BinOp::Div)
            } else if p.at("%") {
                Some(BinOp::Rem)
            } else {
                None
            }
        })
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.at("not") || self.at("!") {
            self.index += 1;
            return Ok(Expr::Not(Box::new(self.nested(Self::unary)?)));
        }
        if self.at("-") {
            self.index += 1;
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        if self.at("+") {
            self.index += 1;
            return self.nested(Self::unary);
        }
        if self.at("def") || self.at("ndef") {
            let defined = self.at("def");
            self.index += 1;
            return Ok(Expr::Defined(defined, Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some(token) = self.bump() else {
            return Err(ExprError::UnexpectedEnd);
        };
        match token.kind {
            Item::Number => token
                .text
                .parse::<f64>()
                .map_err(|_| ExprError::Syntax {
                    message: format!("invalid number \"{}\"", token.text),
                    pos: token.start,
                })
                .and_then(number)
                .map(Expr::Literal),
            Item::String => Ok(Expr::Literal(Value::String(unquote(&token.text)?))),
            Item::Variable => Ok(Expr::Var(token.text)),
            Item::Word => match token.text.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                other => Err(ExprError::Syntax {
                    message: format!("unknown identifier \"{other}\""),
                    pos: token.start,
                }),
            },
            Item::LParen => {
                let inner = self.nested(Self::assignment)?;
                match self.bump() {
                    Some(t) if t.kind == Item::RParen => Ok(inner),
                    Some(t) => Err(ExprError::Syntax {
                        message: "expected \")\"".to_string(),
                        pos: t.start,
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            _ => Err(ExprError::Syntax {
                message: format!("unexpected token \"{}\"", token.text),
                pos: token.start,
            }),
        }
    }
}

/// Strip the quotes from a string literal and resolve its escapes.
pub fn unquote(literal: &str) -> Result<String, ExprError> {
    let mut chars = literal.chars();
    let quote = chars.next().ok_or(ExprError::UnexpectedEnd)?;
    let body: Vec<char> = chars.collect();
    let Some((&last, body)) = body.split_last() else {
        return Err(ExprError::UnexpectedEnd);
    };
    if last != quote {
        return Err(ExprError::Syntax {
            message: "unterminated string".to_string(),
            pos: 0,
        });
    }
    let mut out = String::with_capacity(body.len());
    let mut iter = body.iter();
    while let Some(&ch) = iter.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match iter.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(&other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Ok(out)
}

// Evaluation.

/// Convert an `f64` into a JSON number, preferring an integer representation.
pub fn number(value: f64) -> Result<Value, ExprError> {
    if !value.is_finite() {
        return Err(ExprError::NotFinite);
    }
    if value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        return Ok(Value::from(value as i64));
    }
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or(ExprError::NotFinite)
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Display form used when a value is printed into a passage.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(to_display).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}

fn to_number(value: &Value) -> Result<f64, ExprError> {
    match value {
        Value::Null => Ok(0.0),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().ok_or(ExprError::NotFinite),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ExprError::Type(format!("cannot convert \"{s}\" to a number"))),
        other => Err(ExprError::Type(format!("cannot convert {other} to a number"))),
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::String(_) | Value::Bool(_))
        | (Value::String(_) | Value::Bool(_), Value::Number(_)) => {
            match (to_number(a), to_number(b)) {
                (Ok(x), Ok(y)) => x == y,
                _ => false,
            }
        }
        _ => strict_eq(a, b),
    }
}

fn compare(op: BinOp, a: &Value, b: &Value) -> Result<bool, ExprError> {
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            let (x, y) = (to_number(a)?, to_number(b)?);
            match x.partial_cmp(&y) {
                Some(ordering) => ordering,
                None => return Ok(false),
            }
        }
    };
    Ok(match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn arithmetic(op: BinOp, a: &Value, b: &Value) -> Result<Value, ExprError> {
    if op == BinOp::Add && (a.is_string() || b.is_string()) {
        return Ok(Value::String(to_display(a) + &to_display(b)));
    }
    let (x, y) = (to_number(a)?, to_number(b)?);
    number(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        _ => x % y,
    })
}

fn eval(expr: &Expr, state: &mut State) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => Ok(state.get(name).unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, state)?))),
        Expr::Neg(inner) => number(-to_number(&eval(inner, state)?)?),
        Expr::Defined(defined, inner) => {
            let exists = match inner.as_ref() {
                Expr::Var(name) => state.has(name),
                other => !eval(other, state)?.is_null(),
            };
            Ok(Value::Bool(exists == *defined))
        }
        Expr::Binary(BinOp::And, lhs, rhs) => {
            let left = eval(lhs, state)?;
            if is_truthy(&left) { eval(rhs, state) } else { Ok(left) }
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            let left = eval(lhs, state)?;
            if is_truthy(&left) { Ok(left) } else { eval(rhs, state) }
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval(lhs, state)?;
            let right = eval(rhs, state)?;
            match op {
                BinOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
                BinOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
                BinOp::StrictEq => Ok(Value::Bool(strict_eq(&left, &right))),
                BinOp::StrictNe => Ok(Value::Bool(!strict_eq(&left, &right))),
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    compare(*op, &left, &right).map(Value::Bool)
                }
                _ => arithmetic(*op, &left, &right),
            }
        }
        Expr::Assign(op, name, rhs) => {
            let right = eval(rhs, state)?;
            let value = match op {
                AssignOp::Set => right,
                AssignOp::Add => arithmetic(BinOp::Add, &state.get(name).unwrap_or(Value::Null), &right)?,
                AssignOp::Sub => arithmetic(BinOp::Sub, &state.get(name).unwrap_or(Value::Null), &right)?,
                AssignOp::Mul => arithmetic(BinOp::Mul, &state.get(name).unwrap_or(Value::Null), &right)?,
                AssignOp::Div => arithmetic(BinOp::Div, &state.get(name).unwrap_or(Value::Null), &right)?,
            };
            state
                .set(name, value.clone())
                .map_err(|e| ExprError::Type(e.to_string()))?;
            Ok(value)
        }
    }
}

/// Evaluate `;`-separated statements, returning the last value (`null` if none).
pub fn evaluate(source: &str, state: &mut State) -> Result<Value, ExprError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        index: 0,
        depth: 0,
    };
    let mut result = Value::Null;
    for statement in parser.statements()? {
        result = eval(&statement, state)?;
    }
    Ok(result)
}

/// Evaluate and coerce to a boolean.
pub fn evaluate_condition(source: &str, state: &mut State) -> Result<bool, ExprError> {
    evaluate(source, state).map(|value| is_truthy(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn eval_str(source: &str) -> Value {
        evaluate(source, &mut State::new()).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_str("1 + 2 * 3"), json!(7));
        assert_eq!(eval_str("(1 + 2) * 3"), json!(9));
        assert_eq!(eval_str("7 % 4 - -1"), json!(4));
        assert_eq!(eval_str("1 / 4"), json!(0.25));
    }

    #[test]
    fn test_strings_and_concatenation() {
        assert_eq!(eval_str(r#""hi " + 'Sam'"#), json!("hi Sam"));
        assert_eq!(eval_str(r#""a\"b""#), json!("a\"b"));
        assert_eq!(eval_str(r#""n" + 1"#), json!("n1"));
    }

    #[test]
    fn test_keyword_operators() {
        assert_eq!(eval_str("1 is 1 and 2 gt 1"), json!(true));
        assert_eq!(eval_str("not true or 3 lte 2"), json!(false));
        assert_eq!(eval_str("!false && 1 != 2 || 0"), json!(true));
        assert_eq!(eval_str(r#"1 eq "1""#), json!(true));
        assert_eq!(eval_str(r#"1 is "1""#), json!(false));
        assert_eq!(eval_str("ndef $missing"), json!(true));
    }

    #[test]
    fn test_assignment_and_statements() {
        let mut state = State::new();
        let value = evaluate("$gold to 10; $gold += 5; _t = $gold * 2", &mut state).unwrap();
        assert_eq!(value, json!(30));
        assert_eq!(state.get("$gold"), Some(json!(15)));
        assert_eq!(state.get("_t"), Some(json!(30)));
        assert_eq!(evaluate("", &mut state).unwrap(), Value::Null);
    }

    #[test]
    fn test_errors() {
        let mut state = State::new();
        assert_eq!(evaluate("1 to 2", &mut state), Err(ExprError::BadAssignment));
        assert_eq!(evaluate("(1 + 2", &mut state), Err(ExprError::UnexpectedEnd));
        assert!(matches!(
            evaluate("1 # 2", &mut state),
            Err(ExprError::Syntax { pos: 2, .. })
        ));
        assert!(matches!(
            evaluate("'open", &mut state),
            Err(ExprError::Syntax { .. })
        ));
        assert_eq!(evaluate("1 / 0", &mut state), Err(ExprError::NotFinite));
        assert!(matches!(
            evaluate("frobnicate", &mut state),
            Err(ExprError::Syntax { .. })
        ));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let mut state = State::new();
        let nested = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(evaluate(&nested, &mut state), Ok(json!(1)));

        let too_deep = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(evaluate(&too_deep, &mut state), Err(ExprError::TooDeep(MAX_NESTING)));
        let negations = format!("{}true", "not ".repeat(100_000));
        assert_eq!(evaluate(&negations, &mut state), Err(ExprError::TooDeep(MAX_NESTING)));
        let long_sum = format!("1{}", " + 1".repeat(100_000));
        assert_eq!(evaluate(&long_sum, &mut state), Err(ExprError::TooDeep(MAX_NESTING)));
        assert_eq!(evaluate(&format!("1{}", " + 1".repeat(50)), &mut state), Ok(json!(51)));
    }

    #[test]
    fn test_truthiness_and_display() {
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(!is_truthy(&json!(0)));
        assert_eq!(to_display(&json!([1, "a"])), "1,a");
        assert_eq!(to_display(&json!(2.5)), "2.5");
    }
}
