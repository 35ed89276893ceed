//! Macro argument parsing.
//!
//! The raw argument text of a tag is split by a [`Lexer`] grammar into
//! barewords, quoted strings, backquoted expressions and `[[...]]` markup,
//! then each item is converted into a value.

use std::ops::Index;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ArgsError;
use crate::expr;
use crate::lexer::{Lexer, State as LexState};
use crate::patterns;
use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgItem {
    Error,
    Bareword,
    Expression,
    String,
    SquareBracket,
}

static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s$").expect("valid space regex"));
static NOT_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S$").expect("valid non-space regex"));

/// Parsed arguments plus the raw text they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    list: Vec<Value>,
    raw: String,
}

impl Args {
    /// Arguments for a definition that asked to skip parsing.
    pub fn unparsed(raw: &str) -> Self {
        Self {
            list: Vec::new(),
            raw: raw.to_string(),
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        let raw = values
            .iter()
            .map(expr::to_display)
            .collect::<Vec<_>>()
            .join(" ");
        Self { list: values, raw }
    }

    pub fn parse(raw: &str, state: &mut State) -> Result<Self, ArgsError> {
        let mut list = Vec::new();
        for item in Lexer::new(raw, LexState(lex_space)).run() {
            list.push(convert(item.kind, item.text, item.message, state)?);
        }
        Ok(Self {
            list,
            raw: raw.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.list.get(index)
    }

    /// Display form of the argument at `index`.
    pub fn text(&self, index: usize) -> Option<String> {
        self.list.get(index).map(expr::to_display)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.list.iter()
    }
}

impl Index<usize> for Args {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.list[index]
    }
}

// Lexing functions.

fn slurp_quote(lexer: &mut Lexer<ArgItem>, end: char) -> bool {
    loop {
        match lexer.next() {
            Some('\\') => match lexer.next() {
                None | Some('\n') => return false,
                Some(_) => {}
            },
            None | Some('\n') => return false,
            Some(ch) if ch == end => return true,
            Some(_) => {}
        }
    }
}

fn lex_space(lexer: &mut Lexer<ArgItem>) -> Option<LexState<ArgItem>> {
    lexer.accept_run_re(&SPACE);
    lexer.ignore();

    match lexer.next()? {
        '`' => Some(LexState(lex_expression)),
        '"' => Some(LexState(lex_double_quote)),
        '\'' => Some(LexState(lex_single_quote)),
        '[' => Some(LexState(lex_square_bracket)),
        _ => Some(LexState(lex_bareword)),
    }
}

fn lex_expression(lexer: &mut Lexer<ArgItem>) -> Option<LexState<ArgItem>> {
    if !slurp_quote(lexer, '`') {
        return lexer.error(ArgItem::Error, "unterminated backquote expression");
    }
    lexer.emit(ArgItem::Expression);
    Some(LexState(lex_space))
}

fn lex_double_quote(lexer: &mut Lexer<ArgItem>) -> Option<LexState<ArgItem>> {
    if !slurp_quote(lexer, '"') {
        return lexer.error(ArgItem::Error, "unterminated double quoted string");
    }
    lexer.emit(ArgItem::String);
    Some(LexState(lex_space))
}

fn lex_single_quote(lexer: &mut Lexer<ArgItem>) -> Option<LexState<ArgItem>> {
    if !slurp_quote(lexer, '\'') {
        return lexer.error(ArgItem::Error, "unterminated single quoted string");
    }
    lexer.emit(ArgItem::String);
    Some(LexState(lex_space))
}

fn lex_square_bracket(lexer: &mut Lexer<ArgItem>) -> Option<LexState<ArgItem>> {
    const IMG_META: &str = "<>IiMmGg";
    let what = if lexer.accept(IMG_META) {
        lexer.accept_run(IMG_META);
        "image"
    } else {
        "link"
    };

    if !lexer.accept("[") {
        return lexer.error(ArgItem::Error, format!("malformed {what} markup"));
    }

    // Both opening brackets.
    lexer.depth = 2;

    loop {
        match lexer.next() {
            Some('\\') => match lexer.next() {
                None | Some('\n') => {
                    return lexer.error(ArgItem::Error, format!("unterminated {what} markup"));
                }
                Some(_) => {}
            },
            None | Some('\n') => {
                return lexer.error(ArgItem::Error, format!("unterminated {what} markup"));
            }
            Some('[') => lexer.depth += 1,
            Some(']') => {
                lexer.depth -= 1;
                if lexer.depth < 0 {
                    return lexer.error(ArgItem::Error, "unexpected right square bracket ']'");
                }
                if lexer.depth == 1 {
                    if lexer.next() == Some(']') {
                        lexer.depth -= 1;
                        break;
                    }
                    lexer.backup(1);
                }
            }
            Some(_) => {}
        }
    }

    lexer.emit(ArgItem::SquareBracket);
    Some(LexState(lex_space))
}

fn lex_bareword(lexer: &mut Lexer<ArgItem>) -> Option<LexState<ArgItem>> {
    lexer.accept_run_re(&NOT_SPACE);
    lexer.emit(ArgItem::Bareword);
    if lexer.at_eof() {
        None
    } else {
        Some(LexState(lex_space))
    }
}

// Conversion.

fn convert(
    kind: ArgItem,
    text: String,
    message: Option<String>,
    state: &mut State,
) -> Result<Value, ArgsError> {
    match kind {
        ArgItem::Error => Err(ArgsError::Lex {
            text,
            message: message.unwrap_or_default(),
        }),
        ArgItem::Bareword => Ok(convert_bareword(&text, state)),
        ArgItem::Expression => {
            let inner = text[1..text.len() - 1].trim();
            if inner.is_empty() {
                return Ok(Value::Null);
            }
            expr::evaluate(inner, state).map_err(|error| ArgsError::Expression {
                text: inner.to_string(),
                error,
            })
        }
        ArgItem::String => expr::unquote(&text)
            .map(Value::String)
            .map_err(|e| ArgsError::BadString {
                text: text.clone(),
                message: e.to_string(),
            }),
        ArgItem::SquareBracket => parse_square_bracket(&text).ok_or_else(|| ArgsError::Lex {
            text: text.clone(),
            message: "malformed square bracket markup".to_string(),
        }),
    }
}

fn convert_bareword(word: &str, state: &State) -> Value {
    if patterns::is_variable(word) {
        return state.get(word).unwrap_or(Value::Null);
    }
    match word {
        "null" | "undefined" | "NaN" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            let numeric = word
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-'));
            match word.parse::<f64>() {
                Ok(n) if numeric => expr::number(n).unwrap_or_else(|_| Value::String(word.to_string())),
                _ => Value::String(word.to_string()),
            }
        }
    }
}

/// Convert `[[text|link]]`, `[[text->link]]`, `[[link<-text]]`, `[[link]]`
/// (optionally followed by a `[setter]`) or `[img[source]]` into an object.
fn parse_square_bracket(markup: &str) -> Option<Value> {
    let mut object = Map::new();

    if let Some(rest) = markup.strip_prefix("[[") {
        let body = rest.strip_suffix("]]")?;
        let (target, setter) = match body.split_once("][") {
            Some((target, setter)) => (target, Some(setter)),
            None => (body, None),
        };
        let (text, link) = if let Some((text, link)) = target.split_once('|') {
            (Some(text), link)
        } else if let Some((text, link)) = target.rsplit_once("->") {
            (Some(text), link)
        } else if let Some((link, text)) = target.split_once("<-") {
            (Some(text), link)
        } else {
            (None, target)
        };

        object.insert("isLink".into(), Value::Bool(true));
        object.insert("count".into(), Value::from(if text.is_some() { 2 } else { 1 }));
        object.insert("link".into(), Value::String(link.to_string()));
        object.insert("text".into(), Value::String(text.unwrap_or(link).to_string()));
        object.insert("external".into(), Value::Bool(link.contains("://")));
        if let Some(setter) = setter {
            object.insert("setter".into(), Value::String(setter.to_string()));
        }
        return Some(Value::Object(object));
    }

    let open = markup.find("[")?;
    let inner = markup.get(open + 1..)?.strip_prefix('[')?;
    let source = inner.strip_suffix("]]")?;
    object.insert("isImage".into(), Value::Bool(true));
    object.insert("source".into(), Value::String(source.to_string()));
    Some(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(raw: &str) -> Result<Args, ArgsError> {
        let mut state = State::new();
        state.set("$name", json!("Sam")).unwrap();
        Args::parse(raw, &mut state)
    }

    #[test]
    fn test_barewords_convert() {
        let args = parse("1s 42 true null $name word -3.5").unwrap();
        assert_eq!(
            args.iter().cloned().collect::<Vec<_>>(),
            vec![
                json!("1s"),
                json!(42),
                json!(true),
                Value::Null,
                json!("Sam"),
                json!("word"),
                json!(-3.5)
            ]
        );
        assert_eq!(args.raw(), "1s 42 true null $name word -3.5");
    }

    #[test]
    fn test_quotes_and_expressions() {
        let args = parse(r#""two words" 'it\'s' `1 + 2` ``"#).unwrap();
        assert_eq!(args.len(), 4);
        assert_eq!(args[0], json!("two words"));
        assert_eq!(args[1], json!("it's"));
        assert_eq!(args[2], json!(3));
        assert_eq!(args[3], Value::Null);
    }

    #[test]
    fn test_link_markup() {
        let args = parse("[[Go home|Home]] [[Cave]]").unwrap();
        assert_eq!(args[0]["link"], json!("Home"));
        assert_eq!(args[0]["text"], json!("Go home"));
        assert_eq!(args[0]["count"], json!(2));
        assert_eq!(args[1]["text"], json!("Cave"));
        assert_eq!(args[1]["count"], json!(1));
    }

    #[test]
    fn test_lexing_errors_are_reported() {
        let err = parse(r#""open"#).unwrap_err();
        assert_eq!(
            err,
            ArgsError::Lex {
                text: "\"open".to_string(),
                message: "unterminated double quoted string".to_string()
            }
        );
        assert!(parse("[[broken").is_err());
        assert!(parse("`$x to`").is_err());
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   ").unwrap().is_empty());
        assert_eq!(Args::unparsed("$a, $b").raw(), "$a, $b");
    }
}
