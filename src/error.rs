//! Error types for every layer of the engine.
//!
//! Registration failures are returned at definition time, invocation failures
//! are rendered inline by the renderer, and lexer failures never surface here
//! at all (they are error-kind tokens).

use thiserror::Error;

use crate::parser::Rule;

/// Failures raised while adding, aliasing or removing macro definitions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("invalid macro name \"{0}\"")]
    InvalidName(String),

    #[error("cannot clobber existing macro <<{0}>>")]
    ClobberMacro(String),

    #[error("cannot clobber child tag <<{name}>> of parent macro{} <<{}>>", plural(.parents), .parents.join(">>, <<"))]
    ClobberTag { name: String, parents: Vec<String> },

    #[error("cannot create alias of nonexistent macro <<{0}>>")]
    MissingAliasTarget(String),

    #[error("invalid child tag name \"{tag}\" for macro <<{parent}>>")]
    InvalidTagName { parent: String, tag: String },

    #[error("cannot register tag <<{0}>> for an existing macro")]
    TagIsMacro(String),

    #[error("no parent specified")]
    NoParent,

    #[error("cannot remove child tag <<{name}>> of parent macro{} <<{}>>", plural(.parents), .parents.join(">>, <<"))]
    RemoveTag { name: String, parents: Vec<String> },
}

fn plural(list: &[String]) -> &'static str {
    if list.len() == 1 { "" } else { "s" }
}

/// Failures splitting passage source into text and macro tags.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Grammar(Box<pest::error::Error<Rule>>),

    #[error("no passage found in source")]
    MissingPassage,
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        Self::Grammar(Box::new(err))
    }
}

/// Failures raised while building a [`crate::context::MacroContext`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("context object missing required properties: {0}")]
    MissingProperties(&'static str),

    #[error("invalid variable name \"{0}\"")]
    InvalidVariable(String),
}

/// Failures converting a raw argument string into macro arguments.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgsError {
    #[error("unable to parse macro argument \"{text}\": {message}")]
    Lex { text: String, message: String },

    #[error("unable to parse macro argument expression \"{text}\": {error}")]
    Expression { text: String, error: ExprError },

    #[error("unable to parse macro argument string {text}: {message}")]
    BadString { text: String, message: String },
}

/// Failures lexing, parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("{message} (pos: {pos})")]
    Syntax { message: String, pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("invalid assignment target")]
    BadAssignment,

    #[error("{0}")]
    Type(String),

    #[error("numeric result is not finite")]
    NotFinite,

    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Failures converting a CSS time value into milliseconds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeError {
    #[error("invalid time value syntax: \"{0}\"")]
    Syntax(String),

    #[error("invalid time value: \"{0}\"")]
    Range(String),
}

/// Error returned by macro handlers and deferred callbacks.
///
/// A handler that wants to report a user-facing problem calls
/// [`crate::context::MacroContext::error`] and returns `Ok(())`; an `Err` is
/// for failures the renderer must wrap in a `cannot execute macro` view.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MacroError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Args(#[from] ArgsError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("{0}")]
    Message(String),
}

impl MacroError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}
