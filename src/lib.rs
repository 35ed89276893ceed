//! A passage macro engine: a registry of named macros, per-call execution
//! contexts, and a renderer that expands `<<name args>>` tags in passage
//! source into an output tree.
//!
//! ```
//! use passage_macros::{Config, Engine, MacroDefinition};
//! use passage_macros::output::Output;
//!
//! let engine = Engine::new(Config::default()).unwrap();
//! engine
//!     .registry_mut()
//!     .add(
//!         &["greet"],
//!         MacroDefinition::new(|_, ctx| {
//!             let name = ctx.args().text(0).unwrap_or_default();
//!             ctx.output().push_text(&format!("hi {name}"));
//!             Ok(())
//!         }),
//!     )
//!     .unwrap();
//!
//! let out = Output::new();
//! engine.wikify(&out, "<<greet \"Sam\">>");
//! assert_eq!(out.text(), "hi Sam");
//! ```

pub mod args;
pub mod ast;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod expr;
pub mod lexer;
pub mod macros;
pub mod output;
pub mod parser;
pub mod patterns;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use args::Args;
pub use config::Config;
pub use context::{ContextData, MacroContext, PayloadClause, ShadowHandler};
pub use engine::{Engine, LoopBreak, TempState};
pub use error::{ArgsError, ContextError, ExprError, MacroError, ParseError, RegistryError, TimeError};
pub use lexer::Lexer;
pub use output::{Element, Output};
pub use registry::{MacroDef, MacroDefinition, MacroRef, Registry, Tags};
pub use scheduler::{Event, Scheduler, TimerId};
pub use state::State;
