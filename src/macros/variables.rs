//! `<<set>>`, its `<<run>>` alias, and `<<unset>>`.

use std::rc::Rc;

use crate::context::MacroContext;
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::expr;
use crate::macros::debug_modes;
use crate::patterns::VARIABLE_IN_TEXT;
use crate::registry::{MacroDef, MacroDefinition, Registry};

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(&["set"], MacroDefinition::new(set).skip_args())?;
    registry.add(&["run"], MacroDef::Alias("set".to_string()))?;
    registry.add(&["unset"], MacroDefinition::new(unset).skip_args())
}

fn set(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let expression = ctx.args().raw().trim();
    if expression.is_empty() {
        ctx.error("no expression specified", None);
        return Ok(());
    }

    let result = expr::evaluate(expression, &mut engine.state_mut());
    if let Err(err) = result {
        ctx.error(format!("bad evaluation: {err}"), None);
        return Ok(());
    }
    debug_modes(ctx, &["hidden"]);
    Ok(())
}

fn unset(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let list = ctx.args().raw().trim();
    if list.is_empty() {
        ctx.error("no story/temporary variable list specified", None);
        return Ok(());
    }

    let mut state = engine.state_mut();
    for name in VARIABLE_IN_TEXT.find_iter(list) {
        state.unset(name.as_str())?;
    }
    drop(state);
    debug_modes(ctx, &["hidden"]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::output::Output;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_set_run_and_unset() {
        let engine = Engine::new(Config::default()).unwrap();
        let out = Output::new();
        engine.wikify(&out, "<<set $gold to 5>><<run $gold += 1>><<set _t to $gold * 2>>");
        assert_eq!(out.text(), "");
        assert_eq!(engine.state().get("$gold"), Some(json!(6)));
        assert_eq!(engine.state().get("_t"), Some(json!(12)));

        engine.wikify(&out, "<<unset $gold, _t>>");
        assert!(!engine.state().has("$gold"));
        assert!(!engine.state().has("_t"));
        assert!(out.errors().is_empty());
    }

    #[test]
    fn test_errors_name_the_alias() {
        let engine = Engine::new(Config::default()).unwrap();
        let out = Output::new();
        engine.wikify(&out, "<<run>><<unset>>");
        assert_eq!(
            out.errors(),
            vec![
                "<<run>>: no expression specified".to_string(),
                "<<unset>>: no story/temporary variable list specified".to_string()
            ]
        );
    }

    #[test]
    fn test_debug_views_are_hidden() {
        let config = Config {
            debug: true,
            ..Config::default()
        };
        let engine = Engine::new(config).unwrap();
        let out = Output::new();
        engine.wikify(&out, "<<set $x to 1>>");

        let nodes = out.nodes();
        let crate::output::Node::Debug(view) = &nodes[0] else {
            panic!("expected a debug view, got {nodes:?}");
        };
        assert!(view.modes().contains("hidden"));
        assert_eq!(view.name(), "set");
    }
}
