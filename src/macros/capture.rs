//! `<<capture>>`: render a body with some variables shadowed, so deferred
//! handlers created inside it keep the values they saw.

use std::rc::Rc;

use crate::context::MacroContext;
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::patterns::VARIABLE_IN_TEXT;
use crate::registry::{MacroDefinition, Registry};
use crate::state::Overlay;

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(&["capture"], MacroDefinition::new(capture).container().skip_args())
}

fn capture(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let list = ctx.args().raw().trim();
    if list.is_empty() {
        ctx.error("no story/temporary variable list specified", None);
        return Ok(());
    }

    let names: Vec<&str> = VARIABLE_IN_TEXT.find_iter(list).map(|m| m.as_str()).collect();
    ctx.add_shadow(&names)?;

    let overlay: Overlay = {
        let state = engine.state();
        ctx.shadows()
            .into_iter()
            .map(|name| {
                let value = state.get(&name);
                (name, value)
            })
            .collect()
    };

    let _overlay = OverlayGuard::push(engine, overlay);
    engine.wikify(&ctx.output(), &ctx.payload()[0].contents);
    Ok(())
}

/// Keeps writes to the captured variables inside the body; the live values
/// come back when the guard drops.
struct OverlayGuard<'a> {
    engine: &'a Engine,
    depth: usize,
}

impl<'a> OverlayGuard<'a> {
    fn push(engine: &'a Engine, overlay: Overlay) -> Self {
        let mut state = engine.state_mut();
        let depth = state.overlay_depth();
        state.push_overlay(overlay);
        Self { engine, depth }
    }
}

impl Drop for OverlayGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.state_mut();
        while state.overlay_depth() > self.depth {
            state.pop_overlay();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::output::Output;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_capture_restores_live_values() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.state_mut().set("$x", json!("outside")).unwrap();

        let out = Output::new();
        engine.wikify(
            &out,
            "<<capture $x>><<set $x to \"inside\">><<print $x>><</capture>>|<<print $x>>",
        );
        assert_eq!(out.text(), "inside|outside");
        assert_eq!(engine.state().overlay_depth(), 0);
    }

    #[test]
    fn test_capture_requires_a_list() {
        let engine = Engine::new(Config::default()).unwrap();
        let out = Output::new();
        engine.wikify(&out, "<<capture>>x<</capture>>");
        assert_eq!(
            out.errors(),
            vec!["<<capture>>: no story/temporary variable list specified".to_string()]
        );
    }

    #[test]
    fn test_capture_in_loop_freezes_each_value() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.state_mut().set("$seen", json!("")).unwrap();
        let out = Output::new();
        engine.wikify(
            &out,
            concat!(
                "<<for _i range 3>><<capture _i>>",
                "<<link \"L\">><<set $seen to $seen + _i + \",\">><</link>>",
                "<</capture>><</for>>"
            ),
        );
        let links = out.find_by_class("macro-link");
        assert_eq!(links.len(), 3);

        engine.state_mut().set("_i", json!(99)).unwrap();
        for link in &links {
            assert!(engine.click(link).unwrap());
        }
        assert_eq!(engine.state().get("$seen"), Some(json!("0,1,2,")));
        assert_eq!(engine.state().get("_i"), Some(json!(99)));
    }
}
