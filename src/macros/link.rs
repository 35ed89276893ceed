//! `<<link>>` and `<<button>>`.

use std::rc::Rc;

use serde_json::Value;

use crate::context::{MacroContext, ShadowHandler};
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::expr;
use crate::output::{Element, Node, Output};
use crate::registry::{MacroDefinition, Registry};

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(
        &["link", "button"],
        MacroDefinition::new(link).container().asynchronous(),
    )
}

fn is_flagged(value: &Value, flag: &str) -> bool {
    value.get(flag).and_then(Value::as_bool).unwrap_or(false)
}

fn field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn link(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let is_button = ctx.name() == "button";
    let Some(first) = ctx.args().get(0) else {
        ctx.error(
            format!("no {} text specified", if is_button { "button" } else { "link" }),
            None,
        );
        return Ok(());
    };

    let element = Element::new(if is_button { "button" } else { "a" });
    let passage = if is_flagged(first, "isImage") {
        let image = element.content().append_element("img");
        if let Some(source) = field(first, "source") {
            image.set_attr("src", source);
        }
        element.add_class("link-image");
        field(first, "link")
    } else if is_flagged(first, "isLink") {
        element
            .content()
            .push_text(&field(first, "text").unwrap_or_default());
        if is_flagged(first, "external") {
            let href = field(first, "link").unwrap_or_default();
            element.add_class("link-external").set_attr("href", href);
            None
        } else {
            field(first, "link")
        }
    } else {
        engine.wikify(&element.content(), &expr::to_display(first));
        ctx.args().text(1)
    };

    match &passage {
        Some(title) => {
            element.set_attr("data-passage", title.as_str());
            element.add_class(if engine.has_passage(title) {
                "link-internal"
            } else {
                "link-broken"
            });
        }
        None if !element.has_class("link-external") => {
            element.add_class("link-internal");
        }
        None => {}
    }
    element.add_class(&format!("macro-{}", ctx.name()));

    let contents = ctx.payload()[0].contents.trim().to_string();
    let handler = if contents.is_empty() {
        ShadowHandler::new(ctx.clone(), None, engine)
    } else {
        ctx.shadow_handler(engine, move |engine, _: &()| run_payload(engine, &contents))
    };
    let handler = match passage.clone() {
        Some(title) => handler.with_done(move |engine, _| engine.navigate(&title)),
        None => handler,
    };

    engine.register_clickable(&element, handler, passage.is_some());
    ctx.output().append(Node::Element(element));
    Ok(())
}

/// Render a click payload for its side effects, failing if it rendered any
/// error.
fn run_payload(engine: &Engine, contents: &str) -> Result<(), MacroError> {
    let scratch = Output::new();
    engine.wikify(&scratch, contents);
    let errors = scratch.errors();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MacroError::message(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> Engine {
        let engine = Engine::new(Config::default()).unwrap();
        engine.add_passage("Start", "<<link \"Go\" \"Cave\">><<set $torch to true>><</link>>");
        engine.add_passage("Cave", "dark");
        engine
    }

    #[test]
    fn test_link_runs_payload_then_navigates_once() {
        let engine = engine();
        engine.navigate("Start").unwrap();

        let links = engine.display().find_by_class("macro-link");
        assert_eq!(links.len(), 1);
        let link = &links[0];
        assert_eq!(link.tag(), "a");
        assert_eq!(link.text(), "Go");
        assert_eq!(link.attr("data-passage").as_deref(), Some("Cave"));
        assert!(link.has_class("link-internal"));

        assert!(engine.click(link).unwrap());
        assert_eq!(engine.state().get("$torch"), Some(json!(true)));
        assert_eq!(engine.state().passage(), "Cave");
        assert_eq!(engine.display().text(), "dark");
        assert!(!engine.click(link).unwrap());
    }

    #[test]
    fn test_wiki_link_forms_and_broken_targets() {
        let engine = engine();
        let out = Output::new();
        engine.wikify(
            &out,
            "<<button [[Enter|Cave]]>><</button>><<link [[Nowhere]]>><</link>><<link [[site|https://example.com]]>><</link>>",
        );

        let button = &out.find_by_class("macro-button")[0];
        assert_eq!(button.tag(), "button");
        assert_eq!(button.text(), "Enter");
        assert!(button.has_class("link-internal"));

        let links = out.find_by_class("macro-link");
        assert!(links[0].has_class("link-broken"));
        assert_eq!(links[1].attr("href").as_deref(), Some("https://example.com"));
        assert!(links[1].has_class("link-external"));
    }

    #[test]
    fn test_repeatable_link_without_passage() {
        let engine = engine();
        engine.state_mut().set("$n", json!(0)).unwrap();
        let out = Output::new();
        engine.wikify(&out, "<<link \"+1\">><<set $n += 1>><</link>>");

        let link = &out.find_by_class("macro-link")[0];
        assert!(link.attr("data-passage").is_none());
        engine.click(link).unwrap();
        engine.click(link).unwrap();
        assert_eq!(engine.state().get("$n"), Some(json!(2)));
    }

    #[test]
    fn test_payload_errors_fail_the_click() {
        let engine = engine();
        let out = Output::new();
        engine.wikify(&out, "<<link \"bad\">><<nope>><</link>>");
        let link = &out.find_by_class("macro-link")[0];
        assert_eq!(
            engine.click(link),
            Err(MacroError::message("macro <<nope>> does not exist"))
        );
    }

    #[test]
    fn test_missing_text() {
        let engine = engine();
        let out = Output::new();
        engine.wikify(&out, "<<button>><</button>>");
        assert_eq!(
            out.errors(),
            vec!["<<button>>: no button text specified".to_string()]
        );
    }
}
