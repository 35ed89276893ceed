//! `<<timed>>` and its `<<next>>` clauses: render each clause after its
//! delay, one after another.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::debug;

use crate::context::{MacroContext, ShadowHandler};
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::macros::{TimerSet, debug_modes, delay_arg, timer_set};
use crate::output::{DebugView, Element, Output};
use crate::registry::{MacroDefinition, Registry};
use crate::scheduler::{Event, TimerId};

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(
        &["timed"],
        MacroDefinition::new(timed)
            .asynchronous()
            .with_tags(&["next"])
            .with_data(TimerSet::default()),
    )
}

/// One clause waiting for its turn.
#[derive(Debug, Clone)]
pub struct TimedItem {
    pub name: String,
    pub source: String,
    pub delay: u64,
    pub content: String,
}

fn timed(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let Some(time) = ctx.args().text(0) else {
        ctx.error("no time value specified in <<timed>>", None);
        return Ok(());
    };
    let min_delay = engine.config().dom_delay_ms;
    let payload = ctx.payload();

    let mut items = VecDeque::with_capacity(payload.len());
    match delay_arg(&time, min_delay) {
        Ok(delay) => items.push_back(TimedItem {
            name: ctx.name().to_string(),
            source: ctx.source().to_string(),
            delay,
            content: payload[0].contents.clone(),
        }),
        Err(err) => {
            ctx.error(format!("{err} in <<timed>>"), None);
            return Ok(());
        }
    }

    for (i, clause) in payload.iter().enumerate().skip(1) {
        let delay = match clause.args.text(0) {
            None => items.back().map_or(min_delay, |item: &TimedItem| item.delay),
            Some(time) => match delay_arg(&time, min_delay) {
                Ok(delay) => delay,
                Err(err) => {
                    ctx.error(format!("{err} in <<next>> (#{i})"), None);
                    return Ok(());
                }
            },
        };
        items.push_back(TimedItem {
            name: clause.name.clone(),
            source: clause.source.clone(),
            delay,
            content: clause.contents.clone(),
        });
    }
    debug_modes(ctx, &["block"]);

    let transition = ctx
        .args()
        .text(1)
        .is_some_and(|arg| arg == "transition" || arg == "t8n");
    let wrapper = ctx.output().append_element("span");
    wrapper.add_class(&format!("macro-{}", ctx.name()));
    let debug = engine.config().debug;

    let handler = ctx.shadow_handler(engine, move |engine, item: &TimedItem| {
        let frag = Output::new();
        engine.wikify(&frag, &item.content);

        let mut target = wrapper.content();
        if debug && item.name == "next" {
            target = DebugView::new(&target, "macro", &item.name, &item.source).output();
        }
        if transition {
            let insert = insert_span(engine, &target, min_delay);
            target = insert.content();
        }
        target.append_all(&frag);
        Ok(())
    });

    register_timeout(engine, timer_set(ctx), handler, items);
    Ok(())
}

/// Append a transition span to `target` that settles after `delay`.
fn insert_span(engine: &Engine, target: &Output, delay: u64) -> Element {
    let insert = target.append_element("span");
    insert.add_class("macro-timed-insert macro-timed-in");
    let settling = insert.clone();
    engine.scheduler().set_timeout(delay, move |_, _| {
        settling.remove_class("macro-timed-in");
        Ok(())
    });
    insert
}

struct Chain {
    handler: ShadowHandler<TimedItem>,
    upcoming: RefCell<VecDeque<TimedItem>>,
    next: RefCell<Option<TimedItem>>,
    passage: String,
    turn: u64,
    timers: TimerSet,
}

fn register_timeout(
    engine: &Engine,
    timers: TimerSet,
    handler: ShadowHandler<TimedItem>,
    mut items: VecDeque<TimedItem>,
) {
    let Some(first) = items.pop_front() else {
        return;
    };
    let delay = first.delay;
    let (passage, turn) = {
        let state = engine.state();
        (state.passage().to_string(), state.turns())
    };
    let chain = Rc::new(Chain {
        handler,
        upcoming: RefCell::new(items),
        next: RefCell::new(Some(first)),
        passage,
        turn,
        timers: timers.clone(),
    });

    schedule(engine, chain, delay);
    if timers.len() == 1 {
        engine
            .scheduler()
            .one(Event::PassageInit, None, move |engine, _| {
                timers.clear_all(engine);
                Ok(())
            });
    }
}

fn schedule(engine: &Engine, chain: Rc<Chain>, delay: u64) -> TimerId {
    let timers = chain.timers.clone();
    let id = engine
        .scheduler()
        .set_timeout(delay, move |engine, id| fire(engine, &chain, id));
    timers.insert(id);
    id
}

/// Run the due item, scheduling its successor first so a slow or failing
/// item cannot stall the chain.
fn fire(engine: &Engine, chain: &Rc<Chain>, id: TimerId) -> Result<(), MacroError> {
    chain.timers.remove(id);

    let stale = {
        let state = engine.state();
        state.passage() != chain.passage || state.turns() != chain.turn
    };
    if stale {
        debug!(id, "stale timed chain dropped");
        return Ok(());
    }

    let Some(current) = chain.next.borrow_mut().take() else {
        return Ok(());
    };
    let upcoming = chain.upcoming.borrow_mut().pop_front();
    if let Some(item) = upcoming {
        let delay = item.delay;
        *chain.next.borrow_mut() = Some(item);
        schedule(engine, chain.clone(), delay);
    }

    chain.handler.invoke(engine, &current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;

    fn engine(start: &str) -> Engine {
        let engine = Engine::new(Config::default()).unwrap();
        engine.add_passage("Start", start);
        engine.add_passage("Elsewhere", "quiet");
        engine
    }

    #[test]
    fn test_clauses_render_in_sequence() {
        let engine = engine("<<timed 100ms>>a<<next>>b<<next 1s>>c<</timed>>");
        engine.navigate("Start").unwrap();
        assert_eq!(engine.display().text(), "");

        engine.advance(100);
        assert_eq!(engine.display().text(), "a");
        engine.advance(100);
        assert_eq!(engine.display().text(), "ab");
        engine.advance(999);
        assert_eq!(engine.display().text(), "ab");
        engine.advance(1);
        assert_eq!(engine.display().text(), "abc");
        assert_eq!(engine.scheduler().pending(), 0);
    }

    #[test]
    fn test_navigation_drops_the_chain() {
        let engine = engine("<<timed 100ms>>a<<next>>b<</timed>>");
        engine.navigate("Start").unwrap();
        engine.advance(100);
        engine.navigate("Elsewhere").unwrap();
        assert_eq!(engine.scheduler().pending(), 0);
        engine.advance(1000);
        assert_eq!(engine.display().text(), "quiet");
    }

    #[test]
    fn test_time_errors_name_the_clause() {
        let bad_next = engine("<<timed 1s>>a<<next later>>b<</timed>>");
        bad_next.navigate("Start").unwrap();
        assert_eq!(
            bad_next.display().errors(),
            vec!["<<timed>>: invalid time value syntax: \"later\" in <<next>> (#1)".to_string()]
        );

        let missing = engine("<<timed>>a<</timed>>");
        missing.navigate("Start").unwrap();
        assert_eq!(
            missing.display().errors(),
            vec!["<<timed>>: no time value specified in <<timed>>".to_string()]
        );
    }

    #[test]
    fn test_each_item_sees_captured_variables() {
        let engine = engine(
            "<<set _x to \"then\">><<capture _x>><<timed 50ms>><<print _x>><</timed>><</capture>><<set _x to \"now\">>",
        );
        engine.navigate("Start").unwrap();
        engine.advance(50);
        assert_eq!(engine.display().text(), "then");
        assert_eq!(engine.state().get("_x"), Some(serde_json::json!("now")));
    }
}
