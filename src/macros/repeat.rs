//! `<<repeat>>` and `<<stop>>`.

use std::rc::Rc;

use tracing::debug;

use crate::context::{MacroContext, ShadowHandler};
use crate::engine::{Engine, LoopBreak};
use crate::error::{MacroError, RegistryError};
use crate::macros::{TimerSet, debug_modes, delay_arg, timer_set};
use crate::output::Output;
use crate::registry::{MacroDefinition, Registry};
use crate::scheduler::{Event, TimerId};

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(
        &["repeat"],
        MacroDefinition::new(repeat)
            .container()
            .asynchronous()
            .with_data(TimerSet::default()),
    )?;
    registry.add(&["stop"], MacroDefinition::new(stop).skip_args())
}

fn is_transition(arg: Option<String>) -> bool {
    arg.is_some_and(|arg| arg == "transition" || arg == "t8n")
}

fn repeat(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let Some(time) = ctx.args().text(0) else {
        ctx.error("no time value specified", None);
        return Ok(());
    };
    let min_delay = engine.config().dom_delay_ms;
    let delay = match delay_arg(&time, min_delay) {
        Ok(delay) => delay,
        Err(err) => {
            ctx.error(err, None);
            return Ok(());
        }
    };
    debug_modes(ctx, &["block"]);

    let transition = is_transition(ctx.args().text(1));
    let wrapper = ctx.output().append_element("span");
    wrapper.add_class(&format!("macro-{}", ctx.name()));
    let contents = ctx.payload()[0].contents.clone();

    let handler = ctx.shadow_handler(engine, move |engine, _: &()| {
        let frag = Output::new();
        engine.wikify(&frag, &contents);

        if transition {
            let insert = wrapper.content().append_element("span");
            insert.add_class("macro-repeat-insert macro-repeat-in");
            insert.content().append_all(&frag);
            engine.scheduler().set_timeout(min_delay, move |_, _| {
                insert.remove_class("macro-repeat-in");
                Ok(())
            });
        } else {
            wrapper.content().append_all(&frag);
        }
        Ok(())
    });

    register_interval(engine, timer_set(ctx), handler, delay);
    Ok(())
}

/// Sets the ticking timer as the current repeat and clears loop control on
/// both sides of a tick.
struct RepeatTick<'a> {
    engine: &'a Engine,
    previous: Option<TimerId>,
}

impl<'a> RepeatTick<'a> {
    fn enter(engine: &'a Engine, id: TimerId) -> Self {
        let mut temp = engine.temp_mut();
        temp.loop_break = None;
        let previous = temp.repeat_timer_id.replace(id);
        Self { engine, previous }
    }
}

impl Drop for RepeatTick<'_> {
    fn drop(&mut self) {
        let mut temp = self.engine.temp_mut();
        temp.repeat_timer_id = self.previous;
        temp.loop_break = None;
    }
}

fn register_interval(engine: &Engine, timers: TimerSet, handler: ShadowHandler, delay: u64) {
    let (passage, turn) = {
        let state = engine.state();
        (state.passage().to_string(), state.turns())
    };

    let family = timers.clone();
    let id = engine.scheduler().set_interval(delay, move |engine, id| {
        let stale = {
            let state = engine.state();
            state.passage() != passage || state.turns() != turn
        };
        if stale {
            debug!(id, "stale repeat cancelled");
            engine.scheduler().clear_timer(id);
            family.remove(id);
            return Ok(());
        }

        let _tick = RepeatTick::enter(engine, id);
        handler.invoke(engine, &())
    });

    if timers.insert(id) == 1 {
        engine
            .scheduler()
            .one(Event::PassageInit, None, move |engine, _| {
                timers.clear_all(engine);
                Ok(())
            });
    }
}

fn stop(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let current = engine.temp().repeat_timer_id;
    let Some(id) = current else {
        ctx.error(
            "must only be used in conjunction with its parent macro <<repeat>>",
            None,
        );
        return Ok(());
    };

    engine.scheduler().clear_timer(id);
    let repeat = engine.registry().get("repeat");
    if let Some(timers) = repeat.as_ref().and_then(|r| r.def.data::<TimerSet>()) {
        timers.remove(id);
    }
    engine.temp_mut().loop_break = Some(LoopBreak::Break);
    debug_modes(ctx, &["hidden"]);
    Ok(())
}
