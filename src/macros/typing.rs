//! `<<type>>`: reveal rendered content one character at a time.
//!
//! Every `<<type>>` call in a moment joins a queue kept in
//! [`TempState`](crate::engine::TempState). Only the head of the queue
//! types; when it stops, the next one starts, and when the queue runs dry
//! a [`Event::TypingComplete`] event is triggered.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::debug;

use crate::context::{MacroContext, ShadowHandler};
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::macros::{checked_delay, debug_modes};
use crate::output::{Element, Node, Output};
use crate::patterns::css_time_to_ms;
use crate::registry::{MacroDefinition, Registry};
use crate::scheduler::{Event, TimerId};

/// Listener namespace shared by every `<<type>>` call.
const NAMESPACE: &str = "macro-type";

/// Default delay before typing starts, in milliseconds.
const DEFAULT_START: u64 = 400;

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(
        &["type"],
        MacroDefinition::new(type_macro)
            .container()
            .asynchronous()
            .with_data(TypeIds::default()),
    )
}

#[derive(Debug, Default)]
struct TypeIds(Cell<u64>);

impl TypeIds {
    fn next(&self) -> u64 {
        let id = self.0.get();
        self.0.set(id + 1);
        id
    }
}

/// A queued `<<type>>` call.
#[derive(Debug)]
pub(crate) struct TypeJob {
    pub(crate) id: u64,
    pub(crate) handler: Rc<ShadowHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Default,
    Keep,
    None,
}

#[derive(Debug)]
struct TypeOptions {
    class: Option<String>,
    element_id: Option<String>,
    tag: String,
    skip_key: String,
    start: u64,
    cursor: Cursor,
}

fn parse_options(ctx: &MacroContext, skip_key: &str) -> Result<Result<TypeOptions, String>, MacroError> {
    let mut options = TypeOptions {
        class: None,
        element_id: None,
        tag: "div".to_string(),
        skip_key: skip_key.to_string(),
        start: DEFAULT_START,
        cursor: Cursor::Default,
    };

    let args = ctx.args();
    let mut rest = (1..args.len()).filter_map(|i| args.text(i));
    while let Some(option) = rest.next() {
        match option.as_str() {
            "class" => {
                let Some(class) = rest.next() else {
                    return Ok(Err("class option missing required class name(s)".into()));
                };
                if class.is_empty() {
                    return Err(MacroError::message(
                        "class option class name(s) must be non-empty (received: \"\")",
                    ));
                }
                options.class = Some(class);
            }
            "element" => {
                let Some(tag) = rest.next() else {
                    return Ok(Err("element option missing required element tag name".into()));
                };
                if tag.is_empty() {
                    return Err(MacroError::message(
                        "element option tag name must be non-empty (received: \"\")",
                    ));
                }
                options.tag = tag;
            }
            "id" => {
                let Some(id) = rest.next() else {
                    return Ok(Err("id option missing required ID".into()));
                };
                if id.is_empty() {
                    return Err(MacroError::message(
                        "id option ID must be non-empty (received: \"\")",
                    ));
                }
                options.element_id = Some(id);
            }
            "keep" => options.cursor = Cursor::Keep,
            "none" => options.cursor = Cursor::None,
            "skipkey" => {
                let Some(key) = rest.next() else {
                    return Ok(Err("skipkey option missing required key value".into()));
                };
                if key.is_empty() {
                    return Err(MacroError::message(
                        "skipkey option key value must be non-empty (received: \"\")",
                    ));
                }
                options.skip_key = key;
            }
            "start" => {
                let Some(time) = rest.next() else {
                    return Ok(Err("start option missing required time value".into()));
                };
                let start = css_time_to_ms(&time)?;
                if start < 0.0 {
                    return Err(MacroError::message(format!(
                        "start option time value must be non-negative (received: {time})"
                    )));
                }
                options.start = checked_delay(start, &time)?;
            }
            other => return Ok(Err(format!("unknown option: {other}"))),
        }
    }
    Ok(Ok(options))
}

fn type_macro(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let Some(speed_arg) = ctx.args().text(0) else {
        ctx.error("no speed specified", None);
        return Ok(());
    };
    let speed = css_time_to_ms(&speed_arg)?;
    if speed < 0.0 {
        ctx.error(
            format!("speed time value must be non-negative (received: {speed_arg})"),
            None,
        );
        return Ok(());
    }
    let speed = match checked_delay(speed, &speed_arg) {
        Ok(speed) => speed,
        Err(err) => {
            ctx.error(err, None);
            return Ok(());
        }
    };
    let options = match parse_options(ctx, &engine.config().type_skip_key)? {
        Ok(options) => options,
        Err(message) => {
            ctx.error(message, None);
            return Ok(());
        }
    };

    let contents = ctx.payload()[0].contents.clone();
    if contents.trim().is_empty() {
        return Ok(());
    }
    debug_modes(ctx, &["block"]);

    let class_name = format!("macro-{}", ctx.name());
    let parent = ctx.output();
    let target = parent.append_element(&options.tag);
    target.add_class(&format!("{class_name} {class_name}-target"));

    let start_typing = {
        let mut temp = engine.temp_mut();
        let queue = temp.type_queue.get_or_insert_with(|| {
            engine.scheduler().off(None, NAMESPACE);
            engine
                .scheduler()
                .one(Event::PassageInit, Some(NAMESPACE), |engine, _| {
                    engine.scheduler().off(None, NAMESPACE);
                    Ok(())
                });
            VecDeque::new()
        });
        queue.is_empty()
    };

    let id = ctx.definition().data::<TypeIds>().map_or(0, TypeIds::next);
    let run = TypeRun {
        id,
        speed,
        options,
        class_name,
        contents,
        parent,
        target,
    };
    let handler = ctx.shadow_handler(engine, move |engine, _: &()| run.start(engine));

    engine
        .temp_mut()
        .type_queue
        .get_or_insert_with(VecDeque::new)
        .push_back(TypeJob {
            id,
            handler: Rc::new(handler),
        });

    if start_typing {
        if engine.is_playing() {
            engine
                .scheduler()
                .one(Event::PassageEnd, Some(NAMESPACE), |engine, _| run_first(engine));
        } else {
            run_first(engine)?;
        }
    }
    Ok(())
}

/// Start the job at the head of the queue.
fn run_first(engine: &Engine) -> Result<(), MacroError> {
    let head = engine
        .temp()
        .type_queue
        .as_ref()
        .and_then(VecDeque::front)
        .map(|job| job.handler.clone());
    match head {
        Some(handler) => handler.invoke(engine, &()),
        None => Ok(()),
    }
}

/// Everything a queued call needs once its turn comes.
struct TypeRun {
    id: u64,
    speed: u64,
    options: TypeOptions,
    class_name: String,
    contents: String,
    parent: Output,
    target: Element,
}

impl TypeRun {
    fn start(&self, engine: &Engine) -> Result<(), MacroError> {
        let wrapper = Element::new(&self.options.tag);
        wrapper.add_class(&self.class_name);
        if let Some(id) = &self.options.element_id {
            wrapper.set_attr("id", id.as_str());
        }
        if let Some(class) = &self.options.class {
            wrapper.add_class(class);
        }
        engine.wikify(&wrapper.content(), &self.contents);

        let (passage, turn) = {
            let state = engine.state();
            (state.passage().to_string(), state.turns())
        };
        let skip = self.speed == 0
            || (!engine.config().type_visited_passages && engine.state().visited_before(&passage))
            || !wrapper.content().errors().is_empty();

        self.parent
            .replace_element(&self.target, Node::Element(wrapper.clone()));

        if skip {
            debug!(id = self.id, "typing skipped");
            let more = {
                let mut temp = engine.temp_mut();
                temp.type_queue.as_mut().is_some_and(|queue| {
                    queue.pop_front();
                    !queue.is_empty()
                })
            };
            return if more { run_first(engine) } else { Ok(()) };
        }

        let cursor_class = format!("{}-cursor", self.class_name);
        if self.options.cursor != Cursor::None {
            wrapper.add_class(&cursor_class);
        }
        let typing = Rc::new(Typing {
            id: self.id,
            typer: RefCell::new(Typer::new(&wrapper)),
            wrapper,
            cursor_class,
            done_class: format!("{}-done", self.class_name),
            keep_cursor: self.options.cursor == Cursor::Keep,
            passage,
            turn,
            stopped: Cell::new(false),
        });

        let scheduler = engine.scheduler();
        scheduler.off(Some(Event::Keydown), NAMESPACE);
        let skipper = typing.clone();
        let skip_key = self.options.skip_key.clone();
        scheduler.on(Event::Keydown, Some(NAMESPACE), move |engine, key| {
            if key == skip_key {
                engine.scheduler().off(Some(Event::Keydown), NAMESPACE);
                skipper.typer.borrow_mut().finish();
            }
            Ok(())
        });
        scheduler.one(Event::TypingStop, Some(NAMESPACE), |engine, _| {
            let queued = engine.temp().type_queue.as_ref().map(VecDeque::len);
            match queued {
                Some(0) => engine.trigger(Event::TypingComplete, ""),
                Some(_) => run_first(engine)?,
                None => {}
            }
            Ok(())
        });

        let speed = self.speed;
        if self.options.start > 0 {
            scheduler.set_timeout(self.options.start, move |engine, _| {
                typing.begin(engine, speed);
                Ok(())
            });
        } else {
            typing.begin(engine, speed);
        }
        Ok(())
    }
}

/// One call that is actively typing.
struct Typing {
    id: u64,
    typer: RefCell<Typer>,
    wrapper: Element,
    cursor_class: String,
    done_class: String,
    keep_cursor: bool,
    passage: String,
    turn: u64,
    stopped: Cell<bool>,
}

impl Typing {
    fn is_stale(&self, engine: &Engine) -> bool {
        let state = engine.state();
        state.passage() != self.passage || state.turns() != self.turn
    }

    fn begin(self: &Rc<Self>, engine: &Engine, speed: u64) {
        if self.is_stale(engine) {
            self.stopped.set(true);
            return;
        }
        engine.trigger(Event::TypingStart, "");
        let typed = self.typer.borrow_mut().type_next();
        if !typed {
            self.stop(engine);
            return;
        }

        let typing = self.clone();
        engine.scheduler().set_interval(speed, move |engine, id| {
            typing.tick(engine, id);
            Ok(())
        });
    }

    fn tick(&self, engine: &Engine, id: TimerId) {
        if self.stopped.get() {
            engine.scheduler().clear_timer(id);
            return;
        }
        if self.is_stale(engine) {
            debug!(id = self.id, "stale typing cancelled");
            self.stopped.set(true);
            engine.scheduler().clear_timer(id);
            return;
        }

        let typed = self.typer.borrow_mut().type_next();
        if !typed {
            engine.scheduler().clear_timer(id);
            self.stop(engine);
        }
    }

    fn stop(&self, engine: &Engine) {
        if self.stopped.replace(true) {
            return;
        }
        {
            let mut temp = engine.temp_mut();
            if let Some(queue) = temp.type_queue.as_mut() {
                if queue.front().is_some_and(|job| job.id == self.id) {
                    queue.pop_front();
                }
            }
        }
        engine.trigger(Event::TypingStop, "");

        self.wrapper.remove_class(&self.cursor_class);
        self.wrapper.add_class(&self.done_class);
        if self.keep_cursor {
            self.wrapper.add_class(&self.cursor_class);
        }
    }
}

/// Reveals the text of an element's rendered content one character per
/// call, then puts the original nodes back.
struct Typer {
    wrapper: Element,
    full: Output,
    chars: Vec<char>,
    typed: usize,
    done: bool,
}

impl Typer {
    /// Takes the current content of `wrapper`, leaving it empty.
    fn new(wrapper: &Element) -> Self {
        let full = Output::new();
        full.append_all(&wrapper.content());
        let chars = full.text().chars().collect();
        Self {
            wrapper: wrapper.clone(),
            full,
            chars,
            typed: 0,
            done: false,
        }
    }

    /// Type the next character. Returns `false` once everything is shown.
    fn type_next(&mut self) -> bool {
        if self.done {
            return false;
        }
        let Some(ch) = self.chars.get(self.typed) else {
            self.finish();
            return false;
        };
        self.wrapper.content().push_text(ch.encode_utf8(&mut [0; 4]));
        self.typed += 1;
        true
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let content = self.wrapper.content();
        content.clear();
        content.append_all(&self.full);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;

    fn engine_with(config: Config, start: &str) -> Engine {
        let engine = Engine::new(config).unwrap();
        engine.add_passage("Start", start);
        engine.add_passage("Other", "other");
        engine
    }

    fn engine(start: &str) -> Engine {
        engine_with(Config::default(), start)
    }

    fn count(engine: &Engine, event: Event) -> Rc<Cell<usize>> {
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        engine.scheduler().on(event, None, move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        seen
    }

    #[test]
    fn test_types_one_character_per_tick() {
        let engine = engine("<<type 10ms start 0ms>>abc<</type>>");
        let completed = count(&engine, Event::TypingComplete);
        engine.navigate("Start").unwrap();
        assert_eq!(engine.display().text(), "a");

        engine.advance(10);
        assert_eq!(engine.display().text(), "ab");
        engine.advance(10);
        assert_eq!(engine.display().text(), "abc");
        assert_eq!(completed.get(), 0);

        engine.advance(10);
        let wrapper = &engine.display().find_by_class("macro-type")[0];
        assert!(wrapper.has_class("macro-type-done"));
        assert!(!wrapper.has_class("macro-type-cursor"));
        assert_eq!(completed.get(), 1);
        assert_eq!(engine.scheduler().pending(), 0);
    }

    #[test]
    fn test_queue_types_in_order() {
        let engine = engine("<<type 10ms start 0ms>>ab<</type>>|<<type 10ms start 0ms>>cd<</type>>");
        let completed = count(&engine, Event::TypingComplete);
        engine.navigate("Start").unwrap();
        assert_eq!(engine.display().text(), "a|");

        engine.advance(10);
        assert_eq!(engine.display().text(), "ab|");
        engine.advance(10);
        assert_eq!(engine.display().text(), "ab|c");
        engine.advance(10);
        assert_eq!(engine.display().text(), "ab|cd");
        assert_eq!(completed.get(), 0);
        engine.advance(10);
        assert_eq!(completed.get(), 1);
        assert!(engine.temp().type_queue.as_ref().is_some_and(VecDeque::is_empty));
    }

    #[test]
    fn test_default_start_delay() {
        let engine = engine("<<type 10ms>>ab<</type>>");
        engine.navigate("Start").unwrap();
        engine.advance(399);
        assert_eq!(engine.display().text(), "");
        engine.advance(1);
        assert_eq!(engine.display().text(), "a");
    }

    #[test]
    fn test_skip_key_finishes_and_keep_leaves_cursor() {
        let engine = engine("<<type 10ms start 0ms keep>>hello<</type>>");
        engine.navigate("Start").unwrap();
        assert_eq!(engine.display().text(), "h");

        engine.press_key("x");
        assert_eq!(engine.display().text(), "h");
        engine.press_key(" ");
        assert_eq!(engine.display().text(), "hello");

        engine.advance(10);
        let wrapper = &engine.display().find_by_class("macro-type")[0];
        assert!(wrapper.has_class("macro-type-done"));
        assert!(wrapper.has_class("macro-type-cursor"));
    }

    #[test]
    fn test_zero_speed_and_visited_passages_skip_typing() {
        let engine = engine("<<type 0s>>hi<</type>>");
        engine.navigate("Start").unwrap();
        assert_eq!(engine.display().text(), "hi");

        let config = Config {
            type_visited_passages: false,
            ..Config::default()
        };
        let revisit = engine_with(config, "<<type 10ms start 0ms>>hi<</type>>");
        revisit.navigate("Start").unwrap();
        assert_eq!(revisit.display().text(), "h");
        revisit.navigate("Other").unwrap();
        revisit.navigate("Start").unwrap();
        assert_eq!(revisit.display().text(), "hi");
    }

    #[test]
    fn test_outside_navigation_starts_at_once() {
        let engine = engine("");
        let out = Output::new();
        engine.wikify(&out, "<<type 10ms start 0ms element span id intro class big>>ab<</type>>");
        assert_eq!(out.text(), "a");

        let wrapper = &out.find_by_class("macro-type")[0];
        assert_eq!(wrapper.tag(), "span");
        assert_eq!(wrapper.attr("id").as_deref(), Some("intro"));
        assert!(wrapper.has_class("big"));
    }

    #[test]
    fn test_navigation_abandons_typing() {
        let engine = engine("<<type 10ms start 0ms>>abcdef<</type>>");
        engine.navigate("Start").unwrap();
        engine.advance(10);
        engine.navigate("Other").unwrap();
        engine.advance(10);
        assert_eq!(engine.display().text(), "other");
        assert_eq!(engine.scheduler().pending(), 0);
        assert_eq!(engine.scheduler().listener_count(Event::TypingStop), 0);
    }

    #[test]
    fn test_option_errors() {
        let engine = engine("");
        let out = Output::new();
        engine.wikify(&out, "<<type -1s>>x<</type>><<type 10ms bogus>>x<</type>><<type 10ms class>>x<</type>>");
        assert_eq!(
            out.errors(),
            vec![
                "<<type>>: speed time value must be non-negative (received: -1s)".to_string(),
                "<<type>>: unknown option: bogus".to_string(),
                "<<type>>: class option missing required class name(s)".to_string(),
            ]
        );

        let out = Output::new();
        engine.wikify(&out, "<<type fast>>x<</type>>");
        assert_eq!(
            out.errors(),
            vec!["cannot execute macro <<type>>: invalid time value syntax: \"fast\"".to_string()]
        );

        engine.advance(1);
        let out = Output::new();
        engine.wikify(&out, "<<type 99999999999999999999s>>x<</type>>");
        assert_eq!(
            out.errors(),
            vec!["<<type>>: invalid time value: \"99999999999999999999s\"".to_string()]
        );
        assert_eq!(engine.scheduler().pending(), 0);
    }

    #[test]
    fn test_typing_left_behind_stops_on_its_next_tick() {
        let engine = engine("<<type 10ms start 0ms>>abc<</type>>");
        let stopped = count(&engine, Event::TypingStop);
        engine.navigate("Start").unwrap();
        assert_eq!(engine.display().text(), "a");
        assert_eq!(engine.scheduler().pending(), 1);

        engine.state_mut().advance("Other");
        engine.advance(100);
        assert_eq!(engine.display().text(), "a");
        assert_eq!(engine.scheduler().pending(), 0);
        assert_eq!(stopped.get(), 0);
    }
}
