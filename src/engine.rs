//! The renderer and its host: passage store, variable state, event loop and
//! the current-context slot used by shadow handlers.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::args::Args;
use crate::ast::{Segment, Tag};
use crate::config::Config;
use crate::context::{ContextData, MacroContext, PayloadClause, ShadowHandler};
use crate::error::{ArgsError, MacroError, RegistryError};
use crate::macros;
use crate::macros::typing::TypeJob;
use crate::output::{Element, Output};
use crate::parser::PassageParser;
use crate::registry::{MacroRef, Registry};
use crate::scheduler::{Event, Scheduler, TimerId};
use crate::state::State;

/// Loop control requested by `<<break>>`, `<<continue>>` or `<<stop>>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBreak {
    Continue,
    Break,
}

/// Per-moment scratch state, reset on every navigation.
#[derive(Debug, Default)]
pub struct TempState {
    pub loop_break: Option<LoopBreak>,
    /// Id of the `<<repeat>>` interval currently ticking.
    pub repeat_timer_id: Option<TimerId>,
    pub(crate) type_queue: Option<VecDeque<TypeJob>>,
}

struct Clickable {
    element: Element,
    handler: Rc<ShadowHandler>,
    once: bool,
}

pub struct Engine {
    config: Config,
    registry: RefCell<Registry>,
    state: RefCell<State>,
    temp: RefCell<TempState>,
    story: RefCell<BTreeMap<String, String>>,
    scheduler: Scheduler<Engine>,
    current: RefCell<Option<Rc<MacroContext>>>,
    display: Output,
    clickables: RefCell<Vec<Clickable>>,
    errors: RefCell<Vec<MacroError>>,
    render_depth: Cell<usize>,
    playing: Cell<bool>,
}

impl Engine {
    /// An engine with every built-in macro registered and initialized.
    pub fn new(config: Config) -> Result<Self, RegistryError> {
        let mut registry = Registry::new();
        macros::register_builtins(&mut registry)?;
        registry.init("init");
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: Config, registry: Registry) -> Self {
        Self {
            config,
            registry: RefCell::new(registry),
            state: RefCell::default(),
            temp: RefCell::default(),
            story: RefCell::default(),
            scheduler: Scheduler::new(),
            current: RefCell::default(),
            display: Output::new(),
            clickables: RefCell::default(),
            errors: RefCell::default(),
            render_depth: Cell::new(0),
            playing: Cell::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> Ref<'_, Registry> {
        self.registry.borrow()
    }

    pub fn registry_mut(&self) -> RefMut<'_, Registry> {
        self.registry.borrow_mut()
    }

    pub fn state(&self) -> Ref<'_, State> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, State> {
        self.state.borrow_mut()
    }

    pub fn temp(&self) -> Ref<'_, TempState> {
        self.temp.borrow()
    }

    pub fn temp_mut(&self) -> RefMut<'_, TempState> {
        self.temp.borrow_mut()
    }

    pub fn scheduler(&self) -> &Scheduler<Engine> {
        &self.scheduler
    }

    /// The passage display that `navigate` renders into.
    pub fn display(&self) -> &Output {
        &self.display
    }

    pub fn add_passage(&self, title: &str, source: &str) {
        self.story
            .borrow_mut()
            .insert(title.to_string(), source.to_string());
    }

    pub fn has_passage(&self, title: &str) -> bool {
        self.story.borrow().contains_key(title)
    }

    /// The context of the macro currently executing, if any.
    pub fn current_context(&self) -> Option<Rc<MacroContext>> {
        self.current.borrow().clone()
    }

    pub(crate) fn swap_context(&self, context: Option<Rc<MacroContext>>) -> Option<Rc<MacroContext>> {
        mem::replace(&mut *self.current.borrow_mut(), context)
    }

    /// Whether a passage is being rendered by `navigate`.
    pub fn is_playing(&self) -> bool {
        self.playing.get()
    }

    /// Render `source` into `output`, expanding every macro in it.
    ///
    /// Failures render inline; nothing is returned. Rendering stops early
    /// when a loop-control macro sets [`TempState::loop_break`].
    pub fn wikify(&self, output: &Output, source: &str) {
        let depth = self.render_depth.get();
        if depth >= self.config.max_render_depth {
            output.append_error(
                &format!(
                    "maximum render depth ({}) exceeded",
                    self.config.max_render_depth
                ),
                source,
            );
            return;
        }
        let _depth = DepthGuard::enter(&self.render_depth);

        let segments = match PassageParser::parse_source(source) {
            Ok(segments) => segments,
            Err(err) => {
                output.append_error(&err.to_string(), source);
                return;
            }
        };

        let mut index = 0;
        while index < segments.len() {
            if self.temp.borrow().loop_break.is_some() {
                break;
            }
            match &segments[index] {
                Segment::Text(text) => {
                    output.push_text(text);
                    index += 1;
                }
                Segment::Tag(tag) => {
                    index = self.render_tag(output, source, &segments, index, tag);
                }
            }
        }
    }

    /// Expand the tag at `segments[index]` and return the index to resume at.
    fn render_tag(
        &self,
        output: &Output,
        source: &str,
        segments: &[Segment<'_>],
        index: usize,
        tag: &Tag<'_>,
    ) -> usize {
        let name = tag.name.as_ref();
        let found = self.registry.borrow().get(name);
        let Some(macro_ref) = found else {
            let message = match self.registry.borrow().tags().get(name) {
                Some(parents) => format!(
                    "child tag <<{name}>> was found outside of a call to its parent macro{} <<{}>>",
                    if parents.len() == 1 { "" } else { "s" },
                    parents.join(">>, <<")
                ),
                None => format!("macro <<{name}>> does not exist"),
            };
            warn!(%message, "unrenderable tag");
            output.append_error(&message, tag.source);
            return index + 1;
        };
        let Some(handler) = macro_ref.handler().cloned() else {
            return index + 1;
        };

        let (clauses, next, end) = if macro_ref.def.is_container() {
            match PassageParser::parse_body(source, segments, index, macro_ref.def.child_tags()) {
                Ok(body) => (body.clauses, body.next, body.end),
                Err(message) => {
                    output.append_error(&message, tag.source);
                    return index + 1;
                }
            }
        } else {
            (Vec::new(), index + 1, tag.end)
        };
        let call_source = &source[tag.start..end];

        let parsed = self.parse_args(&macro_ref, &tag.args).and_then(|args| {
            let payload = clauses
                .iter()
                .map(|clause| {
                    Ok(PayloadClause {
                        name: clause.name.to_string(),
                        args: self.parse_args(&macro_ref, &clause.args)?,
                        contents: clause.contents.to_string(),
                        source: clause.source.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, ArgsError>>()?;
            Ok((args, payload))
        });
        let (args, payload) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                output.append_error(&format!("<<{name}>>: {err}"), call_source);
                return next;
            }
        };

        let context = MacroContext::new(ContextData {
            parent: self.current_context(),
            macro_ref: Some(macro_ref),
            name: name.to_string(),
            args,
            payload,
            source: call_source.to_string(),
            output: Some(output.clone()),
            debug: self.config.debug,
        });
        let context = match context {
            Ok(context) => Rc::new(context),
            Err(err) => {
                output.append_error(&err.to_string(), call_source);
                return next;
            }
        };

        debug!(macro_name = name, args = context.args().raw(), "invoking macro");
        let result = {
            let _swap = ContextSwap::enter(self, context.clone());
            handler(self, &context)
        };
        if let Err(err) = result {
            let message = format!("cannot execute macro <<{name}>>: {err}");
            warn!(%message, "macro failed");
            output.append_error(&message, call_source);
        }
        next
    }

    fn parse_args(&self, macro_ref: &MacroRef, raw: &str) -> Result<Args, ArgsError> {
        if macro_ref.def.skips_args() {
            Ok(Args::unparsed(raw))
        } else {
            Args::parse(raw, &mut self.state.borrow_mut())
        }
    }

    /// Start a new turn on `title` and render it into the display.
    pub fn navigate(&self, title: &str) -> Result<(), MacroError> {
        let Some(source) = self.story.borrow().get(title).cloned() else {
            return Err(MacroError::message(format!(
                "passage \"{title}\" does not exist"
            )));
        };
        debug!(passage = title, "navigating");

        self.state.borrow_mut().advance(title);
        *self.temp.borrow_mut() = TempState::default();
        self.clickables.borrow_mut().clear();
        self.trigger(Event::PassageInit, title);

        self.display.clear();
        self.playing.set(true);
        self.wikify(&self.display, &source);
        self.playing.set(false);

        self.trigger(Event::PassageEnd, title);
        Ok(())
    }

    /// Run every listener for `event`. Listener failures are reported, not
    /// returned.
    pub fn trigger(&self, event: Event, detail: &str) {
        debug!(?event, detail, "event");
        for listener in self.scheduler.take_listeners(event) {
            if let Err(err) = listener(self, detail) {
                self.report(err);
            }
        }
    }

    /// Move the virtual clock forward `ms` milliseconds, firing due timers.
    pub fn advance(&self, ms: u64) {
        let until = self.scheduler.now().saturating_add(ms);
        while let Some((id, callback)) = self.scheduler.take_due(until) {
            if let Err(err) = callback(self, id) {
                self.report(err);
            }
        }
        self.scheduler.set_now(until);
    }

    pub fn press_key(&self, key: &str) {
        self.trigger(Event::Keydown, key);
    }

    /// Make `element` clickable. A `once` target is forgotten after its
    /// first click.
    pub fn register_clickable(&self, element: &Element, handler: ShadowHandler, once: bool) {
        self.clickables.borrow_mut().push(Clickable {
            element: element.clone(),
            handler: Rc::new(handler),
            once,
        });
    }

    /// Run the click handler of `element`. Returns `Ok(false)` when the
    /// element is not clickable.
    pub fn click(&self, element: &Element) -> Result<bool, MacroError> {
        let handler = {
            let mut clickables = self.clickables.borrow_mut();
            let Some(index) = clickables
                .iter()
                .position(|c| c.element.ptr_eq(element))
            else {
                return Ok(false);
            };
            if clickables[index].once {
                clickables.remove(index).handler
            } else {
                clickables[index].handler.clone()
            }
        };
        handler.invoke(self, &())?;
        Ok(true)
    }

    /// Record a failure raised by a deferred callback.
    pub fn report(&self, err: MacroError) {
        error!(error = %err, "uncaught error in deferred callback");
        self.errors.borrow_mut().push(err);
    }

    pub fn take_errors(&self) -> Vec<MacroError> {
        mem::take(&mut *self.errors.borrow_mut())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("passage", &self.state.borrow().passage())
            .field("turns", &self.state.borrow().turns())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

struct DepthGuard<'a>(&'a Cell<usize>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

struct ContextSwap<'a> {
    engine: &'a Engine,
    previous: Option<Rc<MacroContext>>,
}

impl<'a> ContextSwap<'a> {
    fn enter(engine: &'a Engine, context: Rc<MacroContext>) -> Self {
        let previous = engine.swap_context(Some(context));
        Self { engine, previous }
    }
}

impl Drop for ContextSwap<'_> {
    fn drop(&mut self) {
        self.engine.swap_context(self.previous.take());
    }
}
