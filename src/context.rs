//! Per-invocation macro execution contexts and deferred shadow handlers.
//!
//! Contexts form a tree through `Rc` parent links, rooted at `None`. A
//! context outlives its handler call only when a [`ShadowHandler`] built
//! from it is kept around by a timer, an event listener or a click target.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::iter;
use std::rc::Rc;

use tracing::warn;

use crate::args::Args;
use crate::engine::Engine;
use crate::error::{ContextError, MacroError};
use crate::output::{DebugView, ErrorView, Output};
use crate::patterns;
use crate::registry::{MacroDefinition, MacroRef};
use crate::state::Overlay;

/// One clause of a container macro's body, arguments already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadClause {
    pub name: String,
    pub args: Args,
    pub contents: String,
    pub source: String,
}

/// Everything needed to build a [`MacroContext`].
#[derive(Debug, Default)]
pub struct ContextData {
    pub parent: Option<Rc<MacroContext>>,
    pub macro_ref: Option<MacroRef>,
    /// The name as written at the call site.
    pub name: String,
    pub args: Args,
    pub payload: Vec<PayloadClause>,
    pub source: String,
    pub output: Option<Output>,
    pub debug: bool,
}

pub struct MacroContext {
    definition: Rc<MacroDefinition>,
    name: String,
    display_name: String,
    args: Args,
    payload: Vec<PayloadClause>,
    source: String,
    parent: Option<Rc<MacroContext>>,
    output: Output,
    shadows: RefCell<BTreeSet<String>>,
    debug_view: RefCell<Option<DebugView>>,
    debug_enabled: Cell<bool>,
}

impl MacroContext {
    pub fn new(data: ContextData) -> Result<Self, ContextError> {
        let Some(macro_ref) = data.macro_ref else {
            return Err(ContextError::MissingProperties("macro"));
        };
        if data.name.is_empty() {
            return Err(ContextError::MissingProperties("name"));
        }
        let Some(output) = data.output else {
            return Err(ContextError::MissingProperties("output"));
        };

        Ok(Self {
            definition: macro_ref.def,
            name: macro_ref.alias_of.unwrap_or_else(|| data.name.clone()),
            display_name: data.name,
            args: data.args,
            payload: data.payload,
            source: data.source,
            parent: data.parent,
            output,
            shadows: RefCell::default(),
            debug_view: RefCell::default(),
            debug_enabled: Cell::new(data.debug),
        })
    }

    /// The definition being executed.
    pub fn definition(&self) -> &Rc<MacroDefinition> {
        &self.definition
    }

    /// Canonical name; for an alias, the name of its target.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name as written at the call site.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn payload(&self) -> &[PayloadClause] {
        &self.payload
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parent(&self) -> Option<&Rc<MacroContext>> {
        self.parent.as_ref()
    }

    /// Where output goes: the debug view when instrumentation is active,
    /// otherwise the renderer's target.
    pub fn output(&self) -> Output {
        match self.debug_view() {
            Some(view) => view.output(),
            None => self.output.clone(),
        }
    }

    /// Ancestors, nearest first. Never includes `self`.
    pub fn ancestors(&self) -> impl Iterator<Item = Rc<MacroContext>> {
        iter::successors(self.parent.clone(), |ctx| ctx.parent.clone())
    }

    pub fn context_filter(&self, predicate: impl Fn(&MacroContext) -> bool) -> Vec<Rc<MacroContext>> {
        self.ancestors().filter(|ctx| predicate(ctx)).collect()
    }

    pub fn context_find(&self, predicate: impl Fn(&MacroContext) -> bool) -> Option<Rc<MacroContext>> {
        self.ancestors().find(|ctx| predicate(ctx))
    }

    pub fn context_some(&self, predicate: impl Fn(&MacroContext) -> bool) -> bool {
        self.ancestors().any(|ctx| predicate(&ctx))
    }

    /// Mark variables as shadowed by this context.
    pub fn add_shadow(&self, names: &[&str]) -> Result<(), ContextError> {
        let mut shadows = self.shadows.borrow_mut();
        for name in names {
            if !patterns::is_variable(name) {
                return Err(ContextError::InvalidVariable(name.to_string()));
            }
            shadows.insert(name.to_string());
        }
        Ok(())
    }

    /// This context's own shadowed variables.
    pub fn shadows(&self) -> Vec<String> {
        self.shadows.borrow().iter().cloned().collect()
    }

    /// Shadowed variables of this context and every ancestor.
    pub fn shadow_view(&self) -> BTreeSet<String> {
        let mut view = self.shadows.borrow().clone();
        for ctx in self.ancestors() {
            view.extend(ctx.shadows.borrow().iter().cloned());
        }
        view
    }

    /// Wrap `callback` so that, whenever it runs later, it sees the shadowed
    /// variables as they are right now.
    pub fn shadow_handler<A: 'static>(
        self: &Rc<Self>,
        engine: &Engine,
        callback: impl Fn(&Engine, &A) -> Result<(), MacroError> + 'static,
    ) -> ShadowHandler<A> {
        ShadowHandler::new(self.clone(), Some(Rc::new(callback)), engine)
    }

    /// The debug view, created on first use when instrumentation is active.
    pub fn debug_view(&self) -> Option<DebugView> {
        if !self.debug_enabled.get() {
            return None;
        }
        if let Some(view) = self.debug_view.borrow().as_ref() {
            return Some(view.clone());
        }
        Some(self.create_debug_view(None, None))
    }

    /// Attach a new debug view (replacing the current one) labelled `name`
    /// and `title`, defaulting to the display name and source.
    pub fn create_debug_view(&self, name: Option<&str>, title: Option<&str>) -> DebugView {
        let view = DebugView::new(
            &self.output,
            "macro",
            name.unwrap_or(self.display_name.as_str()),
            title.unwrap_or(self.source.as_str()),
        );
        if !self.payload.is_empty() {
            view.set_modes(&[("nonvoid", true)]);
        }
        *self.debug_view.borrow_mut() = Some(view.clone());
        self.debug_enabled.set(true);
        view
    }

    pub fn remove_debug_view(&self) {
        if let Some(view) = self.debug_view.borrow_mut().take() {
            view.remove();
        }
        self.debug_enabled.set(false);
    }

    /// Render an inline error view for this invocation.
    pub fn error(&self, message: impl fmt::Display, source: Option<&str>) -> ErrorView {
        let message = format!("<<{}>>: {}", self.display_name, message);
        warn!(macro_name = %self.display_name, %message, "macro error");
        self.output
            .append_error(&message, source.unwrap_or(self.source.as_str()))
    }
}

impl fmt::Debug for MacroContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroContext")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("args", &self.args.raw())
            .field("source", &self.source)
            .field("parent", &self.parent.as_ref().map(|p| p.display_name.clone()))
            .field("shadows", &self.shadows.borrow())
            .finish()
    }
}

pub type ShadowCallback<A> = Rc<dyn Fn(&Engine, &A) -> Result<(), MacroError>>;

/// A deferred callback bound to the context and variable snapshot it was
/// created with.
///
/// Each [`invoke`](ShadowHandler::invoke) runs `start`, then `callback` with
/// the snapshot overlaid on the live stores and the engine's current context
/// set to the creating context, then `done`. Values the callback leaves in
/// shadowed variables are kept for the next invocation; the live stores are
/// left exactly as they were.
pub struct ShadowHandler<A = ()> {
    context: Rc<MacroContext>,
    store: RefCell<Overlay>,
    callback: Option<ShadowCallback<A>>,
    done: Option<ShadowCallback<A>>,
    start: Option<ShadowCallback<A>>,
}

impl<A> ShadowHandler<A> {
    /// Snapshot every variable in the context's shadow view, if there is a
    /// callback to run with them.
    pub fn new(context: Rc<MacroContext>, callback: Option<ShadowCallback<A>>, engine: &Engine) -> Self {
        let mut store = Overlay::new();
        if callback.is_some() {
            let state = engine.state();
            for name in context.shadow_view() {
                let value = state.get(&name);
                store.insert(name, value);
            }
        }
        Self {
            context,
            store: RefCell::new(store),
            callback,
            done: None,
            start: None,
        }
    }

    pub fn with_done(mut self, done: impl Fn(&Engine, &A) -> Result<(), MacroError> + 'static) -> Self {
        self.done = Some(Rc::new(done));
        self
    }

    pub fn with_start(mut self, start: impl Fn(&Engine, &A) -> Result<(), MacroError> + 'static) -> Self {
        self.start = Some(Rc::new(start));
        self
    }

    pub fn context(&self) -> &Rc<MacroContext> {
        &self.context
    }

    /// The values the next invocation will start from.
    pub fn snapshot(&self) -> Overlay {
        self.store.borrow().clone()
    }

    pub fn invoke(&self, engine: &Engine, arg: &A) -> Result<(), MacroError> {
        if let Some(start) = &self.start {
            start(engine, arg)?;
        }

        if let Some(callback) = &self.callback {
            let guard = ShadowGuard::enter(engine, &self.context, &self.store);
            let result = callback(engine, arg);
            drop(guard);
            result?;
        }

        if let Some(done) = &self.done {
            done(engine, arg)?;
        }
        Ok(())
    }
}

impl<A> fmt::Debug for ShadowHandler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowHandler")
            .field("context", &self.context.display_name())
            .field("store", &self.store.borrow())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Overlay and current-context swap for one callback run. Dropping it
/// commits the overlay back into the snapshot and restores the engine,
/// including while unwinding.
struct ShadowGuard<'a> {
    engine: &'a Engine,
    store: &'a RefCell<Overlay>,
    depth: usize,
    previous: Option<Rc<MacroContext>>,
}

impl<'a> ShadowGuard<'a> {
    fn enter(engine: &'a Engine, context: &Rc<MacroContext>, store: &'a RefCell<Overlay>) -> Self {
        let depth = {
            let mut state = engine.state_mut();
            let depth = state.overlay_depth();
            state.push_overlay(store.borrow().clone());
            depth
        };
        let previous = engine.swap_context(Some(context.clone()));
        Self {
            engine,
            store,
            depth,
            previous,
        }
    }
}

impl Drop for ShadowGuard<'_> {
    fn drop(&mut self) {
        self.engine.swap_context(self.previous.take());

        let mut state = self.engine.state_mut();
        while state.overlay_depth() > self.depth + 1 {
            state.pop_overlay();
        }
        if state.overlay_depth() > self.depth {
            if let Some(overlay) = state.pop_overlay() {
                *self.store.borrow_mut() = overlay;
            }
        }
    }
}
