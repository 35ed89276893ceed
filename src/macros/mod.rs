//! Built-in macros.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::debug;

use crate::context::MacroContext;
use crate::engine::Engine;
use crate::error::{RegistryError, TimeError};
use crate::registry::Registry;
use crate::scheduler::TimerId;

pub mod capture;
pub mod control;
pub mod link;
pub mod print;
pub mod repeat;
pub mod timed;
pub mod typing;
pub mod variables;

pub fn register_builtins(registry: &mut Registry) -> Result<(), RegistryError> {
    print::register(registry)?;
    variables::register(registry)?;
    control::register(registry)?;
    capture::register(registry)?;
    link::register(registry)?;
    repeat::register(registry)?;
    timed::register(registry)?;
    typing::register(registry)?;
    Ok(())
}

/// Ids of every pending timer owned by one timer macro family.
#[derive(Debug, Clone, Default)]
pub struct TimerSet(Rc<RefCell<BTreeSet<TimerId>>>);

impl TimerSet {
    /// Track `id`, returning how many timers are now tracked.
    pub fn insert(&self, id: TimerId) -> usize {
        let mut ids = self.0.borrow_mut();
        ids.insert(id);
        ids.len()
    }

    pub fn remove(&self, id: TimerId) -> bool {
        self.0.borrow_mut().remove(&id)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.0.borrow().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Cancel and forget every tracked timer.
    pub fn clear_all(&self, engine: &Engine) {
        let ids = std::mem::take(&mut *self.0.borrow_mut());
        debug!(count = ids.len(), "clearing timer family");
        for id in ids {
            engine.scheduler().clear_timer(id);
        }
    }
}

/// The family timer set stored on the definition behind `ctx`.
pub(crate) fn timer_set(ctx: &MacroContext) -> TimerSet {
    ctx.definition()
        .data::<TimerSet>()
        .cloned()
        .unwrap_or_default()
}

/// Switch debug view modes on, when instrumentation is active.
pub(crate) fn debug_modes(ctx: &MacroContext, modes: &[&str]) {
    if let Some(view) = ctx.debug_view() {
        let modes: Vec<(&str, bool)> = modes.iter().map(|mode| (*mode, true)).collect();
        view.set_modes(&modes);
    }
}

/// Longest delay a timer accepts, the host's signed 32-bit limit.
pub(crate) const MAX_DELAY_MS: u64 = i32::MAX as u64;

/// Whole milliseconds from a parsed time value. Negative values become 0;
/// values past [`MAX_DELAY_MS`] are a range error for `text`.
pub(crate) fn checked_delay(ms: f64, text: &str) -> Result<u64, TimeError> {
    if ms > MAX_DELAY_MS as f64 {
        return Err(TimeError::Range(text.to_string()));
    }
    Ok(ms.max(0.0) as u64)
}

/// A CSS time value in milliseconds, never less than `floor`.
pub(crate) fn delay_arg(text: &str, floor: u64) -> Result<u64, TimeError> {
    let ms = crate::patterns::css_time_to_ms(text)?;
    Ok(checked_delay(ms, text)?.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_builtins_register_cleanly() {
        let mut registry = Registry::new();
        register_builtins(&mut registry).unwrap();
        for name in [
            "print", "=", "-", "set", "run", "unset", "if", "for", "break", "continue", "capture",
            "link", "button", "repeat", "stop", "timed", "type",
        ] {
            assert!(registry.get(name).is_some(), "missing <<{name}>>");
        }
        for tag in ["elseif", "else", "/if", "endfor", "next", "/timed", "/type"] {
            assert!(registry.tags().has(tag), "missing tag <<{tag}>>");
        }
    }

    #[test]
    fn test_timer_set_clear_all() {
        let engine = Engine::with_registry(Config::default(), Registry::new());
        let set = TimerSet::default();
        let a = engine.scheduler().set_timeout(10, |_, _| Ok(()));
        let b = engine.scheduler().set_interval(10, |_, _| Ok(()));
        assert_eq!(set.insert(a), 1);
        assert_eq!(set.insert(b), 2);

        set.clear_all(&engine);
        assert!(set.is_empty());
        assert_eq!(engine.scheduler().pending(), 0);
    }

    #[test]
    fn test_delay_arg_bounds() {
        assert_eq!(delay_arg("1ms", 40), Ok(40));
        assert_eq!(delay_arg("-2s", 40), Ok(40));
        assert_eq!(delay_arg("1.5s", 40), Ok(1500));
        assert_eq!(delay_arg("2147483647ms", 0), Ok(MAX_DELAY_MS));
        assert_eq!(
            delay_arg("99999999999999999999s", 40),
            Err(TimeError::Range("99999999999999999999s".to_string()))
        );
    }
}
