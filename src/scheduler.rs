//! Deterministic host event loop: virtual-clock timers plus one-shot and
//! persistent namespaced event listeners.
//!
//! Nothing here runs callbacks by itself. The owner pulls due timers with
//! [`Scheduler::take_due`] and matching listeners with
//! [`Scheduler::take_listeners`], then calls them with whatever context `C`
//! it wants handed to callbacks.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::error::MacroError;

pub type TimerId = u64;

pub type TimerCallback<C> = Rc<dyn Fn(&C, TimerId) -> Result<(), MacroError>>;

pub type Listener<C> = Rc<dyn Fn(&C, &str) -> Result<(), MacroError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    PassageInit,
    PassageEnd,
    TypingStart,
    TypingStop,
    TypingComplete,
    Keydown,
}

struct Timer<C: ?Sized> {
    due: u64,
    interval: Option<u64>,
    callback: TimerCallback<C>,
}

struct Registration<C: ?Sized> {
    event: Event,
    namespace: Option<String>,
    once: bool,
    listener: Listener<C>,
}

pub struct Scheduler<C: ?Sized> {
    now: Cell<u64>,
    next_id: Cell<TimerId>,
    timers: RefCell<BTreeMap<TimerId, Timer<C>>>,
    listeners: RefCell<Vec<Registration<C>>>,
}

impl<C: ?Sized> Default for Scheduler<C> {
    fn default() -> Self {
        Self {
            now: Cell::new(0),
            next_id: Cell::new(1),
            timers: RefCell::default(),
            listeners: RefCell::default(),
        }
    }
}

impl<C: ?Sized> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now.get())
            .field("timers", &self.timers.borrow().keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl<C: ?Sized> Scheduler<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.now.get()
    }

    fn add_timer(&self, delay: u64, interval: Option<u64>, callback: TimerCallback<C>) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.timers.borrow_mut().insert(
            id,
            Timer {
                due: self.now.get().saturating_add(delay),
                interval,
                callback,
            },
        );
        id
    }

    pub fn set_timeout(
        &self,
        delay: u64,
        callback: impl Fn(&C, TimerId) -> Result<(), MacroError> + 'static,
    ) -> TimerId {
        let id = self.add_timer(delay, None, Rc::new(callback));
        debug!(id, delay, "timeout scheduled");
        id
    }

    /// Fires every `period` milliseconds (at least 1) until cleared.
    pub fn set_interval(
        &self,
        period: u64,
        callback: impl Fn(&C, TimerId) -> Result<(), MacroError> + 'static,
    ) -> TimerId {
        let period = period.max(1);
        let id = self.add_timer(period, Some(period), Rc::new(callback));
        debug!(id, period, "interval scheduled");
        id
    }

    /// Cancel a timer. Returns whether it was still pending.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        let cleared = self.timers.borrow_mut().remove(&id).is_some();
        if cleared {
            debug!(id, "timer cleared");
        }
        cleared
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers.borrow().contains_key(&id)
    }

    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Remove (or re-arm, for intervals) the earliest timer due at or before
    /// `until`, moving the clock to its due time. An interval whose next due
    /// time would pass the end of the clock fires one last time.
    ///
    /// Ties are broken by timer id, so timers scheduled first fire first.
    pub fn take_due(&self, until: u64) -> Option<(TimerId, TimerCallback<C>)> {
        let mut timers = self.timers.borrow_mut();
        let (id, due) = timers
            .iter()
            .filter(|(_, timer)| timer.due <= until)
            .map(|(id, timer)| (*id, timer.due))
            .min_by_key(|(id, due)| (*due, *id))?;

        self.now.set(self.now.get().max(due));

        let callback = match timers.get_mut(&id) {
            Some(Timer {
                due,
                interval: Some(period),
                callback,
            }) if due.checked_add(*period).is_some() => {
                *due += *period;
                callback.clone()
            }
            _ => timers.remove(&id)?.callback,
        };
        Some((id, callback))
    }

    /// Move the clock forward without firing anything.
    pub fn set_now(&self, now: u64) {
        self.now.set(self.now.get().max(now));
    }

    /// Register a listener that is removed after its first call.
    pub fn one(
        &self,
        event: Event,
        namespace: Option<&str>,
        listener: impl Fn(&C, &str) -> Result<(), MacroError> + 'static,
    ) {
        self.register(event, namespace, true, Rc::new(listener));
    }

    /// Register a listener that stays until removed with [`Scheduler::off`].
    pub fn on(
        &self,
        event: Event,
        namespace: Option<&str>,
        listener: impl Fn(&C, &str) -> Result<(), MacroError> + 'static,
    ) {
        self.register(event, namespace, false, Rc::new(listener));
    }

    fn register(&self, event: Event, namespace: Option<&str>, once: bool, listener: Listener<C>) {
        self.listeners.borrow_mut().push(Registration {
            event,
            namespace: namespace.map(str::to_string),
            once,
            listener,
        });
    }

    /// Remove every listener in `namespace`, optionally only for `event`.
    pub fn off(&self, event: Option<Event>, namespace: &str) {
        self.listeners.borrow_mut().retain(|reg| {
            reg.namespace.as_deref() != Some(namespace) || event.is_some_and(|e| e != reg.event)
        });
    }

    pub fn listener_count(&self, event: Event) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|reg| reg.event == event)
            .count()
    }

    /// Listeners for `event` in registration order. One-shot listeners are
    /// removed from the table.
    pub fn take_listeners(&self, event: Event) -> Vec<Listener<C>> {
        let mut taken = Vec::new();
        self.listeners.borrow_mut().retain(|reg| {
            if reg.event != event {
                return true;
            }
            taken.push(reg.listener.clone());
            !reg.once
        });
        taken
    }

    /// Drop every timer and listener.
    pub fn clear(&self) {
        self.timers.borrow_mut().clear();
        self.listeners.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Log = RefCell<Vec<String>>;

    fn drain(scheduler: &Scheduler<Log>, log: &Log, until: u64) {
        while let Some((id, callback)) = scheduler.take_due(until) {
            callback(log, id).unwrap();
        }
        scheduler.set_now(until);
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let scheduler: Scheduler<Log> = Scheduler::new();
        let log = Log::default();

        scheduler.set_timeout(30, |log, _| Ok(log.borrow_mut().push("b".into())));
        scheduler.set_timeout(10, |log, _| Ok(log.borrow_mut().push("a".into())));
        scheduler.set_timeout(30, |log, _| Ok(log.borrow_mut().push("c".into())));

        drain(&scheduler, &log, 20);
        assert_eq!(*log.borrow(), vec!["a"]);
        assert_eq!(scheduler.now(), 20);

        drain(&scheduler, &log, 100);
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_interval_repeats_until_cleared() {
        let scheduler: Scheduler<Log> = Scheduler::new();
        let log = Log::default();

        let id = scheduler.set_interval(10, |log, id| Ok(log.borrow_mut().push(format!("tick {id}"))));
        drain(&scheduler, &log, 35);
        assert_eq!(log.borrow().len(), 3);
        assert!(scheduler.is_pending(id));

        assert!(scheduler.clear_timer(id));
        assert!(!scheduler.clear_timer(id));
        drain(&scheduler, &log, 100);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn test_due_times_saturate_at_the_end_of_the_clock() {
        let scheduler: Scheduler<Log> = Scheduler::new();
        let log = Log::default();
        drain(&scheduler, &log, 10);

        scheduler.set_timeout(u64::MAX, |log, _| Ok(log.borrow_mut().push("late".into())));
        scheduler.set_interval(u64::MAX - 20, |log, _| Ok(log.borrow_mut().push("tick".into())));
        assert_eq!(scheduler.pending(), 2);

        drain(&scheduler, &log, u64::MAX);
        assert_eq!(*log.borrow(), vec!["tick", "late"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_one_shot_and_namespaced_listeners() {
        let scheduler: Scheduler<Log> = Scheduler::new();
        let log = Log::default();

        scheduler.one(Event::PassageInit, None, |log, _| Ok(log.borrow_mut().push("once".into())));
        scheduler.on(Event::PassageInit, Some("ns"), |log, _| {
            Ok(log.borrow_mut().push("always".into()))
        });
        scheduler.on(Event::Keydown, Some("ns"), |log, key| Ok(log.borrow_mut().push(key.into())));

        for listener in scheduler.take_listeners(Event::PassageInit) {
            listener(&log, "").unwrap();
        }
        for listener in scheduler.take_listeners(Event::PassageInit) {
            listener(&log, "").unwrap();
        }
        assert_eq!(*log.borrow(), vec!["once", "always", "always"]);

        scheduler.off(Some(Event::Keydown), "ns");
        assert_eq!(scheduler.listener_count(Event::Keydown), 0);
        assert_eq!(scheduler.listener_count(Event::PassageInit), 1);

        scheduler.off(None, "ns");
        assert_eq!(scheduler.listener_count(Event::PassageInit), 0);
    }
}
