//! Variable stores and navigation state.
//!
//! Story variables (`$name`) persist across passages, temporary variables
//! (`_name`) are cleared on every navigation. Shadowing is done with a stack
//! of override maps that sit in front of both stores: a name present in an
//! overlay resolves there, even when its overlay value is "unset".

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ContextError;
use crate::patterns;

/// Override map keyed by full variable name (`$x`, `_y`); `None` means the
/// variable does not exist while the overlay is active.
pub type Overlay = BTreeMap<String, Option<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Story,
    Temporary,
}

#[derive(Debug, Default)]
pub struct State {
    variables: BTreeMap<String, Value>,
    temporary: BTreeMap<String, Value>,
    overlays: Vec<Overlay>,
    passage: String,
    turns: u64,
    history: Vec<String>,
}

fn split(name: &str) -> Result<(Store, &str), ContextError> {
    if !patterns::is_variable(name) {
        return Err(ContextError::InvalidVariable(name.to_string()));
    }
    match name.split_at(1) {
        ("$", key) => Ok((Store::Story, key)),
        (_, key) => Ok((Store::Temporary, key)),
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    fn base(&self, store: Store) -> &BTreeMap<String, Value> {
        match store {
            Store::Story => &self.variables,
            Store::Temporary => &self.temporary,
        }
    }

    fn base_mut(&mut self, store: Store) -> &mut BTreeMap<String, Value> {
        match store {
            Store::Story => &mut self.variables,
            Store::Temporary => &mut self.temporary,
        }
    }

    fn overlay_for(&mut self, name: &str) -> Option<&mut Option<Value>> {
        self.overlays
            .iter_mut()
            .rev()
            .find_map(|overlay| overlay.get_mut(name))
    }

    /// Current value of `$name`/`_name`, looking through active overlays.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(slot) = self.overlays.iter().rev().find_map(|o| o.get(name)) {
            return slot.clone();
        }
        let (store, key) = split(name).ok()?;
        self.base(store).get(key).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ContextError> {
        let (store, key) = split(name)?;
        if let Some(slot) = self.overlay_for(name) {
            *slot = Some(value);
            return Ok(());
        }
        self.base_mut(store).insert(key.to_string(), value);
        Ok(())
    }

    /// Remove a variable. Returns whether it existed.
    pub fn unset(&mut self, name: &str) -> Result<bool, ContextError> {
        let (store, key) = split(name)?;
        if let Some(slot) = self.overlay_for(name) {
            return Ok(slot.take().is_some());
        }
        Ok(self.base_mut(store).remove(key).is_some())
    }

    pub fn push_overlay(&mut self, overlay: Overlay) {
        self.overlays.push(overlay);
    }

    pub fn pop_overlay(&mut self) -> Option<Overlay> {
        self.overlays.pop()
    }

    pub fn overlay_depth(&self) -> usize {
        self.overlays.len()
    }

    /// Story variables, ignoring overlays.
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Temporary variables, ignoring overlays.
    pub fn temporary(&self) -> &BTreeMap<String, Value> {
        &self.temporary
    }

    pub fn passage(&self) -> &str {
        &self.passage
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Passage titles in visit order, current passage last.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Whether `title` was visited before the current moment.
    pub fn visited_before(&self, title: &str) -> bool {
        let previous = self.history.len().saturating_sub(1);
        self.history[..previous].iter().any(|t| t == title)
    }

    pub fn has_played(&self, title: &str) -> bool {
        self.history.iter().any(|t| t == title)
    }

    /// Make `title` the current passage and start a new turn.
    pub fn advance(&mut self, title: &str) {
        self.passage = title.to_string();
        self.turns += 1;
        self.history.push(title.to_string());
        self.temporary.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sigils_select_store() {
        let mut state = State::new();
        state.set("$gold", json!(5)).unwrap();
        state.set("_i", json!("x")).unwrap();

        assert_eq!(state.variables().get("gold"), Some(&json!(5)));
        assert_eq!(state.temporary().get("i"), Some(&json!("x")));
        assert_eq!(state.get("$i"), None);
        assert!(state.set("gold", json!(1)).is_err());
    }

    #[test]
    fn test_overlay_shadows_and_unwinds() {
        let mut state = State::new();
        state.set("$x", json!("A")).unwrap();

        state.push_overlay(Overlay::from([
            ("$x".to_string(), Some(json!("B"))),
            ("_t".to_string(), None),
        ]));
        assert_eq!(state.get("$x"), Some(json!("B")));
        assert!(!state.has("_t"));

        state.set("$x", json!("C")).unwrap();
        state.set("_t", json!(1)).unwrap();
        state.set("$other", json!(true)).unwrap();

        let overlay = state.pop_overlay().unwrap();
        assert_eq!(overlay["$x"], Some(json!("C")));
        assert_eq!(overlay["_t"], Some(json!(1)));
        assert_eq!(state.get("$x"), Some(json!("A")));
        assert!(!state.has("_t"));
        assert_eq!(state.get("$other"), Some(json!(true)));
    }

    #[test]
    fn test_unset_inside_overlay() {
        let mut state = State::new();
        state.set("$x", json!(1)).unwrap();
        state.push_overlay(Overlay::from([("$x".to_string(), Some(json!(2)))]));
        assert!(state.unset("$x").unwrap());
        assert!(!state.has("$x"));
        state.pop_overlay();
        assert_eq!(state.get("$x"), Some(json!(1)));
    }

    #[test]
    fn test_navigation_history() {
        let mut state = State::new();
        state.set("_tmp", json!(1)).unwrap();
        state.advance("Start");
        state.advance("Cave");
        state.advance("Start");

        assert_eq!(state.passage(), "Start");
        assert_eq!(state.turns(), 3);
        assert!(state.visited_before("Start"));
        assert!(!state.visited_before("Forest"));
        assert!(!state.has("_tmp"));
    }
}
