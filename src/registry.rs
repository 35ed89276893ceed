//! Macro definitions and the child-tag table.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::context::MacroContext;
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::patterns;

pub type Handler = Rc<dyn Fn(&Engine, &Rc<MacroContext>) -> Result<(), MacroError>>;

/// One-time hook, called with the name it is registered under.
pub type Hook = Rc<dyn Fn(&str)>;

/// Which tags a container macro owns.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Tags {
    /// Not a container.
    #[default]
    None,
    /// A container with only its closing tags.
    Closing,
    /// A container with the given child tags as well.
    Children(Vec<String>),
}

#[derive(Default)]
pub struct MacroDefinition {
    handler: Option<Handler>,
    tags: Tags,
    skip_args: bool,
    is_async: bool,
    hooks: BTreeMap<String, Hook>,
    data: Option<Rc<dyn Any>>,
}

impl MacroDefinition {
    pub fn new(
        handler: impl Fn(&Engine, &Rc<MacroContext>) -> Result<(), MacroError> + 'static,
    ) -> Self {
        Self {
            handler: Some(Rc::new(handler)),
            ..Self::default()
        }
    }

    /// A definition with no handler; `Registry::get` never returns it.
    pub fn without_handler() -> Self {
        Self::default()
    }

    pub fn container(mut self) -> Self {
        self.tags = Tags::Closing;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = Tags::Children(tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn skip_args(mut self) -> Self {
        self.skip_args = true;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn with_hook(mut self, name: &str, hook: impl Fn(&str) + 'static) -> Self {
        self.hooks.insert(name.to_string(), Rc::new(hook));
        self
    }

    /// Attach per-definition state, reachable from handlers through `data`.
    pub fn with_data<T: Any>(mut self, data: T) -> Self {
        self.data = Some(Rc::new(data));
        self
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn is_container(&self) -> bool {
        self.tags != Tags::None
    }

    /// Child tags that split the body into clauses.
    pub fn child_tags(&self) -> &[String] {
        match &self.tags {
            Tags::Children(tags) => tags,
            Tags::None | Tags::Closing => &[],
        }
    }

    pub fn skips_args(&self) -> bool {
        self.skip_args
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn hook(&self, name: &str) -> Option<&Hook> {
        self.hooks.get(name)
    }

    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref()
    }
}

impl fmt::Debug for MacroDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroDefinition")
            .field("handler", &self.handler.is_some())
            .field("tags", &self.tags)
            .field("skip_args", &self.skip_args)
            .field("is_async", &self.is_async)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What `Registry::add` stores under a name.
pub enum MacroDef {
    Direct(MacroDefinition),
    /// Delegate to another registered macro by its name.
    Alias(String),
}

impl From<MacroDefinition> for MacroDef {
    fn from(def: MacroDefinition) -> Self {
        MacroDef::Direct(def)
    }
}

/// A resolved registry entry.
#[derive(Debug, Clone)]
pub struct MacroRef {
    pub def: Rc<MacroDefinition>,
    /// Canonical name when the entry is an alias.
    pub alias_of: Option<String>,
}

impl MacroRef {
    pub fn handler(&self) -> Option<&Handler> {
        self.def.handler()
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Direct(Rc<MacroDefinition>),
    Alias {
        target: String,
        def: Rc<MacroDefinition>,
    },
}

impl Entry {
    fn def(&self) -> &Rc<MacroDefinition> {
        match self {
            Entry::Direct(def) | Entry::Alias { def, .. } => def,
        }
    }

    fn to_ref(&self) -> MacroRef {
        match self {
            Entry::Direct(def) => MacroRef {
                def: def.clone(),
                alias_of: None,
            },
            Entry::Alias { target, def } => MacroRef {
                def: def.clone(),
                alias_of: Some(target.clone()),
            },
        }
    }
}

/// Tag name to the sorted names of every parent macro owning it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagTable(BTreeMap<String, Vec<String>>);

impl TagTable {
    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, tag: &str, parent: &str) {
        let parents = self.0.entry(tag.to_string()).or_default();
        if let Err(at) = parents.binary_search_by(|p| p.as_str().cmp(parent)) {
            parents.insert(at, parent.to_string());
        }
    }

    fn remove_parent(&mut self, parent: &str) {
        self.0.retain(|_, parents| {
            parents.retain(|p| p != parent);
            !parents.is_empty()
        });
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    macros: BTreeMap<String, Entry>,
    tags: TagTable,
    legacy: BTreeMap<String, Rc<MacroDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `def` under every name in `names`.
    ///
    /// Names are processed in order; a failure leaves earlier names registered.
    pub fn add(&mut self, names: &[&str], def: impl Into<MacroDef>) -> Result<(), RegistryError> {
        let entry = match def.into() {
            MacroDef::Direct(def) => Entry::Direct(Rc::new(def)),
            MacroDef::Alias(target) => {
                let Some(def) = self.macros.get(&target).map(|e| e.def().clone()) else {
                    return Err(RegistryError::MissingAliasTarget(target));
                };
                Entry::Alias { target, def }
            }
        };

        for name in names {
            self.add_entry(name, entry.clone())?;
        }
        Ok(())
    }

    fn add_entry(&mut self, name: &str, entry: Entry) -> Result<(), RegistryError> {
        if !patterns::is_macro_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.has(name) {
            return Err(RegistryError::ClobberMacro(name.to_string()));
        }
        if let Some(parents) = self.tags.get(name) {
            return Err(RegistryError::ClobberTag {
                name: name.to_string(),
                parents: parents.to_vec(),
            });
        }

        let children = match entry.def().tags() {
            Tags::None => None,
            Tags::Closing => Some(Vec::new()),
            Tags::Children(children) => Some(children.clone()),
        };
        if let Some(children) = &children {
            self.check_tags(name, children)?;
        }

        debug!(name, alias_of = ?entry.to_ref().alias_of, "registered macro");
        self.macros.insert(name.to_string(), entry);

        if let Some(children) = children {
            self.register_tags(name, &children)?;
        }
        Ok(())
    }

    fn check_tags(&self, parent: &str, children: &[String]) -> Result<(), RegistryError> {
        if parent.is_empty() {
            return Err(RegistryError::NoParent);
        }
        for tag in closing_tags(parent).iter().chain(children) {
            if !patterns::is_macro_name(tag) && !tag.starts_with('/') {
                return Err(RegistryError::InvalidTagName {
                    parent: parent.to_string(),
                    tag: tag.clone(),
                });
            }
            if self.has(tag) || tag == parent {
                return Err(RegistryError::TagIsMacro(tag.clone()));
            }
        }
        Ok(())
    }

    /// Remove every name in `names` along with the tags it solely owns.
    ///
    /// Unknown names are ignored; a name that is only a child tag is an error.
    pub fn delete(&mut self, names: &[&str]) -> Result<(), RegistryError> {
        for name in names {
            if let Some(entry) = self.macros.remove(*name) {
                if entry.def().is_container() {
                    self.tags.remove_parent(name);
                }
                debug!(name, "removed macro");
            } else if let Some(parents) = self.tags.get(name) {
                return Err(RegistryError::RemoveTag {
                    name: name.to_string(),
                    parents: parents.to_vec(),
                });
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    /// The entry for `name`, if it exposes a handler. Falls back to the
    /// legacy table.
    pub fn get(&self, name: &str) -> Option<MacroRef> {
        if let Some(entry) = self.macros.get(name) {
            let found = entry.to_ref();
            if found.handler().is_some() {
                return Some(found);
            }
        }
        self.legacy
            .get(name)
            .filter(|def| def.handler().is_some())
            .map(|def| MacroRef {
                def: def.clone(),
                alias_of: None,
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.macros.keys().map(String::as_str)
    }

    /// Call the one-time hook named `hook` on every registered name whose
    /// definition defines it, aliases included, then on legacy entries.
    pub fn init(&self, hook: &str) {
        let registered = self.macros.iter().map(|(name, entry)| match entry {
            Entry::Direct(def) | Entry::Alias { def, .. } => (name, def),
        });
        for (name, def) in registered.chain(self.legacy.iter()) {
            if let Some(hook_fn) = def.hook(hook) {
                debug!(name = %name, hook, "running macro hook");
                hook_fn(name);
            }
        }
    }

    /// Register a definition in the legacy table. Legacy entries are only
    /// consulted by `get` and `init`.
    pub fn add_legacy(&mut self, name: &str, def: MacroDefinition) {
        self.legacy.insert(name.to_string(), Rc::new(def));
    }

    pub fn tags(&self) -> &TagTable {
        &self.tags
    }

    /// Give `parent` its closing tags plus `children`. A tag already owned by
    /// another parent becomes shared.
    pub fn register_tags(&mut self, parent: &str, children: &[String]) -> Result<(), RegistryError> {
        self.check_tags(parent, children)?;
        for tag in closing_tags(parent).iter().chain(children) {
            self.tags.insert(tag, parent);
        }
        Ok(())
    }

    pub fn unregister_tags(&mut self, parent: &str) -> Result<(), RegistryError> {
        if parent.is_empty() {
            return Err(RegistryError::NoParent);
        }
        self.tags.remove_parent(parent);
        Ok(())
    }
}

fn closing_tags(parent: &str) -> [String; 2] {
    [format!("/{parent}"), format!("end{parent}")]
}
