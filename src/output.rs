//! Minimal render target: a shared list of text runs, elements, inline error
//! views and debug views.
//!
//! Handles are cheap `Rc` clones so deferred callbacks can keep appending to
//! a node after the render that created it has finished.

use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

/// Title prefixed to every rendered error message.
pub const ERROR_VIEW_TITLE: &str = "Error";

#[derive(Clone, Default)]
pub struct Output(Rc<RefCell<Vec<Node>>>);

#[derive(Debug, Clone)]
pub enum Node {
    Text(String),
    Element(Element),
    Error(ErrorView),
    Debug(DebugView),
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ptr_eq(&self, other: &Output) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn nodes(&self) -> Ref<'_, Vec<Node>> {
        self.0.borrow()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn append(&self, node: Node) {
        self.0.borrow_mut().push(node);
    }

    /// Append text, merging with a trailing text run.
    pub fn push_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut nodes = self.0.borrow_mut();
        if let Some(Node::Text(last)) = nodes.last_mut() {
            last.push_str(text);
        } else {
            nodes.push(Node::Text(text.to_string()));
        }
    }

    pub fn append_element(&self, tag: &str) -> Element {
        let element = Element::new(tag);
        self.append(Node::Element(element.clone()));
        element
    }

    pub fn append_error(&self, message: &str, source: &str) -> ErrorView {
        let view = ErrorView {
            message: if message.is_empty() {
                "unknown error".to_string()
            } else {
                message.to_string()
            },
            source: source.to_string(),
        };
        self.append(Node::Error(view.clone()));
        view
    }

    /// Put `replacement` where `target` sits among this output's own nodes.
    pub fn replace_element(&self, target: &Element, replacement: Node) -> bool {
        let mut nodes = self.0.borrow_mut();
        let slot = nodes
            .iter_mut()
            .find(|node| matches!(node, Node::Element(el) if el.ptr_eq(target)));
        match slot {
            Some(slot) => {
                *slot = replacement;
                true
            }
            None => false,
        }
    }

    /// Move every node out of `other` onto the end of this output.
    pub fn append_all(&self, other: &Output) {
        if self.ptr_eq(other) {
            return;
        }
        let moved: Vec<Node> = other.0.borrow_mut().drain(..).collect();
        self.0.borrow_mut().extend(moved);
    }

    /// Flattened visible text. Error views render as `Error: <message>`.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) {
        for node in self.0.borrow().iter() {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.content().write_text(out),
                Node::Error(err) => {
                    out.push_str(ERROR_VIEW_TITLE);
                    out.push_str(": ");
                    out.push_str(&err.message);
                }
                Node::Debug(view) => view.output().write_text(out),
            }
        }
    }

    /// Every error message in this output, depth first.
    pub fn errors(&self) -> Vec<String> {
        let mut found = Vec::new();
        self.collect_errors(&mut found);
        found
    }

    fn collect_errors(&self, found: &mut Vec<String>) {
        for node in self.0.borrow().iter() {
            match node {
                Node::Text(_) => {}
                Node::Element(el) => el.content().collect_errors(found),
                Node::Error(err) => found.push(err.message.clone()),
                Node::Debug(view) => view.output().collect_errors(found),
            }
        }
    }

    /// Every element (at any depth) carrying `class`.
    pub fn find_by_class(&self, class: &str) -> Vec<Element> {
        let mut found = Vec::new();
        self.collect_class(class, &mut found);
        found
    }

    fn collect_class(&self, class: &str, found: &mut Vec<Element>) {
        for node in self.0.borrow().iter() {
            match node {
                Node::Element(el) => {
                    if el.has_class(class) {
                        found.push(el.clone());
                    }
                    el.content().collect_class(class, found);
                }
                Node::Debug(view) => view.output().collect_class(class, found),
                Node::Text(_) | Node::Error(_) => {}
            }
        }
    }

    fn remove_debug_view(&self, view: &DebugView) {
        let mut nodes = self.0.borrow_mut();
        let Some(index) = nodes
            .iter()
            .position(|node| matches!(node, Node::Debug(v) if v.ptr_eq(view)))
        else {
            return;
        };
        nodes.remove(index);
        let children: Vec<Node> = view.output().0.borrow_mut().drain(..).collect();
        for (offset, child) in children.into_iter().enumerate() {
            nodes.insert(index + offset, child);
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.borrow().iter()).finish()
    }
}

struct ElementData {
    tag: String,
    classes: RefCell<BTreeSet<String>>,
    attrs: RefCell<BTreeMap<String, String>>,
    content: Output,
}

/// A named container node.
#[derive(Clone)]
pub struct Element(Rc<ElementData>);

impl Element {
    pub fn new(tag: &str) -> Self {
        Self(Rc::new(ElementData {
            tag: tag.to_string(),
            classes: RefCell::default(),
            attrs: RefCell::default(),
            content: Output::new(),
        }))
    }

    pub fn ptr_eq(&self, other: &Element) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn tag(&self) -> &str {
        &self.0.tag
    }

    pub fn content(&self) -> Output {
        self.0.content.clone()
    }

    /// Add whitespace-separated class names.
    pub fn add_class(&self, classes: &str) -> &Self {
        let mut set = self.0.classes.borrow_mut();
        for class in classes.split_whitespace() {
            set.insert(class.to_string());
        }
        self
    }

    pub fn remove_class(&self, class: &str) -> &Self {
        self.0.classes.borrow_mut().remove(class);
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.0.classes.borrow().contains(class)
    }

    pub fn set_attr(&self, name: &str, value: impl Into<String>) -> &Self {
        self.0.attrs.borrow_mut().insert(name.to_string(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.0.attrs.borrow().get(name).cloned()
    }

    pub fn text(&self) -> String {
        self.0.content.text()
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.0.tag)
            .field("classes", &self.0.classes.borrow())
            .field("attrs", &self.0.attrs.borrow())
            .field("content", &self.0.content)
            .finish()
    }
}

/// An inline, non-fatal error block with its offending source text.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorView {
    pub message: String,
    pub source: String,
}

struct DebugViewData {
    parent: Output,
    view: Output,
    kind: String,
    name: RefCell<String>,
    title: RefCell<String>,
    modes: RefCell<BTreeSet<String>>,
}

/// Labelled wrapper showing which macro produced a piece of output.
#[derive(Clone)]
pub struct DebugView(Rc<DebugViewData>);

impl DebugView {
    /// Create a view and append it to `parent`.
    pub fn new(parent: &Output, kind: &str, name: &str, title: &str) -> Self {
        let view = Self(Rc::new(DebugViewData {
            parent: parent.clone(),
            view: Output::new(),
            kind: kind.to_string(),
            name: RefCell::new(name.to_string()),
            title: RefCell::new(title.to_string()),
            modes: RefCell::default(),
        }));
        parent.append(Node::Debug(view.clone()));
        view
    }

    pub fn ptr_eq(&self, other: &DebugView) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn output(&self) -> Output {
        self.0.view.clone()
    }

    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    pub fn name(&self) -> String {
        self.0.name.borrow().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.0.name.borrow_mut() = name.to_string();
    }

    pub fn title(&self) -> String {
        self.0.title.borrow().clone()
    }

    pub fn set_title(&self, title: &str) {
        *self.0.title.borrow_mut() = title.to_string();
    }

    /// Switch display modes (`block`, `hidden`, `nonvoid`, ...) on or off.
    pub fn set_modes(&self, modes: &[(&str, bool)]) -> &Self {
        let mut current = self.0.modes.borrow_mut();
        for (mode, enabled) in modes {
            if *enabled {
                current.insert(mode.to_string());
            } else {
                current.remove(*mode);
            }
        }
        self
    }

    pub fn modes(&self) -> BTreeSet<String> {
        self.0.modes.borrow().clone()
    }

    /// Detach the view, leaving its children in its place.
    pub fn remove(&self) {
        self.0.parent.remove_debug_view(self);
    }
}

impl fmt::Debug for DebugView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugView")
            .field("kind", &self.0.kind)
            .field("name", &self.0.name.borrow())
            .field("modes", &self.0.modes.borrow())
            .field("view", &self.0.view)
            .finish()
    }
}
