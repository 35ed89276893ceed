use std::borrow::Cow;

/// A top-level piece of passage source.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    Text(Cow<'a, str>),
    Tag(Tag<'a>),
}

/// A `<<name args>>` tag, with byte offsets into the parsed source.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag<'a> {
    pub name: Cow<'a, str>,
    /// Raw argument text, leading whitespace removed.
    pub args: Cow<'a, str>,
    /// The whole tag as written.
    pub source: &'a str,
    pub start: usize,
    pub end: usize,
}

impl Tag<'_> {
    /// `/name` or `endname` for `parent`.
    pub fn closes(&self, parent: &str) -> bool {
        self.name
            .strip_prefix('/')
            .or_else(|| self.name.strip_prefix("end"))
            .is_some_and(|rest| rest == parent)
    }
}

/// One clause of a container macro's body: the opening tag or a child tag,
/// followed by the source up to the next clause or the closing tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause<'a> {
    pub name: Cow<'a, str>,
    pub args: Cow<'a, str>,
    pub contents: &'a str,
    pub source: &'a str,
}

/// Result of pairing an opening tag with its closing tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Body<'a> {
    pub clauses: Vec<Clause<'a>>,
    /// Index of the segment after the closing tag.
    pub next: usize,
    /// Byte offset just past the closing tag.
    pub end: usize,
}
