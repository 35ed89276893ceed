//! Generic state-function lexer.
//!
//! A grammar is a set of plain functions, each scanning some input through
//! the [`Lexer`] cursor and returning the next state to run (or `None` to
//! stop). The lexer itself knows nothing about any particular grammar.
//!
//! The cursor steps over Unicode scalar values, so `start`/`pos` on emitted
//! tokens are character indices rather than byte offsets.

use std::collections::VecDeque;
use std::fmt;

use regex::Regex;

/// A state function. Wrapped in a newtype so it can name itself.
pub struct State<K>(pub fn(&mut Lexer<K>) -> Option<State<K>>);

impl<K> Clone for State<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for State<K> {}

impl<K> fmt::Debug for State<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&(self.0 as usize)).finish()
    }
}

/// A scanned item.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<K> {
    pub kind: K,
    pub text: String,
    pub start: usize,
    pub pos: usize,
    /// Present only on error tokens.
    pub message: Option<String>,
}

impl<K> Token<K> {
    pub fn is_error(&self) -> bool {
        self.message.is_some()
    }
}

pub struct Lexer<K> {
    source: Vec<char>,
    initial: State<K>,
    state: Option<State<K>>,
    /// Start of the item currently being scanned.
    pub start: usize,
    /// Current cursor position.
    pub pos: usize,
    /// Bracket/brace nesting depth, free for grammars to use.
    pub depth: isize,
    items: VecDeque<Token<K>>,
}

impl<K: Copy> Lexer<K> {
    pub fn new(source: &str, initial: State<K>) -> Self {
        Self {
            source: source.chars().collect(),
            initial,
            state: Some(initial),
            start: 0,
            pos: 0,
            depth: 0,
            items: VecDeque::new(),
        }
    }

    /// Restore the initial cursor, queue and state.
    pub fn reset(&mut self) {
        self.state = Some(self.initial);
        self.start = 0;
        self.pos = 0;
        self.depth = 0;
        self.items.clear();
    }

    /// Reset and scan a new source with the same initial state.
    pub fn reset_with(&mut self, source: &str) {
        self.source = source.chars().collect();
        self.reset();
    }

    /// Scan until no states remain and return every item produced.
    pub fn run(&mut self) -> Vec<Token<K>> {
        while let Some(state) = self.state {
            self.state = (state.0)(self);
        }
        self.items.drain(..).collect()
    }

    /// Scan only as far as needed to produce the next item.
    pub fn next_item(&mut self) -> Option<Token<K>> {
        while self.items.is_empty() {
            let state = self.state?;
            self.state = (state.0)(self);
        }
        self.items.pop_front()
    }

    /// Pull-based iterator over [`Lexer::next_item`].
    pub fn items(&mut self) -> Items<'_, K> {
        Items { lexer: self }
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.source.len()
    }

    /// The text scanned so far for the current item.
    pub fn pending(&self) -> String {
        self.slice(self.start, self.pos)
    }

    /// Everything from the cursor to the end of the source.
    pub fn rest(&self) -> String {
        self.slice(self.pos, self.source.len())
    }

    fn slice(&self, start: usize, end: usize) -> String {
        let end = end.min(self.source.len());
        let start = start.min(end);
        self.source[start..end].iter().collect()
    }

    /// Return the current character and advance, or `None` at end of input.
    pub fn next(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        Some(ch)
    }

    /// Return the current character without advancing.
    pub fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    pub fn backup(&mut self, n: usize) {
        self.pos = self.pos.saturating_sub(n);
    }

    pub fn forward(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.source.len());
    }

    /// Drop the pending text; the next item starts at the cursor.
    pub fn ignore(&mut self) {
        self.start = self.pos;
    }

    pub fn accept(&mut self, valid: &str) -> bool {
        self.accept_with(|ch| valid.contains(ch))
    }

    pub fn accept_re(&mut self, valid: &Regex) -> bool {
        self.accept_with(|ch| char_matches(valid, ch))
    }

    pub fn accept_run(&mut self, valid: &str) {
        self.accept_run_with(|ch| valid.contains(ch));
    }

    pub fn accept_run_re(&mut self, valid: &Regex) {
        self.accept_run_with(|ch| char_matches(valid, ch));
    }

    fn accept_with(&mut self, test: impl Fn(char) -> bool) -> bool {
        match self.next() {
            None => false,
            Some(ch) if test(ch) => true,
            Some(_) => {
                self.backup(1);
                false
            }
        }
    }

    fn accept_run_with(&mut self, test: impl Fn(char) -> bool) {
        loop {
            match self.next() {
                None => return,
                Some(ch) if test(ch) => continue,
                Some(_) => break,
            }
        }
        self.backup(1);
    }

    /// Queue an item for `[start, pos)` and start the next one at `pos`.
    pub fn emit(&mut self, kind: K) {
        self.items.push_back(Token {
            kind,
            text: self.pending(),
            start: self.start,
            pos: self.pos,
            message: None,
        });
        self.start = self.pos;
    }

    /// Queue an error item. Returns `None` so a state can `return lexer.error(..)`.
    pub fn error(&mut self, kind: K, message: impl Into<String>) -> Option<State<K>> {
        self.items.push_back(Token {
            kind,
            text: self.pending(),
            start: self.start,
            pos: self.pos,
            message: Some(message.into()),
        });
        None
    }
}

fn char_matches(re: &Regex, ch: char) -> bool {
    let mut buf = [0u8; 4];
    re.is_match(ch.encode_utf8(&mut buf))
}

pub struct Items<'a, K> {
    lexer: &'a mut Lexer<K>,
}

impl<K: Copy> Iterator for Items<'_, K> {
    type Item = Token<K>;

    fn next(&mut self) -> Option<Token<K>> {
        self.lexer.next_item()
    }
}
