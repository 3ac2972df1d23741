//! Fallback selector resolution
//!
//! Target-site markup changes without notice, so every logical element
//! (cover letter field, submit button, login indicator) is described by an
//! ordered [`LocatorChain`]. The first locator that yields a visible element
//! wins; a final text-based locator catches buttons whose attributes changed
//! but whose label did not.
//!
//! Selectors are a compound-only CSS subset:
//!
//! - type (`button`) or universal (`*`)
//! - `#id` and `.class`
//! - attribute tests `[a]`, `[a=v]`, `[a*=v]`, `[a^=v]`, `[a$=v]`, `[a~=v]`
//!
//! Combinators, selector lists and pseudo-classes are rejected at parse time.

use applier_core::{ApplierError, Result};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

use crate::dom::{DomNode, DomSnapshot};

/// Attribute comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrOp {
    /// `[a]`
    Exists,
    /// `[a=v]`
    Equals,
    /// `[a*=v]`
    Contains,
    /// `[a^=v]`
    Prefix,
    /// `[a$=v]`
    Suffix,
    /// `[a~=v]`
    Word,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttributeTest {
    name: String,
    op: AttrOp,
    value: String,
}

impl AttributeTest {
    fn matches(&self, node: &DomNode) -> bool {
        let Some(actual) = node.attr(&self.name) else {
            return false;
        };
        match self.op {
            AttrOp::Exists => true,
            AttrOp::Equals => actual == self.value,
            AttrOp::Contains => !self.value.is_empty() && actual.contains(&self.value),
            AttrOp::Prefix => !self.value.is_empty() && actual.starts_with(&self.value),
            AttrOp::Suffix => !self.value.is_empty() && actual.ends_with(&self.value),
            AttrOp::Word => actual.split_whitespace().any(|word| word == self.value),
        }
    }
}

/// A parsed compound selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeTest>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        Parser::new(input).parse()
    }

    /// Selector matching `tag` elements whose `name` attribute equals `value`.
    ///
    /// Built directly so values need no escaping.
    pub fn attribute_equals(tag: Option<&str>, name: &str, value: &str) -> Self {
        Self {
            source: match tag {
                Some(tag) => format!("{}[{}=\"{}\"]", tag, name, value),
                None => format!("[{}=\"{}\"]", name, value),
            },
            tag: tag.map(str::to_lowercase),
            id: None,
            classes: Vec::new(),
            attributes: vec![AttributeTest {
                name: name.to_string(),
                op: AttrOp::Equals,
                value: value.to_string(),
            }],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `node` satisfies every part of the compound
    pub fn matches(&self, node: &DomNode) -> bool {
        if let Some(tag) = &self.tag {
            if node.tag != *tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self
            .classes
            .iter()
            .all(|class| node.classes().any(|c| c == class))
        {
            return false;
        }
        self.attributes.iter().all(|test| test.matches(node))
    }
}

impl FromStr for Selector {
    type Err = ApplierError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.trim().chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ApplierError {
        ApplierError::InvalidSelector {
            selector: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error(format!("expected identifier at offset {}", start)));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse(mut self) -> Result<Selector> {
        if self.chars.is_empty() {
            return Err(self.error("empty selector"));
        }

        let mut selector = Selector {
            source: self.chars.iter().collect(),
            tag: None,
            id: None,
            classes: Vec::new(),
            attributes: Vec::new(),
        };

        match self.peek() {
            Some('*') => {
                self.pos += 1;
            }
            Some(c) if c.is_alphabetic() => {
                selector.tag = Some(self.ident()?.to_lowercase());
            }
            _ => {}
        }

        while let Some(c) = self.bump() {
            match c {
                '#' => {
                    if selector.id.is_some() {
                        return Err(self.error("more than one id"));
                    }
                    selector.id = Some(self.ident()?);
                }
                '.' => selector.classes.push(self.ident()?),
                '[' => selector.attributes.push(self.attribute()?),
                c if c.is_whitespace() || matches!(c, '>' | '+' | '~' | ',') => {
                    return Err(self.error("combinators and selector lists are not supported"));
                }
                ':' => return Err(self.error("pseudo-classes are not supported")),
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            }
        }

        Ok(selector)
    }

    fn attribute(&mut self) -> Result<AttributeTest> {
        self.skip_whitespace();
        let name = self.ident()?;
        self.skip_whitespace();

        let op = match self.bump() {
            Some(']') => {
                return Ok(AttributeTest {
                    name,
                    op: AttrOp::Exists,
                    value: String::new(),
                })
            }
            Some('=') => AttrOp::Equals,
            Some(prefix @ ('*' | '^' | '$' | '~')) => {
                self.expect('=')?;
                match prefix {
                    '*' => AttrOp::Contains,
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    _ => AttrOp::Word,
                }
            }
            Some(c) => return Err(self.error(format!("unsupported attribute operator '{}'", c))),
            None => return Err(self.error("unterminated attribute test")),
        };

        self.skip_whitespace();
        let value = match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != quote) {
                    self.pos += 1;
                }
                let value: String = self.chars[start..self.pos].iter().collect();
                self.expect(quote)?;
                value
            }
            _ => self.ident()?,
        };
        self.skip_whitespace();
        self.expect(']')?;

        Ok(AttributeTest { name, op, value })
    }
}

/// One strategy for finding an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(Selector),
    /// Visible element of one of `tags` whose label contains any needle
    /// (case-insensitive)
    Text {
        tags: Vec<String>,
        needles: Vec<String>,
    },
}

impl Locator {
    pub fn css(selector: &str) -> Result<Self> {
        Ok(Self::Css(Selector::parse(selector)?))
    }

    pub fn text<T, N>(tags: T, needles: N) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
    {
        Self::Text {
            tags: tags.into_iter().map(|t| t.as_ref().to_lowercase()).collect(),
            needles: needles
                .into_iter()
                .map(|n| n.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn matches(&self, node: &DomNode) -> bool {
        match self {
            Self::Css(selector) => selector.matches(node),
            Self::Text { tags, needles } => {
                if !tags.iter().any(|tag| *tag == node.tag) {
                    return false;
                }
                let label = node.label().to_lowercase();
                !label.is_empty() && needles.iter().any(|needle| label.contains(needle.as_str()))
            }
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(selector) => write!(f, "{}", selector),
            Self::Text { tags, needles } => {
                write!(f, "text({}: {})", tags.join("|"), needles.join("|"))
            }
        }
    }
}

/// Ordered fallback list for one logical element.
///
/// Resolution is deterministic: the first locator with a visible match wins,
/// and within a locator the first visible node in document order. Nothing is
/// cached, so an element that disappears is re-resolved through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorChain {
    name: String,
    locators: Vec<Locator>,
}

impl LocatorChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locators: Vec::new(),
        }
    }

    /// Build a chain from configured selector strings, in order
    pub fn from_selectors<S: AsRef<str>>(name: impl Into<String>, selectors: &[S]) -> Result<Self> {
        let mut chain = Self::new(name);
        for selector in selectors {
            chain.locators.push(Locator::css(selector.as_ref())?);
        }
        Ok(chain)
    }

    pub fn with(mut self, locator: Locator) -> Self {
        self.locators.push(locator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    pub fn resolve<'a>(&self, snapshot: &'a DomSnapshot) -> Option<&'a DomNode> {
        self.resolve_where(snapshot, |_| true)
    }

    /// Resolve with an extra acceptance test applied to every candidate
    pub fn resolve_where<'a, F>(&self, snapshot: &'a DomSnapshot, accept: F) -> Option<&'a DomNode>
    where
        F: Fn(&DomNode) -> bool,
    {
        for (index, locator) in self.locators.iter().enumerate() {
            let found = snapshot
                .nodes
                .iter()
                .find(|node| node.visible && locator.matches(node) && accept(node));
            if let Some(node) = found {
                trace!(
                    "{} resolved by locator {} ({}) to {}",
                    self.name,
                    index,
                    locator,
                    node.id
                );
                return Some(node);
            }
        }
        None
    }
}
