//! Streaming content rewriters
//!
//! A rewriter consumes a response body chunk by chunk and re-emits it with the
//! embedded links replaced. What a link is replaced with is decided by
//! asynchronous hooks supplied by the caller; the rewriters themselves only
//! know how to find links without corrupting the surrounding bytes.
//!
//! - [`MarkupRewriter`]: incremental tag/attribute parser for HTML
//! - [`StylesheetRewriter`]: `url(...)` / `@import` rewriting for CSS
//! - [`Passthrough`]: identity, used for every other content type

mod css;
mod html;

pub use css::{rewrite_css, StylesheetRewriter};
pub use html::{is_void_element, MarkupRewriter};

use crate::url::mime::essence;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A streaming byte transformer
///
/// `transform` may hold back an incomplete construct until a later call;
/// `finish` flushes whatever is left and must be called exactly once at end of
/// stream.
#[async_trait]
pub trait ContentRewriter: Send {
    async fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>>;

    async fn finish(&mut self) -> Result<Vec<u8>>;
}

/// Identity rewriter
#[derive(Debug, Default)]
pub struct Passthrough;

#[async_trait]
impl ContentRewriter for Passthrough {
    async fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        Ok(chunk.to_vec())
    }

    async fn finish(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// One attribute of an opened tag as seen by hooks
///
/// Names are lowercase; values are entity-decoded. `None` is an attribute
/// written without a value (`<input disabled>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAttribute {
    pub name: String,
    pub value: Option<String>,
}

/// A mutable view of an opened tag, passed through the markup hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEvent {
    name: String,
    attributes: Vec<TagAttribute>,
    deleted: bool,
}

impl TagEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            attributes: Vec::new(),
            deleted: false,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.push(TagAttribute {
            name: name.to_ascii_lowercase(),
            value: Some(value.to_string()),
        });
        self
    }

    /// Lowercase element name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[TagAttribute] {
        &self.attributes
    }

    /// Value of the first attribute with this name; valueless attributes read as `""`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.value.as_deref().unwrap_or(""))
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets an attribute, keeping its position if it already exists
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = Some(value.into());
        match self
            .attributes
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
        {
            Some(attr) => attr.value = value,
            None => self.attributes.push(TagAttribute {
                name: name.to_ascii_lowercase(),
                value,
            }),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))?;
        self.attributes.remove(index).value
    }

    /// Suppresses the whole tag (and its matching close tag) in the output
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn from_parts(name: String, attributes: Vec<TagAttribute>) -> Self {
        Self {
            name,
            attributes,
            deleted: false,
        }
    }
}

/// Hooks invoked by the markup rewriter, in registration order
#[async_trait]
pub trait MarkupHook: Send + Sync {
    /// Called once per opened tag, in document order
    async fn on_tag(&self, _tag: &mut TagEvent) -> Result<()> {
        Ok(())
    }

    /// Called with the full content of a `<style>` element
    async fn on_style(&self, css: String) -> Result<String> {
        Ok(css)
    }

    /// Called with text between tags
    async fn on_text(&self, text: String) -> Result<String> {
        Ok(text)
    }
}

/// Where a stylesheet link was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CssLinkKind {
    /// `url(...)`
    Url,
    /// `@import "..."` or `@import url(...)`
    Import,
}

/// Hook invoked for every link found in a stylesheet
#[async_trait]
pub trait CssHook: Send + Sync {
    /// Returns the replacement for `link`
    async fn on_link(&self, link: String, kind: CssLinkKind) -> Result<String>;
}

/// The hooks handed to every rewriter built for one resource
#[derive(Clone, Default)]
pub struct RewriteHooks {
    pub markup: Vec<Arc<dyn MarkupHook>>,
    pub css: Vec<Arc<dyn CssHook>>,
}

impl fmt::Debug for RewriteHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteHooks")
            .field("markup", &self.markup.len())
            .field("css", &self.css.len())
            .finish()
    }
}

/// Which rewriter handles a content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriterKind {
    Markup,
    Stylesheet,
    Passthrough,
}

/// Maps normalized content types to rewriter kinds
///
/// Unknown content types are passed through unchanged.
#[derive(Debug, Clone)]
pub struct RewriterRegistry {
    kinds: HashMap<String, RewriterKind>,
}

impl Default for RewriterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("text/html", RewriterKind::Markup);
        registry.register("application/xhtml+xml", RewriterKind::Markup);
        registry.register("text/css", RewriterKind::Stylesheet);
        registry
    }
}

impl RewriterRegistry {
    /// A registry that passes everything through
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn register(&mut self, mime: &str, kind: RewriterKind) {
        self.kinds.insert(essence(mime), kind);
    }

    pub fn kind_for(&self, mime: &str) -> RewriterKind {
        self.kinds
            .get(&essence(mime))
            .copied()
            .unwrap_or(RewriterKind::Passthrough)
    }

    /// Builds a fresh rewriter for one response body
    pub fn create(&self, mime: &str, hooks: &RewriteHooks) -> Box<dyn ContentRewriter> {
        match self.kind_for(mime) {
            RewriterKind::Markup => Box::new(MarkupRewriter::new(hooks.markup.clone())),
            RewriterKind::Stylesheet => Box::new(StylesheetRewriter::new(hooks.css.clone())),
            RewriterKind::Passthrough => Box::new(Passthrough),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = RewriterRegistry::default();
        assert_eq!(registry.kind_for("text/html"), RewriterKind::Markup);
        assert_eq!(
            registry.kind_for("Text/HTML; charset=utf-8"),
            RewriterKind::Markup
        );
        assert_eq!(registry.kind_for("text/css"), RewriterKind::Stylesheet);
        assert_eq!(registry.kind_for("image/png"), RewriterKind::Passthrough);
    }

    #[test]
    fn test_registry_override() {
        let mut registry = RewriterRegistry::default();
        registry.register("text/css", RewriterKind::Passthrough);
        assert_eq!(registry.kind_for("text/css"), RewriterKind::Passthrough);
    }

    #[test]
    fn test_tag_event_editing() {
        let mut tag = TagEvent::new("A").with_attribute("HREF", "x.html");
        assert_eq!(tag.name(), "a");
        assert_eq!(tag.get("href"), Some("x.html"));

        tag.set("href", "y.html");
        tag.set("rel", "next");
        assert_eq!(tag.attributes().len(), 2);
        assert_eq!(tag.attributes()[0].value.as_deref(), Some("y.html"));

        assert_eq!(tag.remove("rel"), Some("next".to_string()));
        assert!(!tag.has("rel"));

        assert!(!tag.is_deleted());
        tag.delete();
        assert!(tag.is_deleted());
    }

    #[tokio::test]
    async fn test_passthrough() {
        let mut rewriter = Passthrough;
        assert_eq!(rewriter.transform(b"abc").await.unwrap(), b"abc");
        assert!(rewriter.finish().await.unwrap().is_empty());
    }
}
