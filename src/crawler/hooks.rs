//! Rewrite hooks that turn remote links into local ones
//!
//! One [`ResourceHooks`] instance serves one resource. For every link it:
//! 1. resolves it against the document's base URL
//! 2. asks the registry whether the target is allowed
//! 3. if allowed, maps the target to its local file and returns the relative
//!    path from this document; otherwise returns the absolute remote URL
//! 4. remembers allowed targets the registry has never seen, so the
//!    coordinator can queue them once this resource is finished

use crate::crawler::resource::SessionContext;
use crate::rewrite::{rewrite_css, CssHook, CssLinkKind, MarkupHook, RewriteHooks, TagEvent};
use crate::url::mime::{CSS_MIME, HTML_MIME, OCTET_STREAM};
use crate::url::relative_url_between;
use crate::{MirrorError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

/// A link found while rewriting, waiting to be queued
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredLink {
    /// Normalized absolute URL
    pub url: Url,
    /// File the referring document now links to
    pub local_path: PathBuf,
    pub mime: String,
    pub referer: Url,
}

/// How the MIME type of a link target is determined
#[derive(Debug, Clone, Copy)]
enum MimeHint {
    /// Always this type
    Fixed(&'static str),
    /// Guessed from the URL extension, else this type
    Guess(&'static str),
}

/// Metadata collected from one document
#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub discovered: Vec<DiscoveredLink>,
    pub canonical_url: Option<Url>,
    /// Set when a `<base>` tag overrode the document URL
    pub base_url: Option<Url>,
}

#[derive(Debug)]
struct LinkState {
    base_url: Url,
    outcome: LinkOutcome,
    seen: HashSet<String>,
}

/// Link-resolving hooks for a single resource
pub struct ResourceHooks {
    session: Arc<SessionContext>,
    page_url: Url,
    page_path: PathBuf,
    state: Mutex<LinkState>,
}

impl ResourceHooks {
    /// # Arguments
    ///
    /// * `session` - The crawl session
    /// * `page_url` - URL the document was served from
    /// * `page_path` - Local file the document is written to
    pub fn new(session: Arc<SessionContext>, page_url: Url, page_path: PathBuf) -> Self {
        Self {
            session,
            state: Mutex::new(LinkState {
                base_url: page_url.clone(),
                outcome: LinkOutcome::default(),
                seen: HashSet::new(),
            }),
            page_url,
            page_path,
        }
    }

    /// Hook set for [`crate::rewrite::RewriterRegistry::create`]
    pub fn rewrite_hooks(self: &Arc<Self>) -> RewriteHooks {
        RewriteHooks {
            markup: vec![self.clone()],
            css: vec![self.clone()],
        }
    }

    /// Hands out what was collected so far
    pub fn take_outcome(&self) -> LinkOutcome {
        std::mem::take(&mut self.lock().outcome)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a raw link to an absolute http(s) URL
    ///
    /// Empty links, pure fragments and other schemes yield `None`.
    fn absolute(&self, raw: &str) -> Option<Url> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }
        let base = self.lock().base_url.clone();
        let url = base.join(raw).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }

    /// Returns the replacement for a link, or `None` to leave it untouched
    fn resolve(&self, raw: &str, hint: MimeHint) -> Option<String> {
        let absolute = self.absolute(raw)?;
        let normalized = self.session.normalize(&absolute).ok()?;

        let mut registry = self.session.registry();
        if !registry.query_allowed(&normalized) {
            tracing::trace!("Denied link {}", absolute);
            return Some(absolute.to_string());
        }
        let is_new = registry.get_or_create(&normalized).is_new();
        drop(registry);

        let options = &self.session.options;
        let mime = match hint {
            MimeHint::Fixed(mime) => mime,
            MimeHint::Guess(fallback) => options.mimes.lookup_url(&normalized).unwrap_or(fallback),
        };
        let local_path = self.session.local_path_for(&normalized, mime);
        let href = relative_url_between(&local_path, &self.page_path, Some(&absolute));

        if is_new {
            let mut state = self.lock();
            if state.seen.insert(normalized.to_string()) {
                tracing::debug!("Discovered {} ({})", normalized, mime);
                state.outcome.discovered.push(DiscoveredLink {
                    url: normalized,
                    local_path,
                    mime: mime.to_string(),
                    referer: self.page_url.clone(),
                });
            }
        }
        Some(href)
    }

    fn rewrite_attribute(&self, tag: &mut TagEvent, attribute: &str, hint: MimeHint) {
        let Some(value) = tag.get(attribute) else {
            return;
        };
        if let Some(replacement) = self.resolve(value, hint) {
            tag.set(attribute, replacement);
        }
    }

    async fn rewrite_style(&self, css: &str) -> Result<String> {
        let out = rewrite_css(css.as_bytes(), &[self as &dyn CssHook]).await?;
        String::from_utf8(out).map_err(|e| MirrorError::Rewrite(e.to_string()))
    }

    fn handle_link_tag(&self, tag: &mut TagEvent) {
        let rel: Vec<String> = tag
            .get("rel")
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_ascii_lowercase)
            .collect();
        let has = |token: &str| rel.iter().any(|r| r == token);

        if has("canonical") {
            if let Some(canonical) = tag
                .get("href")
                .and_then(|href| self.absolute(href))
                .and_then(|url| self.session.normalize(&url).ok())
            {
                self.mark_canonical(canonical);
            }
            tag.delete();
        } else if has("stylesheet") {
            self.rewrite_attribute(tag, "href", MimeHint::Fixed(CSS_MIME));
        } else if rel.iter().any(|r| r.contains("icon")) {
            self.rewrite_attribute(tag, "href", MimeHint::Guess("image/x-icon"));
        }
    }

    /// Records the document's canonical URL and claims it as an alias
    fn mark_canonical(&self, canonical: Url) {
        let mut registry = self.session.registry();
        if registry.query_allowed(&canonical) {
            registry.mark_queued(&canonical);
        }
        drop(registry);
        tracing::debug!("{} declares canonical {}", self.page_url, canonical);
        self.lock().outcome.canonical_url = Some(canonical);
    }

    fn handle_base_tag(&self, tag: &mut TagEvent) {
        if let Some(base) = tag.get("href").and_then(|href| self.absolute(href)) {
            let mut state = self.lock();
            state.base_url = base.clone();
            state.outcome.base_url = Some(base);
        }
        tag.delete();
    }

    fn handle_meta_refresh(&self, tag: &mut TagEvent) {
        let is_refresh = tag
            .get("http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("refresh"));
        if !is_refresh {
            return;
        }
        let Some((delay, target)) = tag.get("content").and_then(split_refresh) else {
            return;
        };
        if let Some(replacement) = self.resolve(target, MimeHint::Fixed(HTML_MIME)) {
            let content = format!("{}; url={}", delay, replacement);
            tag.set("content", content);
        }
    }
}

/// Splits `"5; url=/next.html"` into `("5", "/next.html")`
fn split_refresh(content: &str) -> Option<(&str, &str)> {
    let (delay, rest) = content.split_once([';', ','])?;
    let rest = rest.trim_start();
    let target = match rest.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("url") => {
            rest[3..].trim_start().strip_prefix('=')?.trim()
        }
        _ => rest.trim(),
    };
    let target = target.trim_matches(|c| c == '"' || c == '\'');
    (!target.is_empty()).then_some((delay.trim(), target))
}

#[async_trait]
impl MarkupHook for ResourceHooks {
    async fn on_tag(&self, tag: &mut TagEvent) -> Result<()> {
        match tag.name() {
            "a" | "area" => self.rewrite_attribute(tag, "href", MimeHint::Guess(HTML_MIME)),
            "link" => self.handle_link_tag(tag),
            "img" => self.rewrite_attribute(tag, "src", MimeHint::Guess("image/jpeg")),
            "source" | "video" | "audio" | "embed" => {
                self.rewrite_attribute(tag, "src", MimeHint::Guess(OCTET_STREAM))
            }
            "script" => self.rewrite_attribute(tag, "src", MimeHint::Fixed("application/javascript")),
            "iframe" => self.rewrite_attribute(tag, "src", MimeHint::Fixed(HTML_MIME)),
            "form" => self.rewrite_attribute(tag, "action", MimeHint::Fixed(HTML_MIME)),
            "button" => self.rewrite_attribute(tag, "formaction", MimeHint::Fixed(HTML_MIME)),
            "option" => {
                let absolute = tag.get("value").is_some_and(|v| {
                    let v = v.trim_start().to_ascii_lowercase();
                    v.starts_with("http:") || v.starts_with("https:")
                });
                if absolute {
                    self.rewrite_attribute(tag, "value", MimeHint::Fixed(HTML_MIME));
                }
            }
            "meta" => self.handle_meta_refresh(tag),
            "base" => self.handle_base_tag(tag),
            _ => {}
        }

        if let Some(style) = tag.get("style").filter(|s| s.to_ascii_lowercase().contains("url(")) {
            let style = style.to_string();
            let rewritten = self.rewrite_style(&style).await?;
            if rewritten != style {
                tag.set("style", rewritten);
            }
        }
        Ok(())
    }

    async fn on_style(&self, css: String) -> Result<String> {
        self.rewrite_style(&css).await
    }
}

#[async_trait]
impl CssHook for ResourceHooks {
    async fn on_link(&self, link: String, kind: CssLinkKind) -> Result<String> {
        let fallback = match kind {
            CssLinkKind::Import => CSS_MIME,
            CssLinkKind::Url => OCTET_STREAM,
        };
        Ok(self.resolve(&link, MimeHint::Guess(fallback)).unwrap_or(link))
    }
}
