//! Stylesheet link rewriting
//!
//! Links are found with a regular expression on raw bytes. Matching is
//! synchronous while hooks are not, so each flushed segment is handled in two
//! passes: the first splits it into literal pieces and placeholders and starts
//! one hook future per placeholder, the second awaits all of them and stitches
//! the results back in.

use crate::rewrite::{ContentRewriter, CssHook, CssLinkKind};
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use regex::bytes::Regex;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)(@import\s*)?url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"\s]*))\s*\)|@import\s*(?:"([^"]*)"|'([^']*)')"#,
        )
        .expect("link pattern is a valid regex")
    })
}

enum Segment {
    Literal(Range<usize>),
    Link(usize),
}

/// Rewrites every `url(...)` and `@import` link in `css`
///
/// Only the link text itself is replaced; quotes, whitespace and the rest of
/// the stylesheet are kept byte for byte. Hooks are applied in order, each
/// seeing the previous one's result.
pub async fn rewrite_css(css: &[u8], hooks: &[&dyn CssHook]) -> Result<Vec<u8>> {
    if hooks.is_empty() {
        return Ok(css.to_vec());
    }

    let mut segments = Vec::new();
    let mut links: Vec<(Range<usize>, CssLinkKind)> = Vec::new();
    let mut last = 0;

    for caps in link_pattern().captures_iter(css) {
        let kind = if caps.get(1).is_some() || caps.get(5).is_some() || caps.get(6).is_some() {
            CssLinkKind::Import
        } else {
            CssLinkKind::Url
        };
        let Some(link) = (2..=6).find_map(|i| caps.get(i)) else {
            continue;
        };
        if link.as_bytes().is_empty() {
            continue;
        }
        segments.push(Segment::Literal(last..link.start()));
        segments.push(Segment::Link(links.len()));
        links.push((link.range(), kind));
        last = link.end();
    }

    if links.is_empty() {
        return Ok(css.to_vec());
    }
    segments.push(Segment::Literal(last..css.len()));

    let resolved = join_all(links.iter().map(|(range, kind)| {
        let original = String::from_utf8_lossy(&css[range.clone()]).into_owned();
        resolve_link(original, *kind, hooks)
    }))
    .await
    .into_iter()
    .collect::<Result<Vec<_>>>()?;

    let mut out = Vec::with_capacity(css.len());
    for segment in segments {
        match segment {
            Segment::Literal(range) => out.extend_from_slice(&css[range]),
            Segment::Link(index) => {
                let original = &css[links[index].0.clone()];
                let link = resolved[index].as_bytes();
                if link == original {
                    out.extend_from_slice(original);
                } else {
                    out.extend_from_slice(link);
                }
            }
        }
    }
    Ok(out)
}

async fn resolve_link(link: String, kind: CssLinkKind, hooks: &[&dyn CssHook]) -> Result<String> {
    let mut link = link;
    for hook in hooks {
        link = hook.on_link(link, kind).await?;
    }
    Ok(link)
}

/// Position just past the last `}` that closes a block
///
/// Braces inside comments, strings or parentheses do not count, so nothing
/// before the returned position can be part of an unfinished token.
fn flush_boundary(css: &[u8]) -> Option<usize> {
    let mut boundary = None;
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut i = 0;
    while i < css.len() {
        let b = css[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\\' => i += 1,
                b'"' | b'\'' => quote = Some(b),
                b'/' if css.get(i + 1) == Some(&b'*') => {
                    match find_comment_end(css, i + 2) {
                        Some(end) => i = end,
                        None => break,
                    }
                    continue;
                }
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b'}' if depth == 0 => boundary = Some(i + 1),
                _ => {}
            },
        }
        i += 1;
    }
    boundary
}

/// Position just past the `*/` that closes a comment starting before `from`
fn find_comment_end(css: &[u8], from: usize) -> Option<usize> {
    css.get(from..)?
        .windows(2)
        .position(|w| w == b"*/")
        .map(|p| from + p + 2)
}

/// Streaming stylesheet rewriter
///
/// Input is only flushed up to the last `}` that closes a block, so a link is
/// never cut in two by a chunk boundary; the remainder waits for more input or
/// the end of the stream.
pub struct StylesheetRewriter {
    hooks: Vec<Arc<dyn CssHook>>,
    pending: Vec<u8>,
}

impl StylesheetRewriter {
    pub fn new(hooks: Vec<Arc<dyn CssHook>>) -> Self {
        Self {
            hooks,
            pending: Vec::new(),
        }
    }

    async fn rewrite(&self, segment: &[u8]) -> Result<Vec<u8>> {
        let hooks: Vec<&dyn CssHook> = self.hooks.iter().map(|h| h.as_ref()).collect();
        rewrite_css(segment, &hooks).await
    }
}

#[async_trait]
impl ContentRewriter for StylesheetRewriter {
    async fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let Some(boundary) = flush_boundary(&self.pending) else {
            return Ok(Vec::new());
        };
        let rest = self.pending.split_off(boundary);
        let segment = std::mem::replace(&mut self.pending, rest);
        self.rewrite(&segment).await
    }

    async fn finish(&mut self) -> Result<Vec<u8>> {
        let segment = std::mem::take(&mut self.pending);
        if segment.is_empty() {
            return Ok(segment);
        }
        self.rewrite(&segment).await
    }
}
