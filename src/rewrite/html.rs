//! Incremental markup rewriter
//!
//! The tokenizer only understands as much HTML as link rewriting needs: text,
//! comments and declarations, open tags with their attributes, close tags, and
//! the raw-text content of `<script>` and `<style>`. Anything it does not touch
//! is copied to the output byte for byte. A construct that is cut by a chunk
//! boundary stays in the pending buffer until the next call completes it.

use crate::rewrite::{ContentRewriter, MarkupHook, TagAttribute, TagEvent};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Elements that never have a close tag
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "menuitem",
    "meta", "param", "source", "track", "wbr",
];

/// Pending text beyond this size is flushed even without a following tag
const TEXT_FLUSH_LIMIT: usize = 64 * 1024;

pub fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawTextElement {
    Script,
    Style,
}

impl RawTextElement {
    fn for_tag(name: &str) -> Option<Self> {
        match name {
            "script" => Some(Self::Script),
            "style" => Some(Self::Style),
            _ => None,
        }
    }

    fn close_marker(self) -> &'static [u8] {
        match self {
            Self::Script => b"</script",
            Self::Style => b"</style",
        }
    }
}

#[derive(Debug)]
struct RawAttribute {
    /// Start of the whitespace (and any stray bytes) before the name
    lead_start: usize,
    name_end: usize,
    name: String,
    value: Option<String>,
    quote: Option<u8>,
    end: usize,
}

#[derive(Debug)]
struct OpenTag<'a> {
    raw: &'a [u8],
    name: String,
    name_end: usize,
    attributes: Vec<RawAttribute>,
    /// Start of the closing `>` or `/>`, including preceding whitespace
    tail_start: usize,
    self_closing: bool,
}

#[derive(Debug)]
enum Token<'a> {
    Text(&'a [u8]),
    Raw(&'a [u8]),
    Open(OpenTag<'a>),
    Close { raw: &'a [u8], name: String },
}

impl Token<'_> {
    fn len(&self) -> usize {
        match self {
            Token::Text(raw) | Token::Raw(raw) => raw.len(),
            Token::Open(tag) => tag.raw.len(),
            Token::Close { raw, .. } => raw.len(),
        }
    }
}

fn find_byte(input: &[u8], from: usize, byte: u8) -> Option<usize> {
    input[from..].iter().position(|&b| b == byte).map(|i| i + from)
}

fn find_bytes(input: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    input[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn find_ignore_case(input: &[u8], needle: &[u8]) -> Option<usize> {
    input
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

fn is_name_end(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'/' || b == b'>'
}

/// Reads the next complete token, or `None` if more input is needed
fn next_token(input: &[u8]) -> Option<Token<'_>> {
    if input[0] != b'<' {
        let end = find_byte(input, 0, b'<')?;
        return Some(Token::Text(&input[..end]));
    }
    if input.len() < 2 {
        return None;
    }

    match input[1] {
        b'!' => {
            if input.len() < 4 && b"<!--".starts_with(input) {
                return None;
            }
            let end = if input.starts_with(b"<!--") {
                find_bytes(input, 4, b"-->")? + 3
            } else {
                find_byte(input, 2, b'>')? + 1
            };
            Some(Token::Raw(&input[..end]))
        }
        b'?' => {
            let end = find_byte(input, 2, b'>')? + 1;
            Some(Token::Raw(&input[..end]))
        }
        b'/' => {
            let end = find_byte(input, 2, b'>')? + 1;
            let raw = &input[..end];
            if !raw.get(2).is_some_and(|b| b.is_ascii_alphabetic()) {
                return Some(Token::Raw(raw));
            }
            let name_len = raw[2..].iter().position(|&b| is_name_end(b)).unwrap_or(0);
            let name = String::from_utf8_lossy(&raw[2..2 + name_len]).to_ascii_lowercase();
            Some(Token::Close { raw, name })
        }
        b if b.is_ascii_alphabetic() => parse_open_tag(input).map(Token::Open),
        _ => Some(Token::Text(&input[..1])),
    }
}

fn parse_open_tag(input: &[u8]) -> Option<OpenTag<'_>> {
    let len = input.len();
    let mut i = 1;
    while i < len && !is_name_end(input[i]) {
        i += 1;
    }
    if i >= len {
        return None;
    }
    let name_end = i;
    let name = String::from_utf8_lossy(&input[1..name_end]).to_ascii_lowercase();

    let mut attributes = Vec::new();
    let mut lead = i;
    let (tail_start, end, self_closing) = loop {
        while i < len && input[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            return None;
        }
        match input[i] {
            b'>' => break (lead, i + 1, false),
            b'/' => {
                if i + 1 >= len {
                    return None;
                }
                if input[i + 1] == b'>' {
                    break (lead, i + 2, true);
                }
                i += 1;
                continue;
            }
            b'=' => {
                i += 1;
                continue;
            }
            _ => {}
        }

        let name_start = i;
        while i < len && !is_name_end(input[i]) && input[i] != b'=' {
            i += 1;
        }
        if i >= len {
            return None;
        }
        let attr_name_end = i;

        let mut j = i;
        while j < len && input[j].is_ascii_whitespace() {
            j += 1;
        }
        if j >= len {
            return None;
        }

        let (value, quote) = if input[j] == b'=' {
            j += 1;
            while j < len && input[j].is_ascii_whitespace() {
                j += 1;
            }
            if j >= len {
                return None;
            }
            match input[j] {
                q @ (b'"' | b'\'') => {
                    let close = find_byte(input, j + 1, q)?;
                    let value = decode_entities(&String::from_utf8_lossy(&input[j + 1..close]));
                    i = close + 1;
                    (Some(value), Some(q))
                }
                _ => {
                    let start = j;
                    while j < len && !input[j].is_ascii_whitespace() && input[j] != b'>' {
                        j += 1;
                    }
                    if j >= len {
                        return None;
                    }
                    i = j;
                    let value = decode_entities(&String::from_utf8_lossy(&input[start..j]));
                    (Some(value), None)
                }
            }
        } else {
            (None, None)
        };

        attributes.push(RawAttribute {
            lead_start: lead,
            name_end: attr_name_end,
            name: String::from_utf8_lossy(&input[name_start..attr_name_end]).to_ascii_lowercase(),
            value,
            quote,
            end: i,
        });
        lead = i;
    };

    Some(OpenTag {
        raw: &input[..end],
        name,
        name_end,
        attributes,
        tail_start,
        self_closing,
    })
}

/// Decodes named and numeric character references in an attribute value
fn decode_entities(value: &str) -> String {
    html_escape::decode_html_entities(value).into_owned()
}

fn write_value(out: &mut Vec<u8>, value: Option<&str>, quote: Option<u8>) {
    let Some(value) = value else {
        return;
    };
    let quote = quote.unwrap_or(b'"');
    out.push(b'=');
    out.push(quote);
    for ch in value.chars() {
        match ch {
            '&' => out.extend_from_slice(b"&amp;"),
            '"' if quote == b'"' => out.extend_from_slice(b"&quot;"),
            '\'' if quote == b'\'' => out.extend_from_slice(b"&#39;"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(quote);
}

/// Re-emits a tag, touching only the attributes the hooks changed
fn serialize_tag(tag: &OpenTag<'_>, event: &TagEvent, out: &mut Vec<u8>) {
    let unchanged = tag.attributes.len() == event.attributes().len()
        && tag
            .attributes
            .iter()
            .zip(event.attributes())
            .all(|(raw, attr)| raw.name == attr.name && raw.value == attr.value);
    if unchanged {
        out.extend_from_slice(tag.raw);
        return;
    }

    out.extend_from_slice(&tag.raw[..tag.name_end]);
    let mut used = vec![false; tag.attributes.len()];
    for attr in event.attributes() {
        let original = tag
            .attributes
            .iter()
            .enumerate()
            .position(|(i, raw)| !used[i] && raw.name == attr.name);
        match original {
            Some(i) => {
                used[i] = true;
                let raw = &tag.attributes[i];
                if raw.value == attr.value {
                    out.extend_from_slice(&tag.raw[raw.lead_start..raw.end]);
                } else {
                    out.extend_from_slice(&tag.raw[raw.lead_start..raw.name_end]);
                    write_value(out, attr.value.as_deref(), raw.quote);
                }
            }
            None => {
                out.push(b' ');
                out.extend_from_slice(attr.name.as_bytes());
                write_value(out, attr.value.as_deref(), None);
            }
        }
    }
    out.extend_from_slice(&tag.raw[tag.tail_start..]);
}

/// Rewrites links inside HTML through [`MarkupHook`]s
///
/// Hooks run one tag at a time in document order, so a `<base>` seen early
/// affects every later link, and each call's output is returned only after
/// all of its hooks resolved.
pub struct MarkupRewriter {
    hooks: Vec<Arc<dyn MarkupHook>>,
    pending: Vec<u8>,
    raw_text: Option<RawTextElement>,
    /// Close tags to drop because their open tag was deleted
    suppressed: HashMap<String, usize>,
}

impl MarkupRewriter {
    pub fn new(hooks: Vec<Arc<dyn MarkupHook>>) -> Self {
        Self {
            hooks,
            pending: Vec::new(),
            raw_text: None,
            suppressed: HashMap::new(),
        }
    }

    async fn emit_text(&self, text: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.hooks.is_empty() {
            out.extend_from_slice(text);
            return Ok(());
        }
        match std::str::from_utf8(text) {
            Ok(text) => {
                let mut text = text.to_string();
                for hook in &self.hooks {
                    text = hook.on_text(text).await?;
                }
                out.extend_from_slice(text.as_bytes());
            }
            Err(_) => out.extend_from_slice(text),
        }
        Ok(())
    }

    async fn emit_raw_text(
        &self,
        element: RawTextElement,
        content: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if element != RawTextElement::Style || self.hooks.is_empty() {
            out.extend_from_slice(content);
            return Ok(());
        }
        match std::str::from_utf8(content) {
            Ok(css) => {
                let mut css = css.to_string();
                for hook in &self.hooks {
                    css = hook.on_style(css).await?;
                }
                out.extend_from_slice(css.as_bytes());
            }
            Err(_) => out.extend_from_slice(content),
        }
        Ok(())
    }

    async fn emit_open_tag(&mut self, tag: OpenTag<'_>, out: &mut Vec<u8>) -> Result<()> {
        let attributes = tag
            .attributes
            .iter()
            .map(|raw| TagAttribute {
                name: raw.name.clone(),
                value: raw.value.clone(),
            })
            .collect();
        let mut event = TagEvent::from_parts(tag.name.clone(), attributes);
        for hook in &self.hooks {
            hook.on_tag(&mut event).await?;
        }

        if !tag.self_closing {
            self.raw_text = RawTextElement::for_tag(&tag.name);
        }

        if event.is_deleted() {
            tracing::trace!("Dropping <{}> tag", tag.name);
            if !tag.self_closing && !is_void_element(&tag.name) {
                *self.suppressed.entry(tag.name).or_default() += 1;
            }
        } else {
            serialize_tag(&tag, &event, out);
        }
        Ok(())
    }

    async fn process(&mut self, finishing: bool) -> Result<Vec<u8>> {
        let buf = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(buf.len());
        let mut pos = 0;

        while pos < buf.len() {
            if let Some(element) = self.raw_text {
                let rest = &buf[pos..];
                match find_ignore_case(rest, element.close_marker()) {
                    Some(end) => {
                        self.emit_raw_text(element, &rest[..end], &mut out).await?;
                        self.raw_text = None;
                        pos += end;
                    }
                    None if finishing => {
                        self.emit_raw_text(element, rest, &mut out).await?;
                        self.raw_text = None;
                        pos = buf.len();
                    }
                    None => {
                        // Script content can be streamed as long as a possible
                        // partial close marker stays pending.
                        if element == RawTextElement::Script {
                            let keep = element.close_marker().len() - 1;
                            let safe = rest.len().saturating_sub(keep);
                            out.extend_from_slice(&rest[..safe]);
                            pos += safe;
                        }
                        break;
                    }
                }
                continue;
            }

            let rest = &buf[pos..];
            let token = match next_token(rest) {
                Some(token) => token,
                None if finishing => Token::Raw(rest),
                None if rest[0] != b'<' && rest.len() > TEXT_FLUSH_LIMIT => Token::Text(rest),
                None => break,
            };
            let consumed = token.len();

            match token {
                Token::Text(text) => self.emit_text(text, &mut out).await?,
                Token::Raw(raw) => out.extend_from_slice(raw),
                Token::Close { raw, name } => match self.suppressed.get_mut(&name) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => out.extend_from_slice(raw),
                },
                Token::Open(tag) => self.emit_open_tag(tag, &mut out).await?,
            }
            pos += consumed;
        }

        self.pending = buf[pos..].to_vec();
        Ok(out)
    }
}

#[async_trait]
impl ContentRewriter for MarkupRewriter {
    async fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        self.process(false).await
    }

    async fn finish(&mut self) -> Result<Vec<u8>> {
        self.process(true).await
    }
}
