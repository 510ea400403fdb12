//! HTML page structure extraction and selector verification.
//!
//! Parses an uploaded page into an [`HtmlStructure`]: the page title, every
//! element a browser-automation script could address (form controls, buttons,
//! links, and anything carrying an `id`, `name`, or `class`), and the visible
//! text. Script generation uses the structure twice: to tell the model which
//! selectors exist, and to verify every locator in the model's script before
//! the script is accepted.
//!
//! Parsing is lenient: HTML is read with `quick-xml` in a relaxed mode
//! (unchecked end names, HTML attribute syntax), with `<script>`, `<style>`
//! and comments removed beforehand.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{QaError, Result};

/// Elements recorded even when they carry no addressable attribute.
const INTERACTIVE_TAGS: &[&str] = &[
    "form", "input", "textarea", "select", "option", "button", "a", "label",
];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Longest element text kept per element.
const MAX_ELEMENT_TEXT: usize = 200;

static RAW_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
        .expect("valid raw-block regex")
});

static XPATH_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@(id|name|class)\s*=\s*["']([^"']+)["']"#).expect("valid xpath regex")
});

/// One addressable element of the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlElement {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    /// Visible text inside the element (trimmed, truncated).
    pub text: String,
    /// `id` of the enclosing form, if any.
    pub form_id: Option<String>,
}

impl HtmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn name(&self) -> Option<&str> {
        self.attr("name")
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class")
            .unwrap_or_default()
            .split_whitespace()
    }

    /// The most specific CSS selector for this element: id, then name,
    /// then first class, then the bare tag.
    pub fn preferred_selector(&self) -> String {
        if let Some(id) = self.id() {
            format!("#{}", id)
        } else if let Some(name) = self.name() {
            format!("{}[name='{}']", self.tag, name)
        } else if let Some(class) = self.classes().next() {
            format!("{}.{}", self.tag, class)
        } else {
            self.tag.clone()
        }
    }

    fn describe(&self) -> String {
        let mut line = format!("  - {}", self.tag.to_uppercase());
        for key in ["id", "name", "type", "class", "placeholder", "value"] {
            if let Some(v) = self.attr(key) {
                line.push_str(&format!(" {}='{}'", key, v));
            }
        }
        if !self.text.is_empty() {
            line.push_str(&format!(" text='{}'", self.text));
        }
        line.push_str(&format!("  => {}", self.preferred_selector()));
        line
    }
}

/// Parsed structure of an HTML page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlStructure {
    pub title: Option<String>,
    pub elements: Vec<HtmlElement>,
    /// Visible page text, whitespace-normalised.
    pub text: String,
    /// SHA-256 over the element list; identifies the snapshot a script
    /// was generated against.
    pub fingerprint: String,
}

impl HtmlStructure {
    /// Plain-text rendering used when an HTML file is ingested as a
    /// document: title, form summaries, then page content.
    pub fn document_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(title) = &self.title {
            parts.push(format!("Page Title: {}", title));
        }
        for form in self.elements.iter().filter(|e| e.tag == "form") {
            let form_id = form.id().unwrap_or("unnamed");
            let mut lines = vec!["--- Form ---".to_string(), format!("Form ID: {}", form_id)];
            for el in self
                .elements
                .iter()
                .filter(|e| e.form_id.as_deref() == form.id() && form.id().is_some())
            {
                match el.tag.as_str() {
                    "input" | "textarea" | "select" => {
                        let mut info = format!("Input: {}", el.tag);
                        if let Some(t) = el.attr("type").filter(|t| *t != "text") {
                            info.push_str(&format!(" (type: {})", t));
                        }
                        for key in ["id", "name", "placeholder"] {
                            if let Some(v) = el.attr(key) {
                                info.push_str(&format!(" {}='{}'", key, v));
                            }
                        }
                        lines.push(info);
                    }
                    "button" => {
                        lines.push(format!(
                            "Button: {} (id: {})",
                            el.text,
                            el.id().unwrap_or_default()
                        ));
                    }
                    _ => {}
                }
            }
            parts.push(lines.join("\n"));
        }
        if !self.text.is_empty() {
            parts.push(format!("--- Page Content ---\n{}", self.text));
        }
        parts.join("\n\n")
    }

    /// Element listing for script-generation prompts, grouped by form.
    pub fn describe_elements(&self) -> String {
        if self.elements.is_empty() {
            return "No addressable elements found".to_string();
        }
        let mut groups: BTreeMap<Option<&str>, Vec<String>> = BTreeMap::new();
        for el in &self.elements {
            if el.tag == "form" {
                groups.entry(el.id()).or_default();
                continue;
            }
            groups
                .entry(el.form_id.as_deref())
                .or_default()
                .push(el.describe());
        }
        let mut out = Vec::new();
        for (form, lines) in groups {
            match form {
                Some(id) => out.push(format!("FORM id='{}'", id)),
                None => out.push("PAGE (outside forms)".to_string()),
            }
            out.extend(lines);
        }
        out.join("\n")
    }

    /// True when every comma-separated alternative of a CSS selector
    /// matches at least one element. Each compound selector is matched on
    /// its own; hierarchy between compounds is not checked.
    pub fn contains_selector(&self, selector: &str) -> bool {
        let groups: Vec<&str> = selector
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if groups.is_empty() {
            return false;
        }
        groups.iter().all(|group| {
            let compounds = split_compounds(group);
            !compounds.is_empty()
                && compounds.iter().all(|c| match Compound::parse(c) {
                    Some(compound) => self.elements.iter().any(|e| compound.matches(e)),
                    None => false,
                })
        })
    }

    /// Verify a Selenium locator (`By.<kind>`, value) against the snapshot.
    pub fn verify_locator(&self, kind: &str, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        match kind.to_ascii_uppercase().as_str() {
            "ID" => self.elements.iter().any(|e| e.id() == Some(value)),
            "NAME" => self.elements.iter().any(|e| e.name() == Some(value)),
            "CLASS_NAME" => self
                .elements
                .iter()
                .any(|e| e.classes().any(|c| c == value)),
            "TAG_NAME" => self
                .elements
                .iter()
                .any(|e| e.tag.eq_ignore_ascii_case(value)),
            "CSS_SELECTOR" => self.contains_selector(value),
            "LINK_TEXT" => self
                .elements
                .iter()
                .any(|e| e.tag == "a" && e.text == value),
            "PARTIAL_LINK_TEXT" => self
                .elements
                .iter()
                .any(|e| e.tag == "a" && e.text.contains(value)),
            "XPATH" => {
                let pairs: Vec<(String, String)> = XPATH_ATTR
                    .captures_iter(value)
                    .map(|c| (c[1].to_string(), c[2].to_string()))
                    .collect();
                !pairs.is_empty()
                    && pairs.iter().all(|(attr, v)| match attr.as_str() {
                        "class" => self.verify_locator("CLASS_NAME", v),
                        other => self.verify_locator(&other.to_ascii_uppercase(), v),
                    })
            }
            _ => false,
        }
    }
}

/// Parse an HTML page into its [`HtmlStructure`].
pub fn parse_html(filename: &str, source: &str) -> Result<HtmlStructure> {
    let cleaned = RAW_BLOCKS.replace_all(source, " ");
    let mut reader = Reader::from_str(&cleaned);
    {
        let config = reader.config_mut();
        config.trim_text(true);
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
    }

    let mut elements: Vec<HtmlElement> = Vec::new();
    // Open elements: (tag, index into `elements` when recorded).
    let mut stack: Vec<(String, Option<usize>)> = Vec::new();
    let mut title: Option<String> = None;
    let mut text_parts: Vec<String> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| QaError::parse(filename, format!("HTML: {}", e)))?;
        match event {
            Event::Start(e) => open_element(&e, false, &mut elements, &mut stack),
            Event::Empty(e) => open_element(&e, true, &mut elements, &mut stack),
            Event::End(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                if let Some(pos) = stack.iter().rposition(|(t, _)| *t == tag) {
                    stack.truncate(pos);
                }
            }
            Event::Text(t) => {
                let raw = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                let text = normalize_whitespace(&raw);
                if text.is_empty() {
                    continue;
                }
                if stack.last().is_some_and(|(t, _)| t == "title") {
                    title = Some(text.clone());
                    continue;
                }
                for (_, idx) in &stack {
                    if let Some(i) = idx {
                        append_text(&mut elements[*i].text, &text);
                    }
                }
                text_parts.push(text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let fingerprint = {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&elements)?);
        format!("{:x}", hasher.finalize())
    };

    Ok(HtmlStructure {
        title,
        elements,
        text: text_parts.join(" "),
        fingerprint,
    })
}

/// Record an opening tag. Self-closing and void elements are never pushed
/// onto the open-element stack.
fn open_element(
    e: &BytesStart<'_>,
    self_closing: bool,
    elements: &mut Vec<HtmlElement>,
    stack: &mut Vec<(String, Option<usize>)>,
) {
    let tag = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
    let attributes = read_attributes(e);
    let form_id = stack
        .iter()
        .rev()
        .find(|(t, _)| t == "form")
        .and_then(|(_, idx)| *idx)
        .and_then(|i| elements[i].id().map(str::to_string));

    let recorded = INTERACTIVE_TAGS.contains(&tag.as_str())
        || ["id", "name", "class"]
            .iter()
            .any(|k| attributes.get(*k).is_some_and(|v| !v.is_empty()));
    let index = if recorded {
        elements.push(HtmlElement {
            tag: tag.clone(),
            attributes,
            text: String::new(),
            form_id,
        });
        Some(elements.len() - 1)
    } else {
        None
    };

    if !self_closing && !VOID_TAGS.contains(&tag.as_str()) {
        stack.push((tag, index));
    }
}

fn read_attributes(e: &BytesStart<'_>) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    for attr in e.html_attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        attributes.insert(key, value.trim().to_string());
    }
    attributes
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn append_text(buf: &mut String, text: &str) {
    if buf.chars().count() >= MAX_ELEMENT_TEXT {
        return;
    }
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(text);
    if buf.chars().count() > MAX_ELEMENT_TEXT {
        *buf = buf.chars().take(MAX_ELEMENT_TEXT).collect();
    }
}

// ============ CSS selector subset ============

/// Split a selector into compound selectors on descendant/child/sibling
/// combinators, ignoring combinator characters inside brackets or quotes.
fn split_compounds(selector: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in selector.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), _) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[') | (None, '(') => {
                depth += 1;
                current.push(c);
            }
            (None, ']') | (None, ')') => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            (None, c) if depth == 0 && (c.is_whitespace() || matches!(c, '>' | '+' | '~')) => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[derive(Debug, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatch>,
}

#[derive(Debug)]
struct AttrMatch {
    name: String,
    op: Option<String>,
    value: String,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

impl Compound {
    fn parse(s: &str) -> Option<Self> {
        let chars: Vec<char> = s.chars().collect();
        let mut i = 0;
        let mut compound = Compound::default();

        let read_ident = |i: &mut usize| -> String {
            let start = *i;
            while *i < chars.len() && is_ident_char(chars[*i]) {
                *i += 1;
            }
            chars[start..*i].iter().collect()
        };

        if i < chars.len() && chars[i] == '*' {
            i += 1;
        } else {
            let tag = read_ident(&mut i);
            if !tag.is_empty() {
                compound.tag = Some(tag.to_ascii_lowercase());
            }
        }

        while i < chars.len() {
            match chars[i] {
                '#' => {
                    i += 1;
                    let id = read_ident(&mut i);
                    if id.is_empty() {
                        return None;
                    }
                    compound.id = Some(id);
                }
                '.' => {
                    i += 1;
                    let class = read_ident(&mut i);
                    if class.is_empty() {
                        return None;
                    }
                    compound.classes.push(class);
                }
                '[' => {
                    let close = find_closing_bracket(&chars, i)?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    compound.attrs.push(AttrMatch::parse(&inner)?);
                    i = close + 1;
                }
                ':' => {
                    // Pseudo-classes and pseudo-elements narrow the match but
                    // never change which elements exist.
                    while i < chars.len() && chars[i] == ':' {
                        i += 1;
                    }
                    read_ident(&mut i);
                    if i < chars.len() && chars[i] == '(' {
                        let mut depth = 0;
                        while i < chars.len() {
                            match chars[i] {
                                '(' => depth += 1,
                                ')' => {
                                    depth -= 1;
                                    if depth == 0 {
                                        i += 1;
                                        break;
                                    }
                                }
                                _ => {}
                            }
                            i += 1;
                        }
                    }
                }
                _ => return None,
            }
        }

        if compound.tag.is_none()
            && compound.id.is_none()
            && compound.classes.is_empty()
            && compound.attrs.is_empty()
            && s != "*"
        {
            return None;
        }
        Some(compound)
    }

    fn matches(&self, el: &HtmlElement) -> bool {
        if let Some(tag) = &self.tag {
            if &el.tag != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if el.id() != Some(id.as_str()) {
                return false;
            }
        }
        if !self
            .classes
            .iter()
            .all(|c| el.classes().any(|ec| ec == c))
        {
            return false;
        }
        self.attrs.iter().all(|a| a.matches(el))
    }
}

fn find_closing_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[open + 1..].iter().enumerate() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ']' => return Some(open + 1 + offset),
            None => {}
        }
    }
    None
}

impl AttrMatch {
    fn parse(inner: &str) -> Option<Self> {
        let inner = inner.trim();
        let ops = ["*=", "^=", "$=", "~=", "|=", "="];
        for op in ops {
            if let Some(pos) = inner.find(op) {
                let name = inner[..pos].trim().to_ascii_lowercase();
                let raw = inner[pos + op.len()..].trim();
                let raw = raw
                    .strip_suffix(" i")
                    .or_else(|| raw.strip_suffix(" s"))
                    .unwrap_or(raw)
                    .trim();
                let value = raw.trim_matches(|c| c == '"' || c == '\'').to_string();
                if name.is_empty() {
                    return None;
                }
                return Some(AttrMatch {
                    name,
                    op: Some(op.to_string()),
                    value,
                });
            }
        }
        if inner.is_empty() || !inner.chars().all(is_ident_char) {
            return None;
        }
        Some(AttrMatch {
            name: inner.to_ascii_lowercase(),
            op: None,
            value: String::new(),
        })
    }

    fn matches(&self, el: &HtmlElement) -> bool {
        let actual = match el.attributes.get(&self.name) {
            Some(v) => v.as_str(),
            None => return false,
        };
        match self.op.as_deref() {
            None => true,
            Some("=") => actual == self.value,
            Some("*=") => actual.contains(&self.value),
            Some("^=") => actual.starts_with(&self.value),
            Some("$=") => actual.ends_with(&self.value),
            Some("~=") => actual.split_whitespace().any(|w| w == self.value),
            Some("|=") => actual == self.value || actual.starts_with(&format!("{}-", self.value)),
            Some(_) => false,
        }
    }
}
