//! Inline-tag parser (C2).
//!
//! Streaming parser that extracts well-formed `<name attr="v">body</name>` spans out of a chunked
//! text stream, the way a model's own "thought" channel is embedded inline in its answer. No
//! buffers across chunk boundaries and resolves a span as soon as its closing delimiter appears,
//! otherwise holding the unresolved tail for the next chunk.

use std::collections::HashMap;

/// An attribute value: either a single token or a list when the same key repeats on one tag head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Single(String),
    List(Vec<String>),
}

impl AttrValue {
    /// The first value regardless of arity, for callers that only care about one occurrence
    /// (e.g. `thoughtType`/`verbosity` lookups).
    pub fn first(&self) -> &str {
        match self {
            AttrValue::Single(v) => v,
            AttrValue::List(list) => list.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }
}

/// A fully parsed inline tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub attributes: HashMap<String, AttrValue>,
    pub body: Option<String>,
}

impl Tag {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.first())
    }
}

/// One output of the parser: either a clean text fragment or an extracted tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    Text(String),
    Tag(Tag),
}

/// Buffered, single-threaded, resettable between streams.
#[derive(Debug, Default)]
pub struct TagParser {
    buffer: String,
    last_emission_was_tag: bool,
}

impl TagParser {
    pub fn new() -> Self {
        TagParser::default()
    }

    /// Reset to a fresh state, ready to parse a new stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_emission_was_tag = false;
    }

    /// Append a chunk and return every `ParserEvent` that can be resolved without more input.
    /// Anything still ambiguous (an open `<` with no `>` yet, or an opening tag with no closing
    /// tag yet) stays buffered for the next call.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<ParserEvent> {
        self.buffer.push_str(chunk);
        self.process()
    }

    /// Flush whatever remains in the buffer as trailing text. Call once after the upstream
    /// chunk sequence completes.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let text = std::mem::take(&mut self.buffer);
            self.push_text(&mut events, text, false);
        }
        events
    }

    fn process(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        loop {
            let Some(lt) = self.buffer.find('<') else {
                if !self.buffer.is_empty() {
                    let text = std::mem::take(&mut self.buffer);
                    self.push_text(&mut events, text, false);
                }
                break;
            };

            let before = self.buffer[..lt].to_string();
            let Some(gt_rel) = self.buffer[lt..].find('>') else {
                if !before.is_empty() {
                    self.push_text(&mut events, before, false);
                }
                self.buffer.drain(..lt);
                break;
            };
            let gt = lt + gt_rel;
            let head = self.buffer[lt + 1..gt].to_string();

            if head.strip_prefix('/').is_some() {
                // Closing tag with no matching open: drop it silently and keep accumulating text
                // around it (§4.1) rather than treating it as a flush boundary.
                self.buffer.drain(lt..=gt);
                continue;
            }

            if let Some(head_trimmed) = head.strip_suffix('/') {
                let (name, attributes) = parse_tag_head(head_trimmed);
                if !before.is_empty() {
                    self.push_text(&mut events, before, true);
                }
                events.push(ParserEvent::Tag(Tag {
                    name,
                    attributes,
                    body: None,
                }));
                self.last_emission_was_tag = true;
                self.buffer.drain(..=gt);
                continue;
            }

            let (name, attributes) = parse_tag_head(&head);
            let close_tag = format!("</{name}>");
            if let Some(close_pos_rel) = self.buffer[gt + 1..].find(close_tag.as_str()) {
                let close_pos = gt + 1 + close_pos_rel;
                let body = self.buffer[gt + 1..close_pos].to_string();
                if !before.is_empty() {
                    self.push_text(&mut events, before, true);
                }
                events.push(ParserEvent::Tag(Tag {
                    name,
                    attributes,
                    body: Some(body),
                }));
                self.last_emission_was_tag = true;
                let end = close_pos + close_tag.len();
                self.buffer.drain(..end);
                continue;
            }

            // Closing tag not present yet: unconsume the opening and wait for more data.
            if !before.is_empty() {
                self.push_text(&mut events, before, false);
            }
            self.buffer.drain(..lt);
            break;
        }
        events
    }

    fn push_text(&mut self, events: &mut Vec<ParserEvent>, text: String, followed_by_tag: bool) {
        let mut text = text.as_str();
        if self.last_emission_was_tag {
            text = text.trim_start();
        }
        if followed_by_tag {
            text = text.trim_end();
        }
        if !text.is_empty() {
            events.push(ParserEvent::Text(text.to_string()));
            self.last_emission_was_tag = false;
        }
    }
}

fn parse_tag_head(head: &str) -> (String, HashMap<String, AttrValue>) {
    let head = head.trim();
    let name_end = head.find(char::is_whitespace).unwrap_or(head.len());
    let name = head[..name_end].to_string();
    let rest = head[name_end..].trim_start();

    let mut attributes: HashMap<String, AttrValue> = HashMap::new();
    let chars: Vec<char> = rest.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();
        if key.is_empty() {
            i += 1;
            continue;
        }
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let value = if i < chars.len() && chars[i] == '=' {
            i += 1;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
                let quote = chars[i];
                i += 1;
                let val_start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                let val: String = chars[val_start..i].iter().collect();
                if i < chars.len() {
                    i += 1;
                }
                val
            } else {
                let val_start = i;
                while i < chars.len() && !chars[i].is_whitespace() {
                    i += 1;
                }
                chars[val_start..i].iter().collect()
            }
        } else {
            String::new()
        };
        insert_attr(&mut attributes, key, value);
    }
    (name, attributes)
}

fn insert_attr(attributes: &mut HashMap<String, AttrValue>, key: String, value: String) {
    match attributes.remove(&key) {
        None => {
            attributes.insert(key, AttrValue::Single(value));
        }
        Some(AttrValue::Single(existing)) => {
            attributes.insert(key, AttrValue::List(vec![existing, value]));
        }
        Some(AttrValue::List(mut list)) => {
            list.push(value);
            attributes.insert(key, AttrValue::List(list));
        }
    }
}
