//! Text sub-protocol carried in GIVE payloads: `tag|arg0;arg1;...;`.
//!
//! Tags pass through a [`CodeTable`] so long human-readable names travel as
//! short wire codes. Unregistered tags are sent as-is.

use std::collections::HashMap;
use std::fmt;

pub const TAG_DELIMITER: char = '|';
pub const ARG_DELIMITER: char = ';';

#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Text(String),
    Int(i64),
    Float(f32),
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Text(text) => f.write_str(text),
            Argument::Int(value) => write!(f, "{}", value),
            // Display on f32 is locale independent and prints the shortest
            // text that parses back to the same value.
            Argument::Float(value) => write!(f, "{}", value),
        }
    }
}

impl Argument {
    /// Text holding either delimiter would be split apart by the decoder.
    pub fn is_encodable(&self) -> bool {
        match self {
            Argument::Text(text) => !text.contains([TAG_DELIMITER, ARG_DELIMITER]),
            Argument::Int(_) | Argument::Float(_) => true,
        }
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Text(value.to_string())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Text(value)
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Argument::Int(value)
    }
}

impl From<i32> for Argument {
    fn from(value: i32) -> Self {
        Argument::Int(i64::from(value))
    }
}

impl From<u32> for Argument {
    fn from(value: u32) -> Self {
        Argument::Int(i64::from(value))
    }
}

impl From<f32> for Argument {
    fn from(value: f32) -> Self {
        Argument::Float(value)
    }
}

/// Bidirectional tag <-> wire code mapping.
#[derive(Debug, Clone, Default)]
pub struct CodeTable {
    codes: HashMap<String, String>,
    tags: HashMap<String, String>,
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tag` to travel as `code`. A later registration for the same
    /// tag or code replaces the earlier one.
    pub fn register(&mut self, tag: impl Into<String>, code: impl Into<String>) {
        let tag = tag.into();
        let code = code.into();
        if let Some(old_code) = self.codes.remove(&tag) {
            self.tags.remove(&old_code);
        }
        if let Some(old_tag) = self.tags.remove(&code) {
            self.codes.remove(&old_tag);
        }
        self.codes.insert(tag.clone(), code.clone());
        self.tags.insert(code, tag);
    }

    pub fn code_for<'a>(&'a self, tag: &'a str) -> &'a str {
        self.codes.get(tag).map_or(tag, String::as_str)
    }

    pub fn tag_for<'a>(&'a self, code: &'a str) -> &'a str {
        self.tags.get(code).map_or(code, String::as_str)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: String,
    pub args: Vec<String>,
}

impl Message {
    pub fn new(tag: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tag: tag.into(),
            args,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn arg_parsed<T: std::str::FromStr>(&self, index: usize) -> Option<T> {
        self.arg(index).and_then(|a| a.parse().ok())
    }
}

pub fn encode(table: &CodeTable, tag: &str, args: &[Argument]) -> Vec<u8> {
    let mut text = String::from(table.code_for(tag));
    text.push(TAG_DELIMITER);
    for arg in args {
        text.push_str(&arg.to_string());
        text.push(ARG_DELIMITER);
    }
    text.into_bytes()
}

/// Decodes a payload. A payload without a tag delimiter is all tag. Text
/// after the last argument delimiter is dropped, since the encoder always
/// terminates every argument.
pub fn decode(table: &CodeTable, data: &[u8]) -> Message {
    let text = String::from_utf8_lossy(data);

    let Some((code, rest)) = text.split_once(TAG_DELIMITER) else {
        return Message::new(table.tag_for(&text), Vec::new());
    };

    let terminated = match rest.rfind(ARG_DELIMITER) {
        Some(end) => &rest[..end],
        None => "",
    };
    let args = if rest.contains(ARG_DELIMITER) {
        terminated.split(ARG_DELIMITER).map(str::to_string).collect()
    } else {
        Vec::new()
    };

    Message::new(table.tag_for(code), args)
}
