//! Incremental JSON decoding.
//!
//! Feeds arrive as arbitrary byte chunks. [`SelectorDecoder`] scans them one
//! byte at a time, keeps only the raw bytes of values whose path matches the
//! selector, and hands each completed value to `serde_json`.

use std::str::FromStr;

use serde_json::Value;

use crate::error::DecodeError;

/// Byte-chunk to value decoder.
pub trait Decoder: Send {
    /// Values completed by this chunk, in order.
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Value>, DecodeError>;

    /// Flush at end of input. Incomplete trailing input is dropped.
    fn finish(&mut self) -> Result<Vec<Value>, DecodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Any,
    Key(String),
}

impl Segment {
    fn matches(&self, frame: &Frame) -> bool {
        match (self, frame) {
            (Segment::Any, _) => true,
            (Segment::Key(name), Frame::Object { key }) => key.as_deref() == Some(name.as_str()),
            (Segment::Key(name), Frame::Array { index }) => name.parse::<usize>() == Ok(*index),
        }
    }
}

/// Path filter, e.g. `results.*` or `rows.*.doc`.
///
/// `*` matches any key or index. An empty selector (or `$`) selects every
/// root value, which is what newline-delimited feeds need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    segments: Vec<Segment>,
}

impl Selector {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "$" {
            return Ok(Self::root());
        }
        let path = trimmed.strip_prefix("$.").unwrap_or(trimmed);
        let segments = path
            .split('.')
            .map(|segment| match segment {
                "" => Err(DecodeError::InvalidSelector(raw.to_string())),
                "*" => Ok(Segment::Any),
                key => Ok(Segment::Key(key.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    fn matches(&self, stack: &[Frame]) -> bool {
        self.segments.len() == stack.len()
            && self
                .segments
                .iter()
                .zip(stack)
                .all(|(segment, frame)| segment.matches(frame))
    }
}

impl FromStr for Selector {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug)]
enum Frame {
    Object { key: Option<String> },
    Array { index: usize },
}

/// What the structure allows next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    FirstValueOrClose,
    Key,
    FirstKeyOrClose,
    Colon,
    CommaOrClose,
}

impl Expect {
    fn name(self) -> &'static str {
        match self {
            Expect::Value | Expect::FirstValueOrClose => "VALUE",
            Expect::Key | Expect::FirstKeyOrClose => "KEY",
            Expect::Colon => "COLON",
            Expect::CommaOrClose => "COMMA",
        }
    }

    fn accepts_value(self) -> bool {
        matches!(self, Expect::Value | Expect::FirstValueOrClose)
    }
}

/// What a string being scanned will become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrRole {
    Key,
    Value,
    /// Not allowed here; scanned to the end so the error can quote it.
    Rejected,
}

/// Token being scanned across byte boundaries.
#[derive(Debug, Clone, Copy)]
enum Lexeme {
    None,
    Str {
        escape: bool,
        unicode: u8,
        role: StrRole,
    },
    Number,
    Literal {
        text: &'static [u8],
        matched: usize,
        state: &'static str,
    },
}

#[derive(Debug)]
struct Capture {
    depth: usize,
    bytes: Vec<u8>,
}

/// Streaming decoder emitting every value matched by a [`Selector`].
///
/// Several root values may follow each other. After the first error the
/// decoder is poisoned and repeats that error on every call.
#[derive(Debug)]
pub struct SelectorDecoder {
    selector: Selector,
    stack: Vec<Frame>,
    expect: Expect,
    lexeme: Lexeme,
    /// Text of the key or number being scanned.
    scratch: Vec<u8>,
    capture: Option<Capture>,
    offset: usize,
    poisoned: Option<DecodeError>,
}

impl SelectorDecoder {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            stack: Vec::new(),
            expect: Expect::Value,
            lexeme: Lexeme::None,
            scratch: Vec::new(),
            capture: None,
            offset: 0,
            poisoned: None,
        }
    }

    /// The error this decoder is stuck on, if any.
    pub fn error(&self) -> Option<&DecodeError> {
        self.poisoned.as_ref()
    }

    fn push(&mut self, b: u8, position: usize, out: &mut Vec<Value>) -> Result<(), DecodeError> {
        match self.lexeme {
            Lexeme::Str {
                escape,
                unicode,
                role,
            } => return self.string_byte(b, position, escape, unicode, role, out),
            Lexeme::Number => {
                if is_number_byte(b) {
                    self.scratch.push(b);
                    self.keep(b);
                    return Ok(());
                }
                self.finish_number(out)?;
            }
            Lexeme::Literal {
                text,
                matched,
                state,
            } => {
                if text.get(matched) != Some(&b) {
                    return Err(invalid_character(b, position, state));
                }
                self.keep(b);
                if matched + 1 == text.len() {
                    self.lexeme = Lexeme::None;
                    return self.value_done(out);
                }
                self.lexeme = Lexeme::Literal {
                    text,
                    matched: matched + 1,
                    state,
                };
                return Ok(());
            }
            Lexeme::None => {}
        }
        self.structural(b, position, out)
    }

    fn structural(&mut self, b: u8, position: usize, out: &mut Vec<Value>) -> Result<(), DecodeError> {
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => Ok(()),
            b'{' => {
                self.begin_value("LEFT_BRACE", Some(r#""{""#))?;
                self.keep(b);
                self.stack.push(Frame::Object { key: None });
                self.expect = Expect::FirstKeyOrClose;
                Ok(())
            }
            b'[' => {
                self.begin_value("LEFT_BRACKET", Some(r#""[""#))?;
                self.keep(b);
                self.stack.push(Frame::Array { index: 0 });
                self.expect = Expect::FirstValueOrClose;
                Ok(())
            }
            b'}' => {
                let in_object = matches!(self.stack.last(), Some(Frame::Object { .. }));
                if !in_object
                    || !matches!(self.expect, Expect::FirstKeyOrClose | Expect::CommaOrClose)
                {
                    return Err(self.unexpected("RIGHT_BRACE", Some(r#""}""#)));
                }
                self.keep(b);
                self.stack.pop();
                self.value_done(out)
            }
            b']' => {
                let in_array = matches!(self.stack.last(), Some(Frame::Array { .. }));
                if !in_array
                    || !matches!(self.expect, Expect::FirstValueOrClose | Expect::CommaOrClose)
                {
                    return Err(self.unexpected("RIGHT_BRACKET", Some(r#""]""#)));
                }
                self.keep(b);
                self.stack.pop();
                self.value_done(out)
            }
            b':' => {
                if self.expect != Expect::Colon {
                    return Err(self.unexpected("COLON", Some(r#"":""#)));
                }
                self.keep(b);
                self.expect = Expect::Value;
                Ok(())
            }
            b',' => {
                if self.expect != Expect::CommaOrClose {
                    return Err(self.unexpected("COMMA", Some(r#"",""#)));
                }
                match self.stack.last_mut() {
                    Some(Frame::Object { .. }) => self.expect = Expect::Key,
                    Some(Frame::Array { index }) => {
                        *index += 1;
                        self.expect = Expect::Value;
                    }
                    None => return Err(self.unexpected("COMMA", Some(r#"",""#))),
                }
                self.keep(b);
                Ok(())
            }
            b'"' => {
                if matches!(self.expect, Expect::Key | Expect::FirstKeyOrClose) {
                    self.keep(b);
                    self.scratch.clear();
                    self.scratch.push(b);
                    self.lexeme = Lexeme::Str {
                        escape: false,
                        unicode: 0,
                        role: StrRole::Key,
                    };
                    return Ok(());
                }
                if !self.expect.accepts_value() {
                    self.scratch.clear();
                    self.scratch.push(b);
                    self.lexeme = Lexeme::Str {
                        escape: false,
                        unicode: 0,
                        role: StrRole::Rejected,
                    };
                    return Ok(());
                }
                self.begin_value("STRING", None)?;
                self.keep(b);
                self.lexeme = Lexeme::Str {
                    escape: false,
                    unicode: 0,
                    role: StrRole::Value,
                };
                Ok(())
            }
            b'-' | b'0'..=b'9' => {
                self.begin_value("NUMBER", None)?;
                self.keep(b);
                self.scratch.clear();
                self.scratch.push(b);
                self.lexeme = Lexeme::Number;
                Ok(())
            }
            b't' => self.begin_literal(b, b"true", "TRUE"),
            b'f' => self.begin_literal(b, b"false", "FALSE"),
            b'n' => self.begin_literal(b, b"null", "NULL"),
            _ => Err(invalid_character(b, position, "START")),
        }
    }

    fn string_byte(
        &mut self,
        b: u8,
        position: usize,
        mut escape: bool,
        mut unicode: u8,
        role: StrRole,
        out: &mut Vec<Value>,
    ) -> Result<(), DecodeError> {
        if role != StrRole::Value {
            self.scratch.push(b);
        }
        self.keep(b);

        if unicode > 0 {
            if !b.is_ascii_hexdigit() {
                return Err(invalid_character(b, position, "STRING"));
            }
            unicode -= 1;
        } else if escape {
            match b {
                b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => {}
                b'u' => unicode = 4,
                _ => return Err(invalid_character(b, position, "STRING")),
            }
            escape = false;
        } else {
            match b {
                b'\\' => escape = true,
                b'"' => {
                    self.lexeme = Lexeme::None;
                    return match role {
                        StrRole::Key => self.key_done(),
                        StrRole::Value => self.value_done(out),
                        StrRole::Rejected => {
                            let text = String::from_utf8_lossy(&self.scratch).into_owned();
                            Err(self.unexpected("STRING", Some(&text)))
                        }
                    };
                }
                0x00..=0x1f => return Err(invalid_character(b, position, "STRING")),
                _ => {}
            }
        }

        self.lexeme = Lexeme::Str {
            escape,
            unicode,
            role,
        };
        Ok(())
    }

    fn begin_literal(&mut self, b: u8, text: &'static [u8], state: &'static str) -> Result<(), DecodeError> {
        self.begin_value(state, std::str::from_utf8(text).ok())?;
        self.keep(b);
        self.lexeme = Lexeme::Literal {
            text,
            matched: 1,
            state,
        };
        Ok(())
    }

    /// `value` is the JSON text of the token, quoted in the error if it is misplaced.
    fn begin_value(&mut self, token: &'static str, value: Option<&str>) -> Result<(), DecodeError> {
        if !self.expect.accepts_value() {
            return Err(self.unexpected(token, value));
        }
        if self.capture.is_none() && self.selector.matches(&self.stack) {
            self.capture = Some(Capture {
                depth: self.stack.len(),
                bytes: Vec::new(),
            });
        }
        Ok(())
    }

    fn key_done(&mut self) -> Result<(), DecodeError> {
        let key: String = serde_json::from_slice(&self.scratch)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        self.scratch.clear();
        if let Some(Frame::Object { key: current }) = self.stack.last_mut() {
            *current = Some(key);
        }
        self.expect = Expect::Colon;
        Ok(())
    }

    fn finish_number(&mut self, out: &mut Vec<Value>) -> Result<(), DecodeError> {
        if serde_json::from_slice::<serde_json::Number>(&self.scratch).is_err() {
            return Err(DecodeError::Malformed(format!(
                "invalid number {}",
                String::from_utf8_lossy(&self.scratch)
            )));
        }
        self.scratch.clear();
        self.lexeme = Lexeme::None;
        self.value_done(out)
    }

    fn value_done(&mut self, out: &mut Vec<Value>) -> Result<(), DecodeError> {
        let depth = self.stack.len();
        if self
            .capture
            .as_ref()
            .is_some_and(|capture| capture.depth == depth)
            && let Some(capture) = self.capture.take()
        {
            let value = serde_json::from_slice(&capture.bytes)
                .map_err(|err| DecodeError::Malformed(err.to_string()))?;
            out.push(value);
        }
        self.expect = if self.stack.is_empty() {
            Expect::Value
        } else {
            Expect::CommaOrClose
        };
        Ok(())
    }

    fn keep(&mut self, b: u8) {
        if let Some(capture) = self.capture.as_mut() {
            capture.bytes.push(b);
        }
    }

    fn unexpected(&self, token: &'static str, value: Option<&str>) -> DecodeError {
        DecodeError::UnexpectedToken {
            token,
            value: value.map(str::to_string),
            state: self.expect.name(),
        }
    }
}

impl Decoder for SelectorDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Value>, DecodeError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        let mut out = Vec::new();
        for (i, &b) in chunk.iter().enumerate() {
            if let Err(err) = self.push(b, self.offset + i, &mut out) {
                self.offset += chunk.len();
                self.poisoned = Some(err.clone());
                // Values completed before the error still go out; the error
                // comes back on the next call.
                return if out.is_empty() { Err(err) } else { Ok(out) };
            }
        }
        self.offset += chunk.len();
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<Value>, DecodeError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        let mut out = Vec::new();
        match self.lexeme {
            Lexeme::Number if self.stack.is_empty() => self.finish_number(&mut out)?,
            Lexeme::Str {
                role: StrRole::Rejected,
                ..
            } => {
                let err = self.unexpected("STRING", None);
                self.poisoned = Some(err.clone());
                return Err(err);
            }
            _ => {}
        }
        Ok(out)
    }
}

fn is_number_byte(b: u8) -> bool {
    matches!(b, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
}

fn invalid_character(b: u8, position: usize, state: &'static str) -> DecodeError {
    DecodeError::InvalidCharacter {
        found: Value::String(char::from(b).to_string()).to_string(),
        position,
        state,
    }
}
